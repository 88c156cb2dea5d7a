/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use palaver_server::conference::{CallSignaling, ConferenceDirectory};
use palaver_server::config::load_config;
use palaver_server::http::{load_script, router, AppState};
use palaver_server::registry::UserRegistry;
use palaver_server::session::SessionContext;
use palaver_server::webrtc_relay::WebrtcRelay;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse().context("log directive")?),
        )
        .init();

    let cfg = Arc::new(load_config()?);
    let script = load_script(&cfg.template_dir, cfg.bind.port())?;

    let registry = Arc::new(UserRegistry::new());
    let relay = Arc::new(WebrtcRelay::new(&cfg));
    let calls = Arc::new(CallSignaling::new(
        registry.clone(),
        Arc::new(ConferenceDirectory::new()),
        relay,
    ));
    let state = AppState {
        ctx: Arc::new(SessionContext {
            registry,
            calls,
            presence_poll: cfg.presence_poll,
        }),
        cfg: cfg.clone(),
        script: script.into(),
    };

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(cfg.bind)
        .await
        .with_context(|| format!("bind {}", cfg.bind))?;
    info!("palaver_server listening on http://{}", cfg.bind);
    info!(static_dir = %cfg.static_dir.display(), ice = ?cfg.ice_urls, "serving");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("ctrl_c handler failed: {e}");
            }
            info!("shutting down");
        })
        .await
        .context("serve")?;
    Ok(())
}
