/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{future, SinkExt, StreamExt};
use palaver_protocol::SignalEnvelope;
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span};

use crate::config::ServerConfig;
use crate::session::{run_session, SessionContext};

pub const SCRIPT_TEMPLATE: &str = "js/webRTC.js";

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<SessionContext>,
    pub cfg: Arc<ServerConfig>,
    /// Client script with the signaling port filled in.
    pub script: Arc<str>,
}

pub fn render_script(template: &str, port: u16) -> String {
    template.replace("{{port}}", &port.to_string())
}

pub fn load_script(template_dir: &Path, port: u16) -> Result<String> {
    let path = template_dir.join(SCRIPT_TEMPLATE);
    let template = std::fs::read_to_string(&path).with_context(|| format!("read template {}", path.display()))?;
    Ok(render_script(&template, port))
}

pub fn router(state: AppState) -> Router {
    let static_dir = state.cfg.static_dir.clone();
    Router::new()
        .route("/websocket", get(websocket))
        .route("/templates/js/webRTC.js", get(client_script))
        .route("/healthz", get(healthz))
        .fallback_service(ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
            info_span!("http", method = %req.method(), uri = %req.uri())
        }))
        .with_state(state)
}

async fn client_script(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "application/javascript; charset=utf-8")],
        state.script.to_string(),
    )
        .into_response()
}

#[derive(Serialize)]
struct Health {
    ok: bool,
    users: usize,
    conferences: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        ok: true,
        users: state.ctx.registry.len(),
        conferences: state.ctx.calls.conferences().len(),
    })
}

async fn websocket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    info!("signaling socket connected");
    let (mut ws_tx, ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<SignalEnvelope>(64);

    let writer = tokio::spawn(async move {
        while let Some(env) = rx.recv().await {
            let json = match env.to_json() {
                Ok(v) => v,
                Err(e) => {
                    error!("serialize envelope failed: {e}");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let inbound = ws_rx.filter_map(|msg| {
        future::ready(match msg {
            Ok(Message::Text(text)) => Some(Ok(text)),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        })
    });
    run_session(state.ctx.clone(), Box::pin(inbound), tx).await;

    if let Err(e) = writer.await {
        error!("socket writer panicked: {e}");
    }
    info!("signaling socket disconnected");
}
