/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

pub const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub static_dir: PathBuf,
    pub template_dir: PathBuf,
    pub ice_urls: Vec<String>,
    pub ice_username: Option<String>,
    pub ice_credential: Option<String>,
    pub pli_interval: Duration,
    /// Longest an idle session waits before re-running presence reconciliation.
    pub presence_poll: Duration,
    pub ice_gather_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            static_dir: PathBuf::from("static"),
            template_dir: PathBuf::from("templates"),
            ice_urls: vec![DEFAULT_STUN.to_string()],
            ice_username: None,
            ice_credential: None,
            pli_interval: crate::media_relay::DEFAULT_PLI_INTERVAL,
            presence_poll: Duration::from_millis(250),
            ice_gather_timeout: Duration::from_secs(10),
        }
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_u64(var: &str, v: Option<String>, default: u64, min: u64, max: u64) -> Result<u64> {
    match non_empty(v) {
        Some(s) => {
            let n: u64 = s.parse().with_context(|| format!("{var} must be an integer, got {s:?}"))?;
            Ok(n.clamp(min, max))
        }
        None => Ok(default),
    }
}

impl ServerConfig {
    /// Reads `PALAVER_*` variables through `get`; unset ones keep [`ServerConfig::default`].
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(bind) = non_empty(get("PALAVER_BIND")) {
            cfg.bind = bind
                .parse()
                .with_context(|| format!("PALAVER_BIND invalid: {bind:?}"))?;
        }
        if let Some(dir) = non_empty(get("PALAVER_STATIC_DIR")) {
            cfg.static_dir = PathBuf::from(dir);
        }
        if let Some(dir) = non_empty(get("PALAVER_TEMPLATE_DIR")) {
            cfg.template_dir = PathBuf::from(dir);
        }
        if let Some(urls) = non_empty(get("PALAVER_ICE_URLS")) {
            cfg.ice_urls = parse_list(&urls);
        }
        cfg.ice_username = non_empty(get("PALAVER_ICE_USERNAME"));
        cfg.ice_credential = non_empty(get("PALAVER_ICE_CREDENTIAL"));

        let pli = parse_u64(
            "PALAVER_PLI_INTERVAL_SECS",
            get("PALAVER_PLI_INTERVAL_SECS"),
            cfg.pli_interval.as_secs(),
            1,
            60,
        )?;
        cfg.pli_interval = Duration::from_secs(pli);
        let poll = parse_u64(
            "PALAVER_PRESENCE_POLL_MS",
            get("PALAVER_PRESENCE_POLL_MS"),
            cfg.presence_poll.as_millis() as u64,
            20,
            5000,
        )?;
        cfg.presence_poll = Duration::from_millis(poll);
        let gather = parse_u64(
            "PALAVER_ICE_GATHER_TIMEOUT_SECS",
            get("PALAVER_ICE_GATHER_TIMEOUT_SECS"),
            cfg.ice_gather_timeout.as_secs(),
            1,
            60,
        )?;
        cfg.ice_gather_timeout = Duration::from_secs(gather);

        Ok(cfg)
    }
}

pub fn load_config() -> Result<ServerConfig> {
    ServerConfig::from_lookup(|k| std::env::var(k).ok())
}
