//! Load config from file and environment.

use std::path::PathBuf;
use std::time::Duration;

use peerchan_core::{EngineConfig, IceServer, SessionConfig};
use serde::Deserialize;
use tracing::warn;

/// Daemon configuration. File: ~/.config/peerchan/config.toml or /etc/peerchan/config.toml.
/// Env overrides: PEERCHAN_QUEUE_CAPACITY, PEERCHAN_ITERATE_MS, PEERCHAN_STUN_URL,
/// PEERCHAN_ECHO_PREFIX, PEERCHAN_MESSAGES.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Event queue slots per session (default 10).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Pause between engine iterations in milliseconds (default 10).
    #[serde(default = "default_iterate_ms")]
    pub iterate_ms: u64,
    /// Optional STUN server; none means host candidates only.
    #[serde(default)]
    pub stun_url: Option<String>,
    /// Prepended to every echoed message (default "echo: ").
    #[serde(default = "default_echo_prefix")]
    pub echo_prefix: String,
    /// Round trips before exiting (default 3). Zero exits once the channel opens.
    #[serde(default = "default_messages")]
    pub messages: u32,
    /// Give up if the data channel is not open within this many seconds (default 10).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_queue_capacity() -> usize {
    10
}
fn default_iterate_ms() -> u64 {
    10
}
fn default_echo_prefix() -> String {
    "echo: ".to_string()
}
fn default_messages() -> u32 {
    3
}
fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            iterate_ms: default_iterate_ms(),
            stun_url: None,
            echo_prefix: default_echo_prefix(),
            messages: default_messages(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Config {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default()
            .queue_capacity(self.queue_capacity)
            .iterate_interval(Duration::from_millis(self.iterate_ms))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            ice_servers: self.stun_url.iter().map(|u| IceServer::stun(u)).collect(),
            ..EngineConfig::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(n) = var("PEERCHAN_QUEUE_CAPACITY").and_then(|s| s.parse::<usize>().ok()) {
        c.queue_capacity = n;
    }
    if let Some(ms) = var("PEERCHAN_ITERATE_MS").and_then(|s| s.parse::<u64>().ok()) {
        c.iterate_ms = ms;
    }
    if let Some(url) = var("PEERCHAN_STUN_URL") {
        c.stun_url = if url.trim().is_empty() {
            None
        } else {
            Some(url.trim().to_string())
        };
    }
    if let Some(prefix) = var("PEERCHAN_ECHO_PREFIX") {
        c.echo_prefix = prefix;
    }
    if let Some(n) = var("PEERCHAN_MESSAGES").and_then(|s| s.parse::<u32>().ok()) {
        c.messages = n;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerchan/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerchan/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let text = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read config file, using defaults");
            return None;
        }
    };
    match toml::from_str::<Config>(&text) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid config file, using defaults");
            None
        }
    }
}
