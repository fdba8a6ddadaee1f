//! Environment-driven configuration.
//!
//! Every knob has a hard default; nothing is required. Settings come from
//! `CONSOLE_*` environment variables, optionally seeded from a `.env` file
//! found in the current directory or an ancestor.

use std::time::Duration;

use crate::api::{ApiClient, ApiError};
use crate::coordinator::{StreamOptions, DEFAULT_MAX_EVENTS};
use crate::transport::{self, TransportConfig};

const DEFAULT_API_URL: &str = "http://localhost:8000/";

/// Load `.env` values into the process environment. Searches the current
/// directory and its ancestors so running from a member crate still picks
/// up a repo-root `.env`.
pub fn load_env_file() {
    let cwd = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            tracing::warn!(error = %e, "Could not determine current directory for .env lookup");
            return;
        }
    };

    let mut current = cwd.clone();
    loop {
        let candidate = current.join(".env");
        if candidate.exists() {
            match dotenvy::from_path(&candidate) {
                Ok(_) => {
                    tracing::info!(path = %candidate.display(), "Loaded environment from .env");
                }
                Err(e) => {
                    tracing::warn!(
                        path = %candidate.display(),
                        error = %e,
                        "Failed to load .env file"
                    );
                }
            }
            return;
        }

        if !current.pop() {
            break;
        }
    }

    tracing::info!(
        cwd = %cwd.display(),
        "No .env file found in current directory or ancestors; using process environment only"
    );
}

/// Resolved settings for API access, the socket transport, and stream
/// timing.
#[derive(Debug, Clone)]
pub struct ConsoleSettings {
    /// REST base URL (`CONSOLE_API_URL`).
    pub api_url: String,
    /// Bearer token for API requests (`CONSOLE_API_TOKEN`).
    pub api_token: Option<String>,
    /// Socket endpoint (`CONSOLE_SOCKET_URL`); derived from the API URL
    /// when unset.
    pub socket_url: String,
    /// Live buffer flush cadence (`CONSOLE_FLUSH_MS`).
    pub flush_interval: Duration,
    /// Events applied per flush tick (`CONSOLE_FLUSH_BATCH`).
    pub flush_batch: usize,
    /// Elapsed-ticker cadence (`CONSOLE_ELAPSED_MS`).
    pub elapsed_interval: Duration,
    /// Display ceiling when the server sends none (`CONSOLE_MAX_EVENTS`).
    pub default_max_events: u64,
    /// First reconnect delay (`CONSOLE_RECONNECT_BASE_MS`).
    pub reconnect_base: Duration,
    /// Reconnect delay ceiling (`CONSOLE_RECONNECT_MAX_MS`).
    pub reconnect_max: Duration,
    /// Socket handshake timeout (`CONSOLE_CONNECT_TIMEOUT_MS`).
    pub connect_timeout: Duration,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        let transport = TransportConfig::default();
        let stream = StreamOptions::default();
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_token: None,
            socket_url: default_socket_url(DEFAULT_API_URL),
            flush_interval: stream.flush_interval,
            flush_batch: stream.flush_batch,
            elapsed_interval: stream.elapsed_interval,
            default_max_events: DEFAULT_MAX_EVENTS,
            reconnect_base: transport.base_interval,
            reconnect_max: transport.max_interval,
            connect_timeout: transport.connect_timeout,
        }
    }
}

impl ConsoleSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let api_url = env_string("CONSOLE_API_URL").unwrap_or(defaults.api_url);
        let socket_url =
            env_string("CONSOLE_SOCKET_URL").unwrap_or_else(|| default_socket_url(&api_url));
        Self {
            socket_url,
            api_token: env_string("CONSOLE_API_TOKEN"),
            flush_interval: env_ms("CONSOLE_FLUSH_MS", defaults.flush_interval),
            flush_batch: env_parse("CONSOLE_FLUSH_BATCH", defaults.flush_batch),
            elapsed_interval: env_ms("CONSOLE_ELAPSED_MS", defaults.elapsed_interval),
            default_max_events: env_parse("CONSOLE_MAX_EVENTS", defaults.default_max_events),
            reconnect_base: env_ms("CONSOLE_RECONNECT_BASE_MS", defaults.reconnect_base),
            reconnect_max: env_ms("CONSOLE_RECONNECT_MAX_MS", defaults.reconnect_max),
            connect_timeout: env_ms("CONSOLE_CONNECT_TIMEOUT_MS", defaults.connect_timeout),
            api_url,
        }
    }

    pub fn api_client(&self) -> Result<ApiClient, ApiError> {
        ApiClient::new(&self.api_url, self.api_token.clone())
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            flush_interval: self.flush_interval,
            flush_batch: self.flush_batch,
            elapsed_interval: self.elapsed_interval,
            default_max_events: self.default_max_events,
            transport: TransportConfig {
                base_interval: self.reconnect_base,
                max_interval: self.reconnect_max,
                connect_timeout: self.connect_timeout,
                ..TransportConfig::default()
            },
        }
    }
}

/// The conventional socket endpoint for an API base: same host, ws scheme,
/// `websocket/` path.
fn default_socket_url(api_url: &str) -> String {
    let base = transport::http_to_ws_url(api_url);
    if base.ends_with('/') {
        format!("{base}websocket/")
    } else {
        format!("{base}/websocket/")
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_ms(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

// ============================================================================
// Tests
// ============================================================================
