//! Minimal runtime configuration helpers.
//! Defaults align with a controller running locally on its default port.

use crate::models::fermentation::UnitSystem;
use crate::services::live::Backoff;
use crate::services::orchestrator::SyncSettings;
use crate::services::reconciler::DEFAULT_RECENT_LOG_LIMIT;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://localhost:8000/api";
pub const DEFAULT_POLL_SECS: u64 = 30;
pub const DEFAULT_RECONNECT_MIN_MS: u64 = 1000;
pub const DEFAULT_RECONNECT_MAX_SECS: u64 = 30;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
/// Upper bound for both reconnect settings. One day.
pub const MAX_RECONNECT_SECS: u64 = 24 * 60 * 60;
pub const PUSH_CHANNEL_PATH: &str = "/dashboard/ws";

#[derive(Debug, Clone)]
pub struct Config {
    /// REST base URL, e.g. `http://brewpi.local:8000/api`.
    pub api_url: String,
    /// Push channel URL. Derived from `api_url` unless set explicitly.
    pub ws_url: String,
    /// Bearer credential for deployments with authentication enabled.
    pub api_token: Option<String>,
    /// Fallback poll cadence.
    pub poll_interval: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub request_timeout: Duration,
    /// Recent-log samples kept per batch in the live view.
    pub recent_log_limit: usize,
    /// Display unit; stored values stay Celsius.
    pub units: UnitSystem,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_url = var("FERMENT_API_URL")
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let ws_url = match var("FERMENT_WS_URL") {
            Some(url) => url,
            None => derive_ws_url(&api_url)?,
        };

        let poll_secs = parse_number(var("FALLBACK_POLL_SECS"), "FALLBACK_POLL_SECS", DEFAULT_POLL_SECS)?;
        if poll_secs == 0 {
            return Err("FALLBACK_POLL_SECS must be at least 1".to_string());
        }
        let reconnect_min_ms = parse_number(var("RECONNECT_MIN_MS"), "RECONNECT_MIN_MS", DEFAULT_RECONNECT_MIN_MS)?;
        let reconnect_max_secs = parse_number(
            var("RECONNECT_MAX_SECS"),
            "RECONNECT_MAX_SECS",
            DEFAULT_RECONNECT_MAX_SECS,
        )?;
        if reconnect_min_ms == 0 || reconnect_min_ms > MAX_RECONNECT_SECS * 1000 {
            return Err(format!(
                "RECONNECT_MIN_MS must be between 1 and {}, got {}",
                MAX_RECONNECT_SECS * 1000,
                reconnect_min_ms
            ));
        }
        if reconnect_max_secs > MAX_RECONNECT_SECS {
            return Err(format!(
                "RECONNECT_MAX_SECS must be at most {}, got {}",
                MAX_RECONNECT_SECS, reconnect_max_secs
            ));
        }
        let timeout_secs = parse_number(
            var("REQUEST_TIMEOUT_SECS"),
            "REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?;
        let recent_log_limit = parse_number(
            var("RECENT_LOG_LIMIT"),
            "RECENT_LOG_LIMIT",
            DEFAULT_RECENT_LOG_LIMIT as u64,
        )? as usize;

        let units = match var("UNITS_TEMPERATURE") {
            Some(s) => UnitSystem::parse(&s)
                .ok_or_else(|| format!("UNITS_TEMPERATURE must be celsius or fahrenheit, got {:?}", s))?,
            None => UnitSystem::Celsius,
        };

        let reconnect_min = Duration::from_millis(reconnect_min_ms);
        let reconnect_max = Duration::from_secs(reconnect_max_secs).max(reconnect_min);

        Ok(Config {
            api_url,
            ws_url,
            api_token: var("FERMENT_API_TOKEN"),
            poll_interval: Duration::from_secs(poll_secs),
            reconnect_min,
            reconnect_max,
            request_timeout: Duration::from_secs(timeout_secs),
            recent_log_limit,
            units,
        })
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            poll_interval: self.poll_interval,
            reconnect: Backoff {
                initial: self.reconnect_min,
                max: self.reconnect_max,
                ..Backoff::default()
            },
        }
    }
}

fn parse_number(raw: Option<String>, name: &str, default: u64) -> Result<u64, String> {
    match raw {
        Some(s) => s
            .parse::<u64>()
            .map_err(|_| format!("{} must be a non-negative integer, got {:?}", name, s)),
        None => Ok(default),
    }
}

/// `http://host/api` -> `ws://host/api/dashboard/ws`, `https` -> `wss`.
pub fn derive_ws_url(api_url: &str) -> Result<String, String> {
    let base = api_url.trim_end_matches('/');
    let rest = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        return Err(format!("FERMENT_API_URL must start with http:// or https://, got {:?}", api_url));
    };
    Ok(format!("{}{}", rest, PUSH_CHANNEL_PATH))
}
