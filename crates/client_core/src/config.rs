use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::error::ChannelError;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:5050/api";
pub const DEFAULT_SETTINGS_FILE: &str = "chat.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub ws_url: Option<String>,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Mark peer messages read as they arrive in the open, visible conversation.
    pub live_mark_read: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.into(),
            ws_url: None,
            reconnect_initial_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(15),
            live_mark_read: true,
        }
    }
}

impl ClientSettings {
    /// The configured socket URL, or one derived from the API base.
    pub fn resolved_ws_url(&self) -> Result<Url, ChannelError> {
        match &self.ws_url {
            Some(raw) => Url::parse(raw).map_err(|err| ChannelError::InvalidUrl {
                url: raw.clone(),
                reason: err.to_string(),
            }),
            None => derive_ws_url(&self.api_base_url),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_base_url: Option<String>,
    ws_url: Option<String>,
    reconnect_initial_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
    live_mark_read: Option<bool>,
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Defaults, then the TOML file at `path` when present, then environment
/// overrides looked up through `env`.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.api_base_url {
                    settings.api_base_url = v;
                }
                if let Some(v) = file_cfg.ws_url {
                    settings.ws_url = Some(v);
                }
                if let Some(v) = file_cfg.reconnect_initial_delay_ms {
                    settings.reconnect_initial_delay = Duration::from_millis(v);
                }
                if let Some(v) = file_cfg.reconnect_max_delay_ms {
                    settings.reconnect_max_delay = Duration::from_millis(v);
                }
                if let Some(v) = file_cfg.live_mark_read {
                    settings.live_mark_read = v;
                }
            }
            Err(err) => warn!(path = %path.display(), "ignoring unreadable settings file: {err}"),
        }
    }

    if let Some(v) = env("CHAT_API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = env("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }

    if let Some(v) = env("CHAT_WS_URL") {
        settings.ws_url = Some(v);
    }
    if let Some(v) = env("APP__WS_URL") {
        settings.ws_url = Some(v);
    }

    if let Some(v) = env("APP__RECONNECT_INITIAL_DELAY_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_initial_delay = Duration::from_millis(parsed);
        }
    }
    if let Some(v) = env("APP__RECONNECT_MAX_DELAY_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_max_delay = Duration::from_millis(parsed);
        }
    }
    if let Some(v) = env("APP__LIVE_MARK_READ") {
        if let Ok(parsed) = v.parse::<bool>() {
            settings.live_mark_read = parsed;
        }
    }

    settings.api_base_url = normalize_api_base(&settings.api_base_url);
    if settings.reconnect_max_delay < settings.reconnect_initial_delay {
        settings.reconnect_max_delay = settings.reconnect_initial_delay;
    }
    settings
}

pub fn normalize_api_base(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return DEFAULT_API_BASE_URL.to_string();
    }
    trimmed.to_string()
}

/// `http(s)://host/api` becomes `ws(s)://host/ws`.
pub fn derive_ws_url(api_base_url: &str) -> Result<Url, ChannelError> {
    let base = normalize_api_base(api_base_url);
    let origin = base.strip_suffix("/api").unwrap_or(&base);
    let ws_origin = if let Some(rest) = origin.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = origin.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if origin.starts_with("ws://") || origin.starts_with("wss://") {
        origin.to_string()
    } else {
        return Err(ChannelError::InvalidUrl {
            url: api_base_url.to_string(),
            reason: "api base must start with http://, https://, ws:// or wss://".into(),
        });
    };

    let raw = format!("{ws_origin}/ws");
    Url::parse(&raw).map_err(|err| ChannelError::InvalidUrl {
        url: raw,
        reason: err.to_string(),
    })
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
