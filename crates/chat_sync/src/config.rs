use std::{fs, path::Path, time::Duration};

use crate::error::SyncError;

pub const DEFAULT_SETTINGS_FILE: &str = "chat_sync.toml";
const ENV_PREFIX: &str = "CHAT_SYNC__";

#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub server_url: String,
    pub conversation_poll_interval: Duration,
    pub list_poll_interval: Duration,
    /// Keep polling the open conversation while the push channel is healthy.
    pub poll_while_connected: bool,
    pub read_debounce: Duration,
    pub list_visibility_threshold: f32,
    pub detail_visibility_threshold: f32,
    pub typing_timeout: Duration,
    pub typing_idle_stop: Duration,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconcile_tolerance: Duration,
    /// Upper bound on any single HTTP exchange, polls included.
    pub request_timeout: Duration,
    pub assistant_context_messages: usize,
    pub event_buffer: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            conversation_poll_interval: Duration::from_secs(3),
            list_poll_interval: Duration::from_secs(10),
            poll_while_connected: true,
            read_debounce: Duration::from_millis(500),
            list_visibility_threshold: 0.5,
            detail_visibility_threshold: 0.6,
            typing_timeout: Duration::from_secs(3),
            typing_idle_stop: Duration::from_millis(1500),
            reconnect_max_attempts: 6,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            reconcile_tolerance: Duration::from_secs(5),
            request_timeout: Duration::from_secs(15),
            assistant_context_messages: 20,
            event_buffer: 1024,
        }
    }
}

/// Loads settings from `chat_sync.toml` in the working directory, then
/// applies `CHAT_SYNC__*` environment overrides.
pub fn load_settings() -> Result<SyncSettings, SyncError> {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| {
        std::env::var(key).ok()
    })
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<SyncSettings, SyncError> {
    let mut settings = SyncSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        let table = raw.parse::<toml::Table>().map_err(|err| {
            SyncError::Config(format!("failed to parse '{}': {err}", path.display()))
        })?;
        for (key, value) in &table {
            let value = match value {
                toml::Value::String(v) => v.clone(),
                toml::Value::Integer(v) => v.to_string(),
                toml::Value::Float(v) => v.to_string(),
                toml::Value::Boolean(v) => v.to_string(),
                other => {
                    return Err(SyncError::Config(format!(
                        "unsupported value for '{key}': {other}"
                    )))
                }
            };
            apply(&mut settings, key, &value)?;
        }
    }

    for key in KNOWN_KEYS {
        if let Some(value) = env(&format!("{ENV_PREFIX}{}", key.to_ascii_uppercase())) {
            apply(&mut settings, key, &value)?;
        }
    }

    validate(&settings)?;
    Ok(settings)
}

const KNOWN_KEYS: &[&str] = &[
    "server_url",
    "conversation_poll_ms",
    "list_poll_ms",
    "poll_while_connected",
    "read_debounce_ms",
    "list_visibility_threshold",
    "detail_visibility_threshold",
    "typing_timeout_ms",
    "typing_idle_stop_ms",
    "reconnect_max_attempts",
    "reconnect_base_delay_ms",
    "reconnect_max_delay_ms",
    "reconcile_tolerance_ms",
    "request_timeout_ms",
    "assistant_context_messages",
    "event_buffer",
];

fn apply(settings: &mut SyncSettings, key: &str, value: &str) -> Result<(), SyncError> {
    match key {
        "server_url" => settings.server_url = value.trim().trim_end_matches('/').to_string(),
        "conversation_poll_ms" => settings.conversation_poll_interval = millis(key, value)?,
        "list_poll_ms" => settings.list_poll_interval = millis(key, value)?,
        "poll_while_connected" => settings.poll_while_connected = parse(key, value)?,
        "read_debounce_ms" => settings.read_debounce = millis(key, value)?,
        "list_visibility_threshold" => settings.list_visibility_threshold = parse(key, value)?,
        "detail_visibility_threshold" => {
            settings.detail_visibility_threshold = parse(key, value)?
        }
        "typing_timeout_ms" => settings.typing_timeout = millis(key, value)?,
        "typing_idle_stop_ms" => settings.typing_idle_stop = millis(key, value)?,
        "reconnect_max_attempts" => settings.reconnect_max_attempts = parse(key, value)?,
        "reconnect_base_delay_ms" => settings.reconnect_base_delay = millis(key, value)?,
        "reconnect_max_delay_ms" => settings.reconnect_max_delay = millis(key, value)?,
        "reconcile_tolerance_ms" => settings.reconcile_tolerance = millis(key, value)?,
        "request_timeout_ms" => settings.request_timeout = millis(key, value)?,
        "assistant_context_messages" => {
            settings.assistant_context_messages = parse(key, value)?
        }
        "event_buffer" => settings.event_buffer = parse(key, value)?,
        other => tracing::warn!(key = other, "ignoring unknown chat sync setting"),
    }
    Ok(())
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, SyncError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| SyncError::Config(format!("invalid value for '{key}': {value:?}")))
}

fn millis(key: &str, value: &str) -> Result<Duration, SyncError> {
    parse::<u64>(key, value).map(Duration::from_millis)
}

fn validate(settings: &SyncSettings) -> Result<(), SyncError> {
    if !settings.server_url.starts_with("http://") && !settings.server_url.starts_with("https://")
    {
        return Err(SyncError::Config(
            "server_url must start with http:// or https://".into(),
        ));
    }
    for (name, threshold) in [
        ("list_visibility_threshold", settings.list_visibility_threshold),
        ("detail_visibility_threshold", settings.detail_visibility_threshold),
    ] {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(SyncError::Config(format!(
                "{name} must be within (0, 1], got {threshold}"
            )));
        }
    }
    if settings.conversation_poll_interval.is_zero() || settings.list_poll_interval.is_zero() {
        return Err(SyncError::Config("poll intervals must be non-zero".into()));
    }
    if settings.request_timeout.is_zero() {
        return Err(SyncError::Config("request_timeout_ms must be non-zero".into()));
    }
    if settings.event_buffer == 0 {
        return Err(SyncError::Config("event_buffer must be non-zero".into()));
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
