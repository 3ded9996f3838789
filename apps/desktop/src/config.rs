use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::Context;
use client_core::{SessionConfig, DEFAULT_CAPTION_BACKEND_URL};
use engine_integration::{
    script::{DEFAULT_CONSTRUCTOR, DEFAULT_SCRIPT_URL},
    ExternalApiScript, DEFAULT_ENGINE_DOMAIN,
};

pub const DEFAULT_SETTINGS_FILE: &str = "meet.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub engine_domain: String,
    pub engine_script_url: String,
    pub engine_constructor: String,
    pub verify_engine_script: bool,
    pub caption_backend_url: String,
    pub engine_load_timeout_ms: u64,
    pub caption_connect_timeout_ms: u64,
    pub caption_display_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            engine_domain: DEFAULT_ENGINE_DOMAIN.into(),
            engine_script_url: DEFAULT_SCRIPT_URL.into(),
            engine_constructor: DEFAULT_CONSTRUCTOR.into(),
            verify_engine_script: false,
            caption_backend_url: DEFAULT_CAPTION_BACKEND_URL.into(),
            engine_load_timeout_ms: duration_ms(session.engine_load_timeout),
            caption_connect_timeout_ms: duration_ms(session.caption_connect_timeout),
            caption_display_ms: duration_ms(session.caption_display_duration),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Settings {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            engine_domain: self.engine_domain.clone(),
            engine_load_timeout: Duration::from_millis(self.engine_load_timeout_ms),
            caption_connect_timeout: Duration::from_millis(self.caption_connect_timeout_ms),
            caption_display_duration: Duration::from_millis(self.caption_display_ms),
        }
    }

    pub fn engine_script(&self) -> ExternalApiScript {
        ExternalApiScript::new(&self.engine_script_url, &self.engine_constructor)
    }
}

/// Defaults, then the settings file, then `MEET_*` and `APP__*` variables.
///
/// An explicitly requested file must exist; the default `meet.toml` is optional.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    let raw = match path {
        Some(path) => Some(
            fs::read_to_string(path)
                .with_context(|| format!("failed to read settings file '{}'", path.display()))?,
        ),
        None => fs::read_to_string(DEFAULT_SETTINGS_FILE).ok(),
    };
    if let Some(raw) = raw {
        apply_file(&mut settings, &raw)?;
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_file(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file_cfg = toml::from_str::<HashMap<String, toml::Value>>(raw)
        .context("settings file is not a flat key/value table")?;

    for (key, value) in file_cfg {
        let value = match value {
            toml::Value::String(v) => v,
            toml::Value::Table(_) | toml::Value::Array(_) => {
                anyhow::bail!("setting '{key}' must be a plain value")
            }
            other => other.to_string(),
        };
        apply_value(settings, &key, value);
    }
    Ok(())
}

const KEYS: [&str; 8] = [
    "engine_domain",
    "engine_script_url",
    "engine_constructor",
    "verify_engine_script",
    "caption_backend_url",
    "engine_load_timeout_ms",
    "caption_connect_timeout_ms",
    "caption_display_ms",
];

fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    for key in KEYS {
        let upper = key.to_ascii_uppercase();
        if let Some(v) = lookup(&format!("MEET_{upper}")) {
            apply_value(settings, key, v);
        }
        if let Some(v) = lookup(&format!("APP__{upper}")) {
            apply_value(settings, key, v);
        }
    }
}

fn apply_value(settings: &mut Settings, key: &str, value: String) {
    match key {
        "engine_domain" => settings.engine_domain = value,
        "engine_script_url" => settings.engine_script_url = value,
        "engine_constructor" => settings.engine_constructor = value,
        "caption_backend_url" => settings.caption_backend_url = value,
        "verify_engine_script" => {
            if let Ok(parsed) = value.trim().parse::<bool>() {
                settings.verify_engine_script = parsed;
            }
        }
        "engine_load_timeout_ms" => {
            if let Ok(parsed) = value.trim().parse::<u64>() {
                settings.engine_load_timeout_ms = parsed;
            }
        }
        "caption_connect_timeout_ms" => {
            if let Ok(parsed) = value.trim().parse::<u64>() {
                settings.caption_connect_timeout_ms = parsed;
            }
        }
        "caption_display_ms" => {
            if let Ok(parsed) = value.trim().parse::<u64>() {
                settings.caption_display_ms = parsed;
            }
        }
        other => tracing::warn!(key = other, "config: unknown setting ignored"),
    }
}
