use crate::api::{ChatOptions, ModelDetails};
use crate::json::JsonValue;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_HOST: &str = "localhost:11434";

/// How long to wait for the server before giving up.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApiTimeout {
    ThirtySeconds,
    #[default]
    OneMinute,
    FiveMinutes,
    Unlimited,
}

impl ApiTimeout {
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            ApiTimeout::ThirtySeconds => Some(Duration::from_secs(30)),
            ApiTimeout::OneMinute => Some(Duration::from_secs(60)),
            ApiTimeout::FiveMinutes => Some(Duration::from_secs(300)),
            ApiTimeout::Unlimited => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub api_timeout: ApiTimeout,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "Local".to_string(),
            host: DEFAULT_HOST.to_string(),
            api_timeout: ApiTimeout::default(),
        }
    }
}

impl ServerConfig {
    /// `host` with a scheme, without a trailing slash.
    pub fn base_url(&self) -> String {
        let host = self.host.trim().trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("http://{}", host)
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThinkSetting {
    /// Let the server decide; reasoning may arrive inline as `<think>` tags.
    #[default]
    Auto,
    On,
    Off,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct SamplingOptions {
    pub top_k: Option<u32>,
    pub top_p: Option<f64>,
    pub min_p: Option<f64>,
    pub repeat_penalty: Option<f64>,
    pub seed: Option<i64>,
    pub num_predict: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ChatSettings {
    pub model: String,
    pub stream: bool,
    pub system_prompt: Option<String>,
    pub custom_settings_enabled: bool,
    pub temperature_enabled: bool,
    pub temperature: f64,
    pub context_window_enabled: bool,
    pub context_window: u32,
    pub think: ThinkSetting,
    pub sampling: SamplingOptions,
    pub tools: Vec<JsonValue>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            model: String::new(),
            stream: true,
            system_prompt: None,
            custom_settings_enabled: false,
            temperature_enabled: false,
            temperature: 0.8,
            context_window_enabled: false,
            context_window: 2048,
            think: ThinkSetting::default(),
            sampling: SamplingOptions::default(),
            tools: Vec::new(),
        }
    }
}

impl ChatSettings {
    /// The `options` object for a request, or None unless custom settings are on.
    /// `details` caps the context window at what the model supports.
    pub fn request_options(&self, details: Option<&ModelDetails>) -> Option<ChatOptions> {
        if !self.custom_settings_enabled {
            return None;
        }

        let mut options = ChatOptions {
            top_k: self.sampling.top_k,
            top_p: self.sampling.top_p,
            min_p: self.sampling.min_p,
            repeat_penalty: self.sampling.repeat_penalty,
            seed: self.sampling.seed,
            num_predict: self.sampling.num_predict,
            ..ChatOptions::default()
        };
        if self.temperature_enabled {
            options.temperature = Some(self.temperature);
        }
        if self.context_window_enabled {
            let max = details.and_then(ModelDetails::context_length);
            options.num_ctx = Some(match max {
                Some(max) if self.context_window > max => {
                    log::warn!(
                        "Context window {} exceeds model maximum {}, clamping",
                        self.context_window,
                        max
                    );
                    max
                }
                _ => self.context_window,
            });
        }
        Some(options)
    }

    /// The `think` flag for a request. Models known to lack the `thinking`
    /// capability never get one.
    pub fn think_flag(&self, details: Option<&ModelDetails>) -> Option<bool> {
        let capable = details.map_or(true, |d| d.has_capability("thinking"));
        match self.think {
            ThinkSetting::On if capable => Some(true),
            ThinkSetting::Off if capable => Some(false),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub chat: ChatSettings,
}

impl AppConfig {
    /// Reads the config at `path`, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, text).with_context(|| format!("Failed to write config file {}", path.display()))
    }

    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("mocolamma").join("config.json"))
    }

    /// `OLLAMA_HOST` replaces the server host and `MOCOLAMMA_MODEL` the model.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("OLLAMA_HOST") {
            if !host.trim().is_empty() {
                log::debug!("Using server host from OLLAMA_HOST: {}", host);
                self.server.host = host;
            }
        }
        if let Ok(model) = std::env::var("MOCOLAMMA_MODEL") {
            if !model.trim().is_empty() {
                self.chat.model = model;
            }
        }
    }
}
