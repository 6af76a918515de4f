//! Configuration module for foliobot.
//!
//! Loads typed configuration from `~/.foliobot/config.json`.
//! All fields use `serde` for zero-boilerplate deserialization.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub providers: ProvidersConfig,
    pub assistant: AssistantConfig,
    pub calendar: CalendarConfig,
    pub realtime: RealtimeConfig,
    pub engine: EngineConfig,
    pub gateway: GatewayConfig,
}

impl Config {
    /// Load configuration from the default path (`~/.foliobot/config.json`).
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Get the default config file path.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".foliobot")
            .join("config.json")
    }

    /// Write the default config template to disk.
    pub fn write_default_template() -> anyhow::Result<PathBuf> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let template = serde_json::json!({
            "providers": {
                "gemini": { "apiKey": "" },
                "anthropic": { "apiKey": "" },
                "openai": { "apiKey": "" }
            },
            "calendar": {
                "apiKey": "",
                "eventTypeId": ""
            },
            "engine": {
                "baseUrl": "http://localhost:11434"
            }
        });

        std::fs::write(&path, serde_json::to_string_pretty(&template)?)?;
        Ok(path)
    }
}

// ── Provider Configuration ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderEntry {
    pub api_key: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub gemini: Option<ProviderEntry>,
    pub anthropic: Option<ProviderEntry>,
    pub openai: Option<ProviderEntry>,
}

impl ProvidersConfig {
    /// All providers with a non-empty API key, in fixed failover priority
    /// order. The order here is the order the failover client tries them.
    pub fn find_all_active(&self) -> Vec<(&'static str, &ProviderEntry)> {
        let candidates: [(&'static str, &Option<ProviderEntry>); 3] = [
            ("gemini", &self.gemini),
            ("anthropic", &self.anthropic),
            ("openai", &self.openai),
        ];

        candidates
            .into_iter()
            .filter_map(|(name, entry)| {
                entry
                    .as_ref()
                    .filter(|e| !e.api_key.is_empty())
                    .map(|e| (name, e))
            })
            .collect()
    }
}

// ── Assistant Configuration ─────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AssistantConfig {
    pub max_tokens: u32,
    pub temperature: f32,
    /// How many past messages are handed to a backend per turn.
    pub history_window: usize,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            temperature: 0.7,
            history_window: 50,
        }
    }
}

// ── Calendar Configuration ──────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CalendarConfig {
    pub api_key: String,
    pub event_type_id: String,
    pub api_version: String,
    pub base_url: String,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            event_type_id: String::new(),
            api_version: "2024-08-13".into(),
            base_url: "https://api.cal.com/v2".into(),
        }
    }
}

// ── Realtime Configuration ──────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RealtimeConfig {
    /// Trusted endpoint that mints short-lived client secrets. The
    /// long-lived upstream key never reaches the session manager.
    pub session_endpoint: String,
    pub base_url: String,
    pub model: String,
    pub voice: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            session_endpoint: "http://127.0.0.1:18790/session".into(),
            base_url: "wss://api.openai.com/v1/realtime".into(),
            model: "gpt-4o-realtime-preview".into(),
            voice: "alloy".into(),
        }
    }
}

// ── Engine Configuration ────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Base URL of the local model runtime (Ollama-compatible).
    pub base_url: String,
    /// Overrides the hardware-recommended model when set.
    pub default_model: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".into(),
            default_model: None,
        }
    }
}

// ── Gateway Configuration ───────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Long-lived realtime API key, used only by the minting endpoint.
    pub realtime_api_key: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 18790,
            realtime_api_key: String::new(),
        }
    }
}
