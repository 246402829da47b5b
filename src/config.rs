use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::persona::{CommunicationStyle, PersonaTrait, RelationshipProfile};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_max_messages")]
    pub max_messages_per_conversation: usize,
    #[serde(default = "default_window_days")]
    pub context_window_days: i64,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
}

fn default_max_messages() -> usize {
    100
}

fn default_window_days() -> i64 {
    30
}

fn default_retention_days() -> i64 {
    30
}

fn default_eviction_interval_secs() -> u64 {
    3600
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_messages_per_conversation: default_max_messages(),
            context_window_days: default_window_days(),
            retention_days: default_retention_days(),
            eviction_interval_secs: default_eviction_interval_secs(),
        }
    }
}

/// Ollama endpoint and sampling options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default = "default_generator_url")]
    pub base_url: String,
    #[serde(default = "default_generator_model")]
    pub model: String,
    #[serde(default = "default_generator_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_generator_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_generator_model() -> String {
    "llama3.1".to_string()
}

fn default_generator_timeout_secs() -> u64 {
    60
}

fn default_max_tokens() -> u32 {
    500
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

fn default_repeat_penalty() -> f32 {
    1.1
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base_url: default_generator_url(),
            model: default_generator_model(),
            timeout_secs: default_generator_timeout_secs(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            repeat_penalty: default_repeat_penalty(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub token: Option<String>,
    /// Empty means any chat is accepted.
    #[serde(default)]
    pub allowed_chat_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    /// Base communication style applied when no relationship overrides it.
    #[serde(default)]
    pub style: CommunicationStyle,

    #[serde(default = "default_response_probability")]
    pub response_probability: f32,

    #[serde(default)]
    pub ignore_senders: Vec<String>,

    #[serde(default = "default_response_triggers")]
    pub response_triggers: Vec<String>,

    #[serde(default = "default_active_hours_start")]
    pub active_hours_start: String,
    #[serde(default = "default_active_hours_end")]
    pub active_hours_end: String,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub generator: GeneratorConfig,

    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Trait table; the stock traits are installed when this is empty.
    #[serde(default)]
    pub traits: Vec<PersonaTrait>,

    /// Pre-registered relationship profiles.
    #[serde(default)]
    pub relationships: Vec<RelationshipProfile>,
}

fn default_response_probability() -> f32 {
    0.8
}

fn default_response_triggers() -> Vec<String> {
    vec![
        "help".to_string(),
        "question".to_string(),
        "urgent".to_string(),
        "please".to_string(),
    ]
}

fn default_active_hours_start() -> String {
    "08:00".to_string()
}

fn default_active_hours_end() -> String {
    "22:00".to_string()
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            style: CommunicationStyle::default(),
            response_probability: default_response_probability(),
            ignore_senders: Vec::new(),
            response_triggers: default_response_triggers(),
            active_hours_start: default_active_hours_start(),
            active_hours_end: default_active_hours_end(),
            context: ContextConfig::default(),
            generator: GeneratorConfig::default(),
            telegram: TelegramConfig::default(),
            traits: Vec::new(),
            relationships: Vec::new(),
        }
    }
}

impl PersonaConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Path to the config file (next to the executable).
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("doppel_config.toml")
    }

    /// Load config from doppel_config.toml, falling back to defaults plus
    /// environment overrides.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<PersonaConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config.with_env_overrides();
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::default().with_env_overrides()
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Apply environment variable overrides on top of whatever was loaded.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = env::var("DOPPEL_GENERATOR_URL") {
            self.generator.base_url = url;
        }

        if let Ok(model) = env::var("DOPPEL_GENERATOR_MODEL") {
            self.generator.model = model;
        }

        if let Ok(token) = env::var("DOPPEL_TELEGRAM_TOKEN") {
            if !token.trim().is_empty() {
                self.telegram.token = Some(token.trim().to_string());
            }
        }

        if let Ok(probability) = env::var("DOPPEL_RESPONSE_PROBABILITY") {
            if let Ok(value) = probability.parse::<f32>() {
                self.response_probability = value.clamp(0.0, 1.0);
            }
        }

        if let Ok(capacity) = env::var("DOPPEL_HISTORY_CAPACITY") {
            if let Ok(value) = capacity.parse() {
                self.context.max_messages_per_conversation = value;
            }
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PersonaConfig::default();
        assert!((config.response_probability - 0.8).abs() < f32::EPSILON);
        assert_eq!(
            config.response_triggers,
            vec!["help", "question", "urgent", "please"]
        );
        assert_eq!(config.active_hours_start, "08:00");
        assert_eq!(config.active_hours_end, "22:00");
        assert_eq!(config.context.max_messages_per_conversation, 100);
        assert_eq!(config.context.context_window_days, 30);
        assert_eq!(config.generator.model, "llama3.1");
        assert_eq!(config.generator.timeout_secs, 60);
        assert!(config.ignore_senders.is_empty());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: PersonaConfig = toml::from_str(
            r#"
            response_probability = 0.5
            ignore_senders = ["spammer"]

            [generator]
            model = "mistral"
            "#,
        )
        .unwrap();

        assert!((config.response_probability - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.ignore_senders, vec!["spammer"]);
        assert_eq!(config.generator.model, "mistral");
        assert_eq!(config.generator.base_url, "http://localhost:11434");
        assert_eq!(config.context.retention_days, 30);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let mut config = PersonaConfig::default();
        config.response_probability = 0.65;
        config.ignore_senders.push("noisy".to_string());

        let serialized = toml::to_string_pretty(&config).unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        fs::write(file.path(), &serialized).unwrap();

        let reloaded: PersonaConfig =
            toml::from_str(&fs::read_to_string(file.path()).unwrap()).unwrap();
        assert!((reloaded.response_probability - 0.65).abs() < f32::EPSILON);
        assert_eq!(reloaded.ignore_senders, vec!["noisy"]);
    }

    #[test]
    fn env_overrides_apply_and_clamp() {
        env::set_var("DOPPEL_GENERATOR_MODEL", "phi3");
        env::set_var("DOPPEL_RESPONSE_PROBABILITY", "2.5");

        let config = PersonaConfig::default().with_env_overrides();

        env::remove_var("DOPPEL_GENERATOR_MODEL");
        env::remove_var("DOPPEL_RESPONSE_PROBABILITY");

        assert_eq!(config.generator.model, "phi3");
        assert!((config.response_probability - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn relationship_table_parses() {
        let config: PersonaConfig = toml::from_str(
            r#"
            [[relationships]]
            contact = "mara"
            kind = "friend"
            closeness = 0.9

            [relationships.trait_adjustments]
            friendliness = 0.2
            "#,
        )
        .unwrap();

        assert_eq!(config.relationships.len(), 1);
        let profile = &config.relationships[0];
        assert_eq!(profile.contact, "mara");
        assert!((profile.closeness - 0.9).abs() < f32::EPSILON);
        assert_eq!(profile.trait_adjustments["friendliness"], 0.2);
    }
}
