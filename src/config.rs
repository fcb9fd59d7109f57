//! Service configuration.
//!
//! An optional `config.toml` provides the base, and environment variables
//! override it; deployments that only set env vars work without any file.
//! The LLM is a strict opt-in: no provider credential means no LLM calls,
//! whatever the flag says.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Inbound `x-api-key` credential. The baked-in default exists for local
    /// runs only and must be overridden in any real deployment.
    pub api_key: String,
    pub bind: String,
    pub callback_url: Option<String>,
    pub retry_queue_path: PathBuf,
    pub llm: LlmConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
            bind: default_bind(),
            callback_url: None,
            retry_queue_path: default_retry_queue_path(),
            llm: LlmConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_concurrency: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            max_concurrency: default_llm_concurrency(),
        }
    }
}

fn default_api_key() -> String {
    "honeypot-dev-key".to_string()
}
fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_retry_queue_path() -> PathBuf {
    PathBuf::from("callback-retry.jsonl")
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_concurrency() -> usize {
    8
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config: AppConfig = if path.exists() {
            toml::from_str(&std::fs::read_to_string(path)?)?
        } else {
            AppConfig::default()
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Overlay environment variables. Takes a lookup so tests don't have to
    /// mutate process-global state.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

        if let Some(v) = non_empty(var("HONEYPOT_API_KEY")) {
            self.api_key = v;
        }
        if let Some(v) = non_empty(var("HONEYPOT_BIND")) {
            self.bind = v;
        }
        if let Some(v) = non_empty(var("CALLBACK_URL")) {
            self.callback_url = Some(v);
        }
        if let Some(v) = non_empty(var("RETRY_QUEUE_PATH")) {
            self.retry_queue_path = PathBuf::from(v);
        }
        if let Some(v) = non_empty(var("LLM_ENABLED")) {
            self.llm.enabled = is_truthy(&v);
        }
        if let Some(v) = non_empty(var("LLM_API_KEY")) {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = non_empty(var("LLM_BASE_URL")) {
            self.llm.base_url = v;
        }
        if let Some(v) = non_empty(var("LLM_MODEL")) {
            self.llm.model = v;
        }
    }

    /// The LLM is only effectively on when the kill-switch is on AND a
    /// provider credential is present.
    pub fn llm_effectively_enabled(&self) -> bool {
        self.llm.enabled
            && self
                .llm
                .api_key
                .as_deref()
                .is_some_and(|k| !k.trim().is_empty())
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.api_key, "honeypot-dev-key");
        assert_eq!(config.bind, "0.0.0.0:8080");
        assert!(config.callback_url.is_none());
        assert!(!config.llm_effectively_enabled(), "no credential, no llm");
    }

    #[test]
    fn env_overrides_every_field() {
        let mut config = AppConfig::default();
        config.apply_env(env_from(&[
            ("HONEYPOT_API_KEY", "prod-key"),
            ("HONEYPOT_BIND", "127.0.0.1:9999"),
            ("CALLBACK_URL", "https://example.com/cb"),
            ("RETRY_QUEUE_PATH", "/var/lib/honeypot/queue.jsonl"),
            ("LLM_ENABLED", "true"),
            ("LLM_API_KEY", "sk-test"),
            ("LLM_MODEL", "local-7b"),
        ]));
        assert_eq!(config.api_key, "prod-key");
        assert_eq!(config.bind, "127.0.0.1:9999");
        assert_eq!(config.callback_url.as_deref(), Some("https://example.com/cb"));
        assert_eq!(
            config.retry_queue_path,
            PathBuf::from("/var/lib/honeypot/queue.jsonl")
        );
        assert_eq!(config.llm.model, "local-7b");
        assert!(config.llm_effectively_enabled());
    }

    #[test]
    fn missing_llm_key_disables_llm_even_when_flag_is_on() {
        let mut config = AppConfig::default();
        config.apply_env(env_from(&[("LLM_ENABLED", "true")]));
        assert!(!config.llm_effectively_enabled());
    }

    #[test]
    fn kill_switch_beats_credential() {
        let mut config = AppConfig::default();
        config.apply_env(env_from(&[
            ("LLM_ENABLED", "false"),
            ("LLM_API_KEY", "sk-test"),
        ]));
        assert!(!config.llm_effectively_enabled());
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut config = AppConfig::default();
        config.apply_env(env_from(&[("HONEYPOT_API_KEY", "  ")]));
        assert_eq!(config.api_key, "honeypot-dev-key");
    }

    #[test]
    fn truthy_parsing_accepts_common_spellings() {
        for v in ["1", "true", "YES", "On"] {
            assert!(is_truthy(v), "{v}");
        }
        for v in ["0", "false", "off", "banana"] {
            assert!(!is_truthy(v), "{v}");
        }
    }
}
