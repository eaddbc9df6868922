use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const ENV_PREFIX: &str = "KEEPSAKE_";

/// Hyper-parameters applied to a training job when the caller leaves them out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingDefaults {
    pub learning_rate: f64,
    pub num_train_epochs: u64,
    pub train_batch_size: u64,
    pub lora_rank: u64,
    pub lora_alpha: u64,
    pub resolution: u64,
    pub instance_prompt: String,
    pub seed: u64,
}

impl Default for TrainingDefaults {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            num_train_epochs: 100,
            train_batch_size: 1,
            lora_rank: 16,
            lora_alpha: 32,
            resolution: 1024,
            instance_prompt: "a photo of SKS person".to_string(),
            seed: 42,
        }
    }
}

impl TrainingDefaults {
    /// Fills in every default the caller did not set. Caller values win.
    pub fn fill(&self, params: &mut Map<String, Value>) {
        let defaults = serde_json::to_value(self)
            .ok()
            .and_then(|value| value.as_object().cloned())
            .unwrap_or_default();
        for (key, value) in defaults {
            params.entry(key).or_insert(value);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub primary_enabled: bool,
    pub legacy_fallback_enabled: bool,
    /// Bypasses the network entirely; the stub provider serves every call.
    pub stub_mode: bool,
    pub poll_interval_seconds: f64,
    pub max_poll_attempts: u32,
    pub canvas_size_pixels: u32,
    pub primary_api_base: String,
    pub legacy_api_base: String,
    pub api_key: Option<String>,
    pub generation_timeout_seconds: f64,
    pub health_timeout_seconds: f64,
    pub request_timeout_seconds: f64,
    pub presign_ttl_seconds: u64,
    pub data_dir: PathBuf,
    pub blob_bucket: String,
    pub stub_polls_until_complete: u32,
    pub training: TrainingDefaults,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            primary_enabled: true,
            legacy_fallback_enabled: false,
            stub_mode: false,
            poll_interval_seconds: 10.0,
            max_poll_attempts: 360,
            canvas_size_pixels: 1024,
            primary_api_base: "http://localhost:8080".to_string(),
            legacy_api_base: "http://localhost:8000".to_string(),
            api_key: None,
            generation_timeout_seconds: 120.0,
            health_timeout_seconds: 2.0,
            request_timeout_seconds: 30.0,
            presign_ttl_seconds: 3600,
            data_dir: PathBuf::from(".keepsake"),
            blob_bucket: "keepsake".to_string(),
            stub_polls_until_complete: 2,
            training: TrainingDefaults::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults, then the optional JSON file, then `KEEPSAKE_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("config {} is not valid JSON", path.display()))
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = get("PRIMARY_ENABLED").and_then(|raw| parse_bool(&raw)) {
            self.primary_enabled = value;
        }
        if let Some(value) = get("LEGACY_FALLBACK_ENABLED").and_then(|raw| parse_bool(&raw)) {
            self.legacy_fallback_enabled = value;
        }
        if let Some(value) = get("STUB_MODE").and_then(|raw| parse_bool(&raw)) {
            self.stub_mode = value;
        }
        if let Some(value) = get("POLL_INTERVAL_SECONDS").and_then(|raw| raw.parse().ok()) {
            self.poll_interval_seconds = value;
        }
        if let Some(value) = get("MAX_POLL_ATTEMPTS").and_then(|raw| raw.parse().ok()) {
            self.max_poll_attempts = value;
        }
        if let Some(value) = get("CANVAS_SIZE_PIXELS").and_then(|raw| raw.parse().ok()) {
            self.canvas_size_pixels = value;
        }
        if let Some(value) = get("PRIMARY_API_BASE") {
            self.primary_api_base = value.trim_end_matches('/').to_string();
        }
        if let Some(value) = get("LEGACY_API_BASE") {
            self.legacy_api_base = value.trim_end_matches('/').to_string();
        }
        if let Some(value) = get("API_KEY") {
            self.api_key = Some(value);
        }
        if let Some(value) = get("GENERATION_TIMEOUT_SECONDS").and_then(|raw| raw.parse().ok()) {
            self.generation_timeout_seconds = value;
        }
        if let Some(value) = get("HEALTH_TIMEOUT_SECONDS").and_then(|raw| raw.parse().ok()) {
            self.health_timeout_seconds = value;
        }
        if let Some(value) = get("REQUEST_TIMEOUT_SECONDS").and_then(|raw| raw.parse().ok()) {
            self.request_timeout_seconds = value;
        }
        if let Some(value) = get("PRESIGN_TTL_SECONDS").and_then(|raw| raw.parse().ok()) {
            self.presign_ttl_seconds = value;
        }
        if let Some(value) = get("DATA_DIR") {
            self.data_dir = PathBuf::from(value);
        }
        if let Some(value) = get("BLOB_BUCKET") {
            self.blob_bucket = value;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.poll_interval_seconds.is_finite() && self.poll_interval_seconds > 0.0) {
            bail!(
                "poll_interval_seconds must be positive (got {})",
                self.poll_interval_seconds
            );
        }
        if self.max_poll_attempts == 0 {
            bail!("max_poll_attempts must be at least 1");
        }
        if self.canvas_size_pixels == 0 {
            bail!("canvas_size_pixels must be at least 1");
        }
        for (name, value) in [
            ("generation_timeout_seconds", self.generation_timeout_seconds),
            ("health_timeout_seconds", self.health_timeout_seconds),
            ("request_timeout_seconds", self.request_timeout_seconds),
        ] {
            if !(value.is_finite() && value > 0.0) {
                bail!("{name} must be positive (got {value})");
            }
        }
        if self.blob_bucket.trim().is_empty() {
            bail!("blob_bucket must not be empty");
        }
        Ok(())
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_secs_f64(self.poll_interval_seconds),
            max_attempts: self.max_poll_attempts,
        }
    }

    pub fn jobs_path(&self) -> PathBuf {
        self.data_dir.join("jobs.json")
    }

    pub fn events_path(&self) -> PathBuf {
        self.data_dir.join("events.jsonl")
    }

    pub fn blob_root(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }
}

/// Cadence and budget of one polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollSettings {
    pub fn max_duration(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        EngineConfig::default().poll_settings()
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use serde_json::{json, Map};

    use super::{EngineConfig, TrainingDefaults};

    #[test]
    fn defaults_match_reference_values() {
        let config = EngineConfig::default();
        let poll = config.poll_settings();
        assert_eq!(poll.interval, Duration::from_secs(10));
        assert_eq!(poll.max_attempts, 360);
        assert_eq!(poll.max_duration(), Duration::from_secs(3600));
        assert_eq!(config.canvas_size_pixels, 1024);
        assert!(config.primary_enabled);
        assert!(!config.legacy_fallback_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_are_prefixed_and_trimmed() {
        let vars: HashMap<String, String> = [
            ("KEEPSAKE_STUB_MODE", "yes"),
            ("KEEPSAKE_LEGACY_FALLBACK_ENABLED", "1"),
            ("KEEPSAKE_POLL_INTERVAL_SECONDS", "0.5"),
            ("KEEPSAKE_MAX_POLL_ATTEMPTS", " 12 "),
            ("KEEPSAKE_PRIMARY_API_BASE", "https://gen.example.com/"),
            ("KEEPSAKE_CANVAS_SIZE_PIXELS", "not-a-number"),
            ("STUB_MODE", "0"),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();

        let mut config = EngineConfig::default();
        config.apply_env(|key| vars.get(key).cloned());

        assert!(config.stub_mode);
        assert!(config.legacy_fallback_enabled);
        assert_eq!(config.poll_settings().interval, Duration::from_millis(500));
        assert_eq!(config.max_poll_attempts, 12);
        assert_eq!(config.primary_api_base, "https://gen.example.com");
        assert_eq!(config.canvas_size_pixels, 1024);
    }

    #[test]
    fn validate_rejects_zero_budgets() {
        let mut config = EngineConfig::default();
        config.max_poll_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.poll_interval_seconds = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_config_keeps_defaults_for_missing_fields() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("keepsake.json");
        std::fs::write(&path, r#"{"stub_mode": true, "max_poll_attempts": 3}"#)?;
        let config = EngineConfig::from_file(&path)?;
        assert!(config.stub_mode);
        assert_eq!(config.max_poll_attempts, 3);
        assert_eq!(config.poll_interval_seconds, 10.0);
        assert_eq!(config.training.lora_rank, 16);
        Ok(())
    }

    #[test]
    fn training_defaults_never_override_caller_values() {
        let mut params = Map::new();
        params.insert("lora_rank".to_string(), json!(64));
        TrainingDefaults::default().fill(&mut params);
        assert_eq!(params["lora_rank"], json!(64));
        assert_eq!(params["lora_alpha"], json!(32));
        assert_eq!(params["instance_prompt"], json!("a photo of SKS person"));
    }
}
