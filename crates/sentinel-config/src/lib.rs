use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    pub organization: Organization,
    pub platform: Platform,
    #[serde(default)]
    pub sweeper: Sweeper,
    #[serde(default)]
    pub updates: Updates,
    pub audit: Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub guild_id: String,
    #[serde(default)]
    pub override_user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    pub render_endpoint: String,
    #[serde(default = "default_platform_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sweeper {
    #[serde(default = "default_sweep_initial_delay_secs")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_idle_threshold_days")]
    pub idle_threshold_days: u32,
}

impl Default for Sweeper {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_sweep_initial_delay_secs(),
            interval_secs: default_sweep_interval_secs(),
            idle_threshold_days: default_idle_threshold_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Updates {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub feed_url: Option<String>,
    #[serde(default = "default_update_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for Updates {
    fn default() -> Self {
        Self {
            enabled: false,
            feed_url: None,
            poll_interval_secs: default_update_poll_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub jsonl_path: String,
}

fn default_platform_timeout_ms() -> u64 {
    3_000
}

fn default_sweep_initial_delay_secs() -> u64 {
    3_600
}

fn default_sweep_interval_secs() -> u64 {
    86_400
}

fn default_idle_threshold_days() -> u32 {
    30
}

fn default_update_poll_interval_secs() -> u64 {
    21_600
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.organization.guild_id.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "organization.guild_id must be set".to_string(),
        ));
    }
    if cfg.platform.render_endpoint.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "platform.render_endpoint must be set".to_string(),
        ));
    }
    if cfg.platform.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "platform.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.sweeper.interval_secs == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "sweeper.interval_secs must be >= 1".to_string(),
        ));
    }
    if cfg.sweeper.idle_threshold_days == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "sweeper.idle_threshold_days must be >= 1".to_string(),
        ));
    }
    if cfg.updates.enabled
        && cfg
            .updates
            .feed_url
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "updates.feed_url is required when updates.enabled=true".to_string(),
        ));
    }
    if cfg.updates.enabled && cfg.updates.poll_interval_secs == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "updates.poll_interval_secs must be >= 1".to_string(),
        ));
    }
    Ok(())
}
