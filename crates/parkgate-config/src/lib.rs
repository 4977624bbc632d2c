use std::collections::BTreeMap;

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
    pub wecom: WeCom,
    pub agent: Agent,
    #[serde(default)]
    pub heartbeat: Heartbeat,
    #[serde(default)]
    pub scanner: Scanner,
    #[serde(default)]
    pub commands: Commands,
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

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Receivers {
    #[serde(default)]
    pub touser: Vec<String>,
    #[serde(default)]
    pub toparty: Vec<String>,
    #[serde(default)]
    pub totag: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeCom {
    pub corp_id: String,
    pub agent_id: i64,
    pub corp_secret: String,
    pub token: String,
    pub encoding_aes_key: String,
    #[serde(default)]
    pub approval_template_id: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_access_token_expire_time")]
    pub access_token_expire_time: i64,
    #[serde(default)]
    pub token_cache_path: Option<String>,
    #[serde(default = "default_message_retry_times")]
    pub message_retry_times: usize,
    #[serde(default = "default_message_retry_interval")]
    pub message_retry_interval: u64,
    #[serde(default)]
    pub default_message_receiver: Receivers,
    /// Field name (plate, owner, class, months, money) to approval control id.
    #[serde(default)]
    pub approval_controls: BTreeMap<String, String>,
    /// Approvers for approval tickets opened by command; falls back to the admin set.
    #[serde(default)]
    pub approvers: Vec<String>,
}

impl WeCom {
    /// The admin set: user ids allowed to run privileged commands.
    pub fn admins(&self) -> &[String] {
        &self.default_message_receiver.touser
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admins().iter().any(|v| v == user_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_heartbeat_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default)]
    pub state_path: Option<String>,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            timeout_secs: default_heartbeat_timeout_secs(),
            check_interval_secs: default_heartbeat_check_interval_secs(),
            state_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scanner {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_run_at")]
    pub run_at: String,
    #[serde(default = "default_soon_days")]
    pub soon_days: i64,
    #[serde(default = "default_expired_days")]
    pub expired_days: i64,
    #[serde(default = "default_admin_batch_size")]
    pub admin_batch_size: usize,
}

impl Default for Scanner {
    fn default() -> Self {
        Self {
            enabled: true,
            run_at: default_run_at(),
            soon_days: default_soon_days(),
            expired_days: default_expired_days(),
            admin_batch_size: default_admin_batch_size(),
        }
    }
}

impl Scanner {
    /// `run_at` as (hour, minute); validated at load time.
    pub fn run_at_hm(&self) -> Option<(u32, u32)> {
        parse_hm(&self.run_at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commands {
    #[serde(default = "default_fee_schedule")]
    pub fee_schedule: String,
    #[serde(default = "default_query_limit")]
    pub query_limit: usize,
    #[serde(default = "default_records_ttl_secs")]
    pub records_ttl_secs: u64,
}

impl Default for Commands {
    fn default() -> Self {
        Self {
            fee_schedule: default_fee_schedule(),
            query_limit: default_query_limit(),
            records_ttl_secs: default_records_ttl_secs(),
        }
    }
}

fn default_api_base() -> String {
    "https://qyapi.weixin.qq.com/cgi-bin".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_access_token_expire_time() -> i64 {
    7200
}

fn default_message_retry_times() -> usize {
    3
}

fn default_message_retry_interval() -> u64 {
    5
}

fn default_heartbeat_timeout_secs() -> u64 {
    3600
}

fn default_heartbeat_check_interval_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_run_at() -> String {
    "09:00".to_string()
}

fn default_soon_days() -> i64 {
    3
}

fn default_expired_days() -> i64 {
    31
}

fn default_admin_batch_size() -> usize {
    8
}

fn default_fee_schedule() -> String {
    "业主首车：200元/月\n业主二车：300元/月\n租户/外部车辆：400元/月".to_string()
}

fn default_query_limit() -> usize {
    10
}

fn default_records_ttl_secs() -> u64 {
    300
}

fn parse_hm(raw: &str) -> Option<(u32, u32)> {
    let (h, m) = raw.trim().split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    (h < 24 && m < 60).then_some((h, m))
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

const MAX_HEARTBEAT_TIMEOUT_SECS: u64 = 30 * 24 * 3600;
const MAX_SCAN_WINDOW_DAYS: i64 = 3650;

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
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
    if cfg.wecom.encoding_aes_key.len() != 43 {
        return Err(ConfigError::UnsupportedConfig(
            "wecom.encoding_aes_key must be exactly 43 characters".to_string(),
        ));
    }
    if cfg.wecom.message_retry_times == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "wecom.message_retry_times must be >= 1".to_string(),
        ));
    }
    if cfg.wecom.access_token_expire_time <= 0 {
        return Err(ConfigError::UnsupportedConfig(
            "wecom.access_token_expire_time must be >= 1".to_string(),
        ));
    }
    if cfg.agent.api_key.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "agent.api_key must not be empty".to_string(),
        ));
    }
    if cfg.heartbeat.timeout_secs == 0 || cfg.heartbeat.check_interval_secs == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "heartbeat.timeout_secs and heartbeat.check_interval_secs must be >= 1".to_string(),
        ));
    }
    if cfg.heartbeat.timeout_secs > MAX_HEARTBEAT_TIMEOUT_SECS {
        return Err(ConfigError::UnsupportedConfig(format!(
            "heartbeat.timeout_secs must be <= {MAX_HEARTBEAT_TIMEOUT_SECS}"
        )));
    }
    for (key, days) in [
        ("scanner.soon_days", cfg.scanner.soon_days),
        ("scanner.expired_days", cfg.scanner.expired_days),
    ] {
        if !(0..=MAX_SCAN_WINDOW_DAYS).contains(&days) {
            return Err(ConfigError::UnsupportedConfig(format!(
                "{key} must be within 0..={MAX_SCAN_WINDOW_DAYS}"
            )));
        }
    }
    if cfg.scanner.run_at_hm().is_none() {
        return Err(ConfigError::UnsupportedConfig(format!(
            "scanner.run_at={} is not a valid HH:MM time",
            cfg.scanner.run_at
        )));
    }
    if cfg.scanner.admin_batch_size == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "scanner.admin_batch_size must be >= 1".to_string(),
        ));
    }
    Ok(())
}
