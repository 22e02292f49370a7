// src/backend/models/config.rs
use crate::error::{AfterselfError, Result};
use crate::models::common::Channel;
use crate::models::contact::TrustedContact;
use crate::utils::time::duration_serde;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Fully-parsed configuration handed to every component at construction.
#[derive(Serialize, Deserialize, Clone, Debug, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AfterselfConfig {
    #[validate(nested)]
    pub heartbeat: HeartbeatConfig,
    #[validate(nested)]
    pub vault: VaultConfig,
    #[validate(nested)]
    pub executor: ExecutorConfig,
    #[validate(nested)]
    pub ghost: GhostConfig,
    #[validate(nested)]
    pub llm: LlmConfig,
    #[validate(nested)]
    pub mortality_pool: MortalityPoolConfig,
}

impl AfterselfConfig {
    /// Parses and validates in one step; any problem is a `ConfigError`.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| AfterselfError::Config(format!("invalid configuration: {e}")))?;
        config.validate_config()?;
        Ok(config)
    }

    pub fn validate_config(&self) -> Result<()> {
        self.validate()?;
        if self.vault.beneficiary_key_enabled && self.vault.beneficiary_public_key.is_none() {
            return Err(AfterselfError::Config(
                "beneficiaryKeyEnabled requires beneficiaryPublicKey".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Validate)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConfig {
    /// How often to ping the user (e.g. "72h", "7d")
    #[serde(with = "duration_serde")]
    #[validate(custom(function = "validate_positive_duration"))]
    pub interval: Duration,
    /// Channels to send check-in pings on
    #[validate(length(min = 1))]
    pub channels: Vec<Channel>,
    /// Grace period after the first missed check-in
    #[serde(with = "duration_serde")]
    #[validate(custom(function = "validate_positive_duration"))]
    pub warning_period: Duration,
    /// Time to wait for trusted contact responses
    #[serde(with = "duration_serde")]
    #[validate(custom(function = "validate_positive_duration"))]
    pub escalation_timeout: Duration,
    #[validate(length(min = 1), custom(function = "validate_unique_contacts"), nested)]
    pub escalation_contacts: Vec<TrustedContact>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Copy, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionMode {
    #[default]
    Aes256Gcm,
}

#[derive(Serialize, Deserialize, Clone, Debug, Validate)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfig {
    #[serde(default)]
    pub encryption: EncryptionMode,
    /// Double-layer encryption of the plan with the beneficiary public key
    pub beneficiary_key_enabled: bool,
    /// Uncompressed or compressed SEC1 P-256 point, hex encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 66, max = 130))]
    pub beneficiary_public_key: Option<String>,
    /// Directory holding the encrypted records
    pub db_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
    /// Defaults to `<dbPath>/master.key`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
}

impl VaultConfig {
    pub fn for_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            encryption: EncryptionMode::Aes256Gcm,
            beneficiary_key_enabled: false,
            beneficiary_public_key: None,
            db_path: db_path.into(),
            backup_path: None,
            key_path: None,
        }
    }

    pub fn resolved_key_path(&self) -> PathBuf {
        self.key_path
            .clone()
            .unwrap_or_else(|| self.db_path.join("master.key"))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorConfig {
    pub enabled: bool,
    /// Require an explicit go-ahead before executing a triggered plan
    pub confirmation_gate: bool,
    /// Log successful actions for beneficiary review (failures are always logged)
    pub audit_log: bool,
    /// Attempts per action
    #[validate(range(min = 1, max = 20))]
    pub max_retries: u32,
    /// Milliseconds; backoff unit and minimum spacing between dispatches
    #[validate(range(max = 3_600_000))]
    pub action_delay: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confirmation_gate: false,
            audit_log: true,
            max_retries: 3,
            action_delay: 1_000,
        }
    }
}

impl ExecutorConfig {
    pub fn action_delay(&self) -> Duration {
        Duration::from_millis(self.action_delay)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TimeDecayConfig {
    pub enabled: bool,
    #[validate(range(max = 3650))]
    pub fade_over_days: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GhostConfig {
    pub enabled: bool,
    pub learning: bool,
    /// Label all messages as AI-generated
    pub transparency: bool,
    pub voice_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    pub social_posting: bool,
    #[validate(nested)]
    pub time_decay: TimeDecayConfig,
    #[serde(default)]
    pub kill_switch_contacts: Vec<String>,
    #[serde(default)]
    pub blocked_topics: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Copy, Default)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[default]
    Anthropic,
    Openai,
    Ollama,
}

#[derive(Serialize, Deserialize, Clone, Debug, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    pub provider: LlmProvider,
    #[validate(length(min = 1))]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(url)]
    pub base_url: Option<String>,
    #[validate(range(min = 1))]
    pub max_tokens: u32,
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Anthropic,
            model: "default".to_string(),
            api_key: None,
            base_url: None,
            max_tokens: 1024,
            temperature: 0.7,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MortalityPoolConfig {
    pub enabled: bool,
    /// The shared pool wallet all tokens go to on trigger
    pub pool_wallet: String,
    pub token_mint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keypair_path: Option<PathBuf>,
    pub rpc_url: String,
    pub nudge_enabled: bool,
}

fn validate_positive_duration(value: &Duration) -> std::result::Result<(), ValidationError> {
    if value.is_zero() {
        return Err(ValidationError::new("duration_must_be_positive"));
    }
    Ok(())
}

fn validate_unique_contacts(contacts: &[TrustedContact]) -> std::result::Result<(), ValidationError> {
    let mut seen = HashSet::new();
    if contacts.iter().all(|c| seen.insert(c.id.as_str())) {
        Ok(())
    } else {
        Err(ValidationError::new("duplicate_contact_id"))
    }
}
