//! Node configuration loaded from TOML.
//!
//! ```toml
//! chain_id = "tbft-test"
//! moniker = "validator-0"
//! data_dir = "/var/lib/tbft"
//!
//! [consensus]
//! timeout_propose_ms = 3000
//! skip_timeout_commit = false
//!
//! [telemetry]
//! log_filter = "info,tbft=debug"
//! ```

use crate::telemetry::TelemetryConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tbft_bft::{ConsensusConfig, FileSignStateStore, PrivValidator, SignError};
use tbft_types::KeyPair;
use thiserror::Error;

/// File holding the persisted signing state, under `data_dir`.
pub const SIGN_STATE_FILE: &str = "priv_validator_state.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Failed to open signing state: {0}")]
    Signer(#[from] SignError),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeConfig {
    pub chain_id: String,
    #[serde(default)]
    pub moniker: String,
    /// Where node state lives. Signing state is kept in memory when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Capacity of every runner channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_channel_capacity() -> usize {
    1024
}

impl NodeConfig {
    /// A config with defaults for everything but the chain id.
    pub fn new(chain_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            moniker: String::new(),
            data_dir: None,
            channel_capacity: default_channel_capacity(),
            consensus: ConsensusConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chain_id.is_empty() {
            return Err(ConfigError::Invalid("chain_id must not be empty".into()));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid("channel_capacity must be positive".into()));
        }
        if self.consensus.block_part_size == 0 {
            return Err(ConfigError::Invalid(
                "consensus.block_part_size must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Path of the persisted signing state, if a data dir is configured.
    pub fn sign_state_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(SIGN_STATE_FILE))
    }

    /// Signer for `key`, resuming from the persisted signing state when a
    /// data dir is configured.
    pub fn open_priv_validator(&self, key: KeyPair) -> Result<PrivValidator, ConfigError> {
        match self.sign_state_path() {
            Some(path) => Ok(PrivValidator::with_store(
                key,
                Box::new(FileSignStateStore::new(path)),
            )?),
            None => Ok(PrivValidator::new(key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = NodeConfig::from_toml_str(r#"chain_id = "c""#).unwrap();
        assert_eq!(config, NodeConfig::new("c"));
        assert_eq!(config.consensus.timeout_propose_ms, 3000);
        assert_eq!(config.sign_state_path(), None);
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = NodeConfig::from_toml_str(
            r#"
            chain_id = "c"
            moniker = "v0"
            data_dir = "/tmp/tbft"

            [consensus]
            timeout_commit_ms = 10
            skip_timeout_commit = true

            [telemetry]
            log_filter = "warn"
            metrics_enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.moniker, "v0");
        assert_eq!(config.consensus.timeout_commit_ms, 10);
        assert!(config.consensus.skip_timeout_commit);
        assert_eq!(config.consensus.timeout_prevote_ms, 1000);
        assert_eq!(config.telemetry.log_filter.as_deref(), Some("warn"));
        assert!(!config.telemetry.metrics_enabled);
        assert_eq!(
            config.sign_state_path(),
            Some(PathBuf::from("/tmp/tbft").join(SIGN_STATE_FILE))
        );
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            NodeConfig::from_toml_str(r#"chain_id = """#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            NodeConfig::from_toml_str("chain_id = 5"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_priv_validator_resumes_from_data_dir() {
        use tbft_types::test_utils::{signed_vote, test_key};
        use tbft_types::{BlockId, VoteType};

        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::new("c");
        config.data_dir = Some(dir.path().to_path_buf());

        let signer = config.open_priv_validator(test_key(0)).unwrap();
        let mut vote = signed_vote("c", &test_key(0), 0, 4, 1, VoteType::Prevote, BlockId::nil());
        signer.sign_vote("c", &mut vote).unwrap();
        assert!(config.sign_state_path().unwrap().exists());

        let reopened = config.open_priv_validator(test_key(0)).unwrap();
        assert_eq!(reopened.sign_state().last_height, 4);
        assert_eq!(reopened.sign_state().last_round, 1);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"chain_id = "from-file""#).unwrap();
        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.chain_id, "from-file");

        let missing = NodeConfig::load("/nonexistent/tbft.toml");
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
