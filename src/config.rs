//! Configuration management for the batch submitter
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::error::{SubmitterError, SubmitterResult};
use crate::tx::DEFAULT_CLEAR_PENDING_TIMEOUT;
use crate::txmgr::TxMgrConfig;

use anyhow::{Context, Result};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the configuration file
pub const CONFIG_ENV_VAR: &str = "BATCH_SUBMITTER_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub service: ServiceConfig,
    pub txmgr: TxMgrSettings,
    pub l1: ChainConfig,
    pub l2: ChainConfig,
    pub database: DatabaseConfig,
    pub metrics: MetricsConfig,
    pub wallet: WalletConfig,
    pub disburser: DisburserConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Prefix for logs and the `service` metrics label
    pub name: String,
    pub poll_interval_ms: u64,
    /// Publish a clearing tx on startup
    #[serde(default = "default_true")]
    pub clear_pending_txs: bool,
    #[serde(default = "default_clear_pending_timeout_ms")]
    pub clear_pending_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxMgrSettings {
    pub resubmission_timeout_ms: u64,
    pub receipt_query_interval_ms: u64,
    pub num_confirmations: u64,
    pub safe_abort_nonce_too_low_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Name of the environment variable holding the hex private key
    pub private_key_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisburserConfig {
    pub disburser_address: Address,
    /// L1 contract emitting `EtherReceived`
    pub deposit_address: Address,
    /// L1 confirmations a deposit needs before it is disbursed
    pub num_deposit_confirmations: u64,
    /// First L1 block scanned when nothing has been ingested yet
    #[serde(default)]
    pub deploy_block_number: u64,
    /// Widest block range of a single `eth_getLogs` query
    #[serde(default = "default_filter_query_max_blocks")]
    pub filter_query_max_blocks: u64,
}

fn default_true() -> bool {
    true
}

fn default_filter_query_max_blocks() -> u64 {
    1000
}

fn default_clear_pending_timeout_ms() -> u64 {
    DEFAULT_CLEAR_PENDING_TIMEOUT.as_millis() as u64
}

impl Settings {
    /// Load settings from the file named by `BATCH_SUBMITTER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.service.name.is_empty() {
            anyhow::bail!("Service name cannot be empty");
        }
        if self.service.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms cannot be zero");
        }

        self.txmgr_config().validate()?;

        for chain in [&self.l1, &self.l2] {
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", chain.name);
            }
        }

        if self.disburser.num_deposit_confirmations == 0 {
            anyhow::bail!("num_deposit_confirmations cannot be zero");
        }
        if self.disburser.filter_query_max_blocks == 0 {
            anyhow::bail!("filter_query_max_blocks cannot be zero");
        }
        if self.disburser.disburser_address.is_zero() {
            tracing::warn!("Disburser address is the zero address");
        }

        Ok(())
    }

    /// Transaction manager settings with durations resolved
    pub fn txmgr_config(&self) -> TxMgrConfig {
        TxMgrConfig {
            resubmission_timeout: Duration::from_millis(self.txmgr.resubmission_timeout_ms),
            receipt_query_interval: Duration::from_millis(self.txmgr.receipt_query_interval_ms),
            num_confirmations: self.txmgr.num_confirmations,
            safe_abort_nonce_too_low_count: self.txmgr.safe_abort_nonce_too_low_count,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.service.poll_interval_ms)
    }

    pub fn clear_pending_timeout(&self) -> Duration {
        Duration::from_millis(self.service.clear_pending_timeout_ms)
    }
}

impl WalletConfig {
    /// Load the signing wallet from the configured environment variable
    pub fn load_wallet(&self, chain_id: u64) -> SubmitterResult<LocalWallet> {
        let key = env::var(&self.private_key_env).map_err(|_| {
            SubmitterError::Wallet(format!(
                "No wallet configured. Set {}",
                self.private_key_env
            ))
        })?;

        key.trim()
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map(|wallet| wallet.with_chain_id(chain_id))
            .map_err(|e| SubmitterError::Wallet(format!("Invalid private key: {}", e)))
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
    }

    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[service]
name = "TELEPORTR_DISBURSER"
poll_interval_ms = 10000

[txmgr]
resubmission_timeout_ms = 60000
receipt_query_interval_ms = 1000
num_confirmations = 1
safe_abort_nonce_too_low_count = 3

[l1]
name = "ethereum"
chain_id = 1
rpc_urls = ["${BSS_TEST_L1_RPC}"]

[l2]
name = "boba"
chain_id = 288
rpc_urls = ["http://localhost:8545", "http://localhost:8546"]

[database]
url = "postgres://localhost/teleportr"
max_connections = 5
min_connections = 1

[metrics]
enabled = true
port = 9090

[wallet]
private_key_env = "BSS_TEST_PRIVATE_KEY"

[disburser]
disburser_address = "0x5FbDB2315678afecb367f032d93F642f64180aa3"
deposit_address = "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512"
num_deposit_confirmations = 12
deploy_block_number = 14000000
"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_missing_env_var_substitutes_empty() {
        let result = substitute_env_vars("key = \"${BSS_TEST_SURELY_UNSET_VAR}\"");
        assert_eq!(result, "key = \"\"");
    }

    #[test]
    fn test_load_sample_config() {
        env::set_var("BSS_TEST_L1_RPC", "http://l1:8545");
        let file = write_config(SAMPLE);

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.service.name, "TELEPORTR_DISBURSER");
        assert!(settings.service.clear_pending_txs);
        assert_eq!(settings.clear_pending_timeout(), Duration::from_secs(300));
        assert_eq!(settings.poll_interval(), Duration::from_secs(10));
        assert_eq!(settings.l1.rpc_urls, vec!["http://l1:8545".to_string()]);
        assert_eq!(settings.l2.rpc_urls.len(), 2);

        let txmgr = settings.txmgr_config();
        assert_eq!(txmgr.resubmission_timeout, Duration::from_secs(60));
        assert_eq!(txmgr.receipt_query_interval, Duration::from_secs(1));
        assert_eq!(txmgr.num_confirmations, 1);
        assert_eq!(txmgr.safe_abort_nonce_too_low_count, 3);

        assert_eq!(settings.disburser.deploy_block_number, 14_000_000);
        assert_eq!(settings.disburser.filter_query_max_blocks, 1000);
        assert!(!settings.disburser.deposit_address.is_zero());
    }

    #[test]
    fn test_rejects_zero_filter_window() {
        let file = write_config(&SAMPLE.replace(
            "deploy_block_number = 14000000",
            "deploy_block_number = 14000000\nfilter_query_max_blocks = 0",
        ));
        assert!(Settings::load_from(file.path()).is_err());
    }

    #[test]
    fn test_rejects_zero_confirmations() {
        let file = write_config(&SAMPLE.replace("num_confirmations = 1", "num_confirmations = 0"));
        assert!(Settings::load_from(file.path()).is_err());
    }

    #[test]
    fn test_rejects_zero_abort_threshold() {
        let file = write_config(&SAMPLE.replace(
            "safe_abort_nonce_too_low_count = 3",
            "safe_abort_nonce_too_low_count = 0",
        ));
        assert!(Settings::load_from(file.path()).is_err());
    }

    #[test]
    fn test_rejects_zero_poll_interval() {
        let file = write_config(&SAMPLE.replace("poll_interval_ms = 10000", "poll_interval_ms = 0"));
        assert!(Settings::load_from(file.path()).is_err());
    }

    #[test]
    fn test_rejects_empty_rpc_list() {
        let file = write_config(&SAMPLE.replace(
            r#"rpc_urls = ["http://localhost:8545", "http://localhost:8546"]"#,
            "rpc_urls = []",
        ));
        assert!(Settings::load_from(file.path()).is_err());
    }

    #[test]
    fn test_load_wallet() {
        let wallet_config = WalletConfig {
            private_key_env: "BSS_TEST_WALLET_KEY".to_string(),
        };
        assert!(matches!(
            wallet_config.load_wallet(1),
            Err(SubmitterError::Wallet(_))
        ));

        env::set_var(
            "BSS_TEST_WALLET_KEY",
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
        );
        let wallet = wallet_config.load_wallet(288).unwrap();
        assert_eq!(wallet.chain_id(), 288);
        assert_eq!(
            wallet.address(),
            "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
                .parse::<Address>()
                .unwrap()
        );
    }
}
