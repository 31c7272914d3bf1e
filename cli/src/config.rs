//! Node configuration (TOML)

use pool_economics::constants::{DEFAULT_DEX_ENDPOINT, DEFAULT_RATES_ENDPOINT, DEFAULT_TIMEOUT_SECS};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use zeroize::Zeroizing;

pub const DEFAULT_CONFIG_PATH: &str = "$HOME/.pool-node/config.toml";

#[derive(Error, Debug)]
pub enum NodeConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, NodeConfigError>;

#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub treasury: TreasuryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub feed: FeedSection,
    #[serde(default)]
    pub oracle: OracleSection,
    pub wallet: WalletSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
}

#[derive(Deserialize)]
pub struct TreasuryConfig {
    pub address: String,
    #[serde(deserialize_with = "secret")]
    pub signing_secret: Zeroizing<String>,
    pub commission_amount: Decimal,
    #[serde(default = "default_token_name")]
    pub token_name: String,
    #[serde(default = "default_token_decimals")]
    pub token_decimals: u8,
}

impl fmt::Debug for TreasuryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreasuryConfig")
            .field("address", &self.address)
            .field("commission_amount", &self.commission_amount)
            .field("token_name", &self.token_name)
            .field("token_decimals", &self.token_decimals)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FeedSection {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub poll_interval_secs: u64,
    pub page_size: usize,
    pub request_timeout_secs: u64,
    /// Used only when no cursor has been stored yet
    pub start_lt: u64,
}

impl Default for FeedSection {
    fn default() -> Self {
        Self {
            endpoint: "https://toncenter.com/api/v3".to_string(),
            api_key: None,
            poll_interval_secs: 5,
            page_size: 50,
            request_timeout_secs: 10,
            start_lt: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OracleSection {
    pub primary_endpoint: String,
    pub primary_api_key: Option<String>,
    /// Empty disables the fallback source
    pub fallback_endpoint: String,
    pub timeout_secs: u64,
}

impl Default for OracleSection {
    fn default() -> Self {
        Self {
            primary_endpoint: DEFAULT_RATES_ENDPOINT.to_string(),
            primary_api_key: None,
            fallback_endpoint: DEFAULT_DEX_ENDPOINT.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WalletSection {
    pub endpoint: String,
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub tick_interval_secs: u64,
    pub call_timeout_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_interval_secs: 86_400,
            call_timeout_secs: 10,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| NodeConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: NodeConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.treasury.address.trim().is_empty() {
            return Err(NodeConfigError::Invalid(
                "treasury.address must be set".to_string(),
            ));
        }
        if self.treasury.signing_secret.is_empty() {
            return Err(NodeConfigError::Invalid(
                "treasury.signing_secret must be set".to_string(),
            ));
        }
        if self.treasury.commission_amount <= Decimal::ZERO {
            return Err(NodeConfigError::Invalid(
                "treasury.commission_amount must be positive".to_string(),
            ));
        }
        if self.wallet.endpoint.trim().is_empty() {
            return Err(NodeConfigError::Invalid(
                "wallet.endpoint must be set".to_string(),
            ));
        }
        let intervals = [
            ("feed.poll_interval_secs", self.feed.poll_interval_secs),
            ("feed.request_timeout_secs", self.feed.request_timeout_secs),
            ("oracle.timeout_secs", self.oracle.timeout_secs),
            ("wallet.timeout_secs", self.wallet.timeout_secs),
            ("scheduler.tick_interval_secs", self.scheduler.tick_interval_secs),
            ("scheduler.call_timeout_secs", self.scheduler.call_timeout_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(NodeConfigError::Invalid(format!("{} must be non-zero", name)));
            }
        }
        if self.feed.page_size == 0 {
            return Err(NodeConfigError::Invalid(
                "feed.page_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn storage_path(&self) -> PathBuf {
        PathBuf::from(expand_path(&self.storage.path))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduler.call_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.tick_interval_secs)
    }
}

pub fn expand_path(path: &str) -> String {
    path.replace("$HOME", &std::env::var("HOME").unwrap_or_default())
}

fn secret<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Zeroizing<String>, D::Error> {
    String::deserialize(deserializer).map(Zeroizing::new)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_token_name() -> String {
    "jetton".to_string()
}

fn default_token_decimals() -> u8 {
    9
}

fn default_storage_path() -> String {
    "$HOME/.pool-node/data".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [treasury]
        address = "0:treasury"
        signing_secret = "s3cret"
        commission_amount = "5"

        [wallet]
        endpoint = "http://127.0.0.1:8090"
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = NodeConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.treasury.token_decimals, 9);
        assert_eq!(config.treasury.commission_amount, Decimal::from(5));
        assert_eq!(config.feed.page_size, 50);
        assert_eq!(config.oracle.primary_endpoint, DEFAULT_RATES_ENDPOINT);
        assert_eq!(config.tick_interval(), Duration::from_secs(86_400));
        assert_eq!(config.wallet.timeout_secs, 10);
    }

    #[test]
    fn test_debug_hides_secret() {
        let config = NodeConfig::from_toml(MINIMAL).unwrap();
        let printed = format!("{:?}", config);
        assert!(printed.contains("0:treasury"));
        assert!(!printed.contains("s3cret"));
    }

    #[test]
    fn test_validation() {
        let bad = MINIMAL.replace("commission_amount = \"5\"", "commission_amount = \"0\"");
        assert!(matches!(
            NodeConfig::from_toml(&bad),
            Err(NodeConfigError::Invalid(_))
        ));

        let bad = format!("{}\n[scheduler]\ntick_interval_secs = 0\n", MINIMAL);
        assert!(matches!(
            NodeConfig::from_toml(&bad),
            Err(NodeConfigError::Invalid(_))
        ));

        let bad = MINIMAL.replace("address = \"0:treasury\"", "address = \"\"");
        assert!(NodeConfig::from_toml(&bad).is_err());

        assert!(matches!(
            NodeConfig::from_toml("not = [toml"),
            Err(NodeConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "{}\n[feed]\nstart_lt = 42\npoll_interval_secs = 2\n",
            MINIMAL
        )
        .unwrap();

        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.feed.start_lt, 42);
        assert_eq!(config.feed.poll_interval_secs, 2);
        assert_eq!(config.feed.request_timeout_secs, 10);

        let missing = NodeConfig::load(Path::new("/nonexistent/pool-node.toml"));
        assert!(matches!(missing, Err(NodeConfigError::Io { .. })));
    }

    #[test]
    fn test_expand_path() {
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(expand_path("$HOME/.pool-node"), format!("{}/.pool-node", home));
        assert_eq!(expand_path("/var/lib/pool"), "/var/lib/pool");
    }
}
