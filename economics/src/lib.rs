//! Pool Treasury Economics Module
//!
//! Market data for the staking ledger:
//! - Token USD price lookup
//! - Ordered fallback across price sources

pub mod error;
pub mod oracle;
pub mod sources;

pub use error::{OracleError, Result};
pub use oracle::{FallbackOracle, PriceOracle, PriceSource};
pub use sources::{DexPairsSource, RatesApiSource};

/// Oracle defaults
pub mod constants {
    /// Primary token rates API
    pub const DEFAULT_RATES_ENDPOINT: &str = "https://tonapi.io/v2";

    /// Secondary DEX pair aggregator
    pub const DEFAULT_DEX_ENDPOINT: &str = "https://api.dexscreener.com";

    /// Per-source request timeout (seconds)
    pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
}
