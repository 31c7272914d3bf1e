//! Transfer executor contract

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One jetton transfer out of the treasury
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub token_master: String,
    pub destination: String,
    /// Display units; converted with `decimals` before sending
    pub amount: Decimal,
    pub decimals: u8,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    /// Base units, as reported by the token master
    pub total_supply: String,
}

#[async_trait]
pub trait TransferExecutor: Send + Sync {
    /// Send a transfer and return its transaction hash
    async fn send(&self, request: &TransferRequest) -> Result<String>;

    /// Jetton wallet address owned by `owner` for `token_master`
    async fn resolve_token_wallet(&self, token_master: &str, owner: &str) -> Result<String>;

    async fn token_metadata(&self, token_master: &str) -> Result<TokenMetadata>;
}
