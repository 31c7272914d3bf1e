//! Token USD price lookup with ordered fallback
//!
//! Sources are tried in order until one returns a positive price:
//! 1. Primary token rates API
//! 2. DEX pair aggregator
//!
//! Each attempt is bounded by its own timeout.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{OracleError, Result};

/// One upstream price provider
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &str;

    async fn usd_price(&self, token_master: &str) -> Result<Decimal>;
}

/// What the scheduler and command layer depend on
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn get_usd_price(&self, token_master: &str) -> Result<Decimal>;
}

pub struct FallbackOracle {
    sources: Vec<Box<dyn PriceSource>>,
    per_source_timeout: Duration,
}

impl FallbackOracle {
    pub fn new(per_source_timeout: Duration) -> Self {
        Self {
            sources: Vec::new(),
            per_source_timeout,
        }
    }

    pub fn with_source(mut self, source: Box<dyn PriceSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }
}

#[async_trait]
impl PriceOracle for FallbackOracle {
    async fn get_usd_price(&self, token_master: &str) -> Result<Decimal> {
        for source in &self.sources {
            match timeout(self.per_source_timeout, source.usd_price(token_master)).await {
                Ok(Ok(price)) if price > Decimal::ZERO => {
                    debug!(source = source.name(), token = token_master, price = %price, "Price found");
                    return Ok(price);
                }
                Ok(Ok(price)) => {
                    debug!(source = source.name(), token = token_master, price = %price, "Unusable price")
                }
                Ok(Err(e)) => {
                    debug!(source = source.name(), token = token_master, error = %e, "Price source failed")
                }
                Err(_) => debug!(source = source.name(), token = token_master, "Price source timed out"),
            }
        }

        warn!(token = token_master, "⚠️  All price sources failed");
        Err(OracleError::AllSourcesFailed(token_master.to_string()))
    }
}
