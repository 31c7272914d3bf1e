//! Pool Treasury Wallet Module
//!
//! Outbound side of the treasury:
//! - Jetton transfers through the transfer service
//! - Jetton wallet resolution and token metadata
//! - Base-unit conversion

pub mod client;
pub mod error;
pub mod executor;
pub mod units;

pub use client::{WalletServiceClient, WalletServiceConfig};
pub use error::{Result, TransferError};
pub use executor::{TokenMetadata, TransferExecutor, TransferRequest};
pub use units::{from_base_units, to_base_units};
