//! Pool Treasury Ledger Module
//!
//! The financial side of the treasury:
//! - Pools and stakes with per-pool serialized mutations
//! - Daily reward accrual and maturity closing
//! - Reward, insurance and reserve payouts with at-most-once guards
//! - Application of dispatched deposit requests

pub mod accrual;
pub mod commands;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod settlement;

pub use accrual::{AccrualScheduler, TickReport};
pub use commands::{
    CommandOutcome, CommandProcessor, CommandSettings, CreatePoolPayload, PoolPayload,
    DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_BACKOFF,
};
pub use error::{ErrorKind, LedgerError, Result};
pub use ledger::{Ledger, PoolSummary, DEFAULT_CALL_TIMEOUT};
pub use notify::{Notification, NotificationStake, Notifier};
pub use settlement::{Payout, Settlement};
