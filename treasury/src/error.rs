//! Ledger error types

use pool_core::{PoolId, StakeId, StoreError, UserId};
use pool_economics::OracleError;
use pool_wallet::TransferError;
use rust_decimal::Decimal;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification used by callers to decide on retry and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    CapacityExceeded,
    InsufficientReserve,
    AlreadySettled,
    ExternalUnavailable,
    Storage,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Pool {0} not found")]
    PoolNotFound(PoolId),

    #[error("Stake {0} not found")]
    StakeNotFound(StakeId),

    #[error("User {0} not found")]
    UserNotFound(UserId),

    #[error("Pool {0} is not accepting stakes")]
    PoolInactive(PoolId),

    #[error("Commission for pool {0} is unpaid")]
    CommissionUnpaid(PoolId),

    #[error("Pool {0} still holds reserve")]
    ReserveNotEmpty(PoolId),

    #[error("Pool {0} is still active")]
    PoolStillActive(PoolId),

    #[error("Pool {0} has unsettled stakes")]
    UnsettledStakesExist(PoolId),

    #[error("Pool {pool_id} still has {count} active stakes")]
    ActiveStakesRemain { pool_id: PoolId, count: usize },

    #[error("User {user_id} does not own pool {pool_id}")]
    NotOwner { pool_id: PoolId, user_id: UserId },

    #[error("Stake {0} has not matured")]
    StakeStillActive(StakeId),

    #[error("Stake {0} qualifies for insurance, not reward")]
    InsuranceEligible(StakeId),

    #[error("Stake {0} does not qualify for insurance")]
    NotInsuranceEligible(StakeId),

    #[error("Capacity exceeded on pool {pool_id}: requested {requested}, room left {available}")]
    CapacityExceeded {
        pool_id: PoolId,
        requested: Decimal,
        available: Decimal,
    },

    #[error("Insufficient reserve: required {required}, available {available}, shortfall {shortfall}")]
    InsufficientReserve {
        required: Decimal,
        available: Decimal,
        shortfall: Decimal,
    },

    #[error("Stake {0} is already settled")]
    AlreadySettled(StakeId),

    #[error("Price oracle unavailable: {0}")]
    Oracle(#[from] OracleError),

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("{0} timed out")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidParameter(_)
            | LedgerError::PoolInactive(_)
            | LedgerError::CommissionUnpaid(_)
            | LedgerError::ReserveNotEmpty(_)
            | LedgerError::PoolStillActive(_)
            | LedgerError::UnsettledStakesExist(_)
            | LedgerError::ActiveStakesRemain { .. }
            | LedgerError::NotOwner { .. }
            | LedgerError::StakeStillActive(_)
            | LedgerError::InsuranceEligible(_)
            | LedgerError::NotInsuranceEligible(_) => ErrorKind::Validation,
            LedgerError::PoolNotFound(_)
            | LedgerError::StakeNotFound(_)
            | LedgerError::UserNotFound(_) => ErrorKind::NotFound,
            LedgerError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            LedgerError::InsufficientReserve { .. } => ErrorKind::InsufficientReserve,
            LedgerError::AlreadySettled(_) => ErrorKind::AlreadySettled,
            LedgerError::Oracle(_) | LedgerError::Transfer(_) | LedgerError::Timeout(_) => {
                ErrorKind::ExternalUnavailable
            }
            LedgerError::Storage(StoreError::NotFound { .. }) => ErrorKind::NotFound,
            LedgerError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether the same call may succeed later without any change of input
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ExternalUnavailable | ErrorKind::Storage | ErrorKind::InsufficientReserve
        )
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Run one external or persistence call under its own deadline
pub(crate) async fn bounded<T, E, F>(limit: Duration, what: &str, call: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    LedgerError: From<E>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(LedgerError::Timeout(what.to_string())),
    }
}
