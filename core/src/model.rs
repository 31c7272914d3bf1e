//! Pools, stakes, users and the operation audit log

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::SECONDS_PER_DAY;

pub type UserId = u64;
pub type PoolId = u64;
pub type StakeId = u64;

/// A participant identified by the wallet that sends to the treasury
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub wallet_address: String,
    pub created_at: DateTime<Utc>,
}

/// A staking offer backed by an owner's reserve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    pub owner_id: UserId,

    /// Treasury token wallet receiving deposits for this pool
    pub deposit_address: String,

    /// Token master (contract) address
    pub token_master: String,

    /// Available backing, in token units
    pub reserve: Decimal,

    /// Reserve minus liabilities earmarked to closed, unsettled stakes
    pub temp_reserve: Decimal,

    /// Per-day accrual rate in percent
    pub reward_percent: Decimal,

    pub period_days: u32,

    /// Price drop (percent) past which a closed stake is insured instead of rewarded
    pub insurance_coating_percent: Decimal,

    pub is_active: bool,
    pub is_commission_paid: bool,
    pub created_at: DateTime<Utc>,
}

/// Parameters for creating a pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPool {
    pub owner_id: UserId,
    pub reserve_deposit: Decimal,
    pub token_master: String,
    pub deposit_address: String,
    pub reward_percent: Decimal,
    pub period_days: u32,
    pub insurance_coating_percent: Decimal,
}

/// One user's deposit into a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stake {
    pub id: StakeId,
    pub user_id: UserId,
    pub pool_id: PoolId,

    /// Principal
    pub amount: Decimal,

    /// Principal plus reward accrued so far
    pub balance: Decimal,

    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub close_date: Option<DateTime<Utc>>,
    pub is_active: bool,

    /// Token USD price when the stake was opened
    pub deposit_creation_price: Decimal,

    /// Token USD price recorded at maturity
    pub jetton_price_closed: Option<Decimal>,

    pub is_reward_paid: bool,
    pub is_insurance_paid: bool,
}

impl Stake {
    /// End of the term for a stake opened at `start`
    pub fn term_end(start: DateTime<Utc>, period_days: u32) -> DateTime<Utc> {
        start + Duration::seconds(i64::from(period_days) * SECONDS_PER_DAY)
    }

    /// Either payout has been made; the stake is terminal
    pub fn is_settled(&self) -> bool {
        self.is_reward_paid || self.is_insurance_paid
    }

    /// Closed at maturity but not yet paid out
    pub fn awaits_settlement(&self) -> bool {
        !self.is_active && !self.is_settled()
    }

    pub fn has_matured(&self, now: DateTime<Utc>) -> bool {
        self.end_date <= now
    }

    /// Reward accrued on top of the principal
    pub fn accrued_reward(&self) -> Decimal {
        self.balance - self.amount
    }
}

/// Kind of a completed business action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    PoolCreated,
    ReserveAdded,
    CommissionPaid,
    PoolActivated,
    PoolDeactivated,
    PoolDeleted,
    StakeCreated,
    StakeClosed,
    RewardClaimed,
    InsuranceClaimed,
    ReserveWithdrawn,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::PoolCreated => "pool_created",
            OperationKind::ReserveAdded => "reserve_added",
            OperationKind::CommissionPaid => "commission_paid",
            OperationKind::PoolActivated => "pool_activated",
            OperationKind::PoolDeactivated => "pool_deactivated",
            OperationKind::PoolDeleted => "pool_deleted",
            OperationKind::StakeCreated => "stake_created",
            OperationKind::StakeClosed => "stake_closed",
            OperationKind::RewardClaimed => "reward_claimed",
            OperationKind::InsuranceClaimed => "insurance_claimed",
            OperationKind::ReserveWithdrawn => "reserve_withdrawn",
        };
        f.write_str(name)
    }
}

/// Append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: u64,
    pub kind: OperationKind,
    pub description: String,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
}
