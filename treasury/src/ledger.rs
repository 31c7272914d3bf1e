//! Pool/stake ledger
//!
//! Every mutation of a pool or of one of its stakes runs while holding that
//! pool's async mutex, so check and write are never interleaved with another
//! mutator of the same pool. Settlement and the accrual scheduler take the
//! same lock through [`Ledger::lock_pool`].

use chrono::Utc;
use dashmap::DashMap;
use pool_core::accounting::{self, capacity_left, fits_capacity};
use pool_core::constants::{
    MAX_REWARD_PERCENT, MIN_PERIOD_DAYS, MIN_RESERVE_DEPOSIT, MIN_REWARD_PERCENT,
};
use pool_core::{
    LedgerStore, NewPool, Operation, OperationKind, Page, Pool, PoolId, Stake, StakeId, User,
    StoreError, UserId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::error::{bounded, LedgerError, Result};

/// Default deadline for a single persistence call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity and liability figures for one pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSummary {
    pub pool: Pool,
    pub active_stakes: usize,
    pub active_principal: Decimal,
    pub capacity_left: Decimal,
    pub outstanding_liability: Decimal,
    pub temp_reserve: Decimal,
}

pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    locks: DashMap<PoolId, Arc<Mutex<()>>>,
    call_timeout: Duration,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self::with_timeout(store, DEFAULT_CALL_TIMEOUT)
    }

    pub fn with_timeout(store: Arc<dyn LedgerStore>, call_timeout: Duration) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            call_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Exclusive access to a pool and its stakes
    pub async fn lock_pool(&self, pool_id: PoolId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(pool_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    pub(crate) async fn io<T, F>(&self, what: &str, call: F) -> Result<T>
    where
        F: Future<Output = pool_core::StoreResult<T>>,
    {
        bounded(self.call_timeout, what, call).await
    }

    // Users

    pub async fn register_user(&self, wallet_address: &str) -> Result<User> {
        if wallet_address.trim().is_empty() {
            return Err(LedgerError::InvalidParameter(
                "wallet address is empty".to_string(),
            ));
        }
        if let Some(user) = self
            .io("find user", self.store.find_user_by_address(wallet_address))
            .await?
        {
            return Ok(user);
        }
        match self.io("save user", self.store.save_user(wallet_address)).await {
            Ok(user) => {
                info!(user = user.id, address = %wallet_address, "👤 User registered");
                Ok(user)
            }
            // Registered concurrently by another request
            Err(LedgerError::Storage(StoreError::Duplicate(what))) => self
                .io("find user", self.store.find_user_by_address(wallet_address))
                .await?
                .ok_or(LedgerError::Storage(StoreError::Duplicate(what))),
            Err(e) => Err(e),
        }
    }

    pub async fn user(&self, user_id: UserId) -> Result<User> {
        self.io("find user", self.store.find_user(user_id))
            .await?
            .ok_or(LedgerError::UserNotFound(user_id))
    }

    // Reads

    pub async fn pool(&self, pool_id: PoolId) -> Result<Pool> {
        self.io("find pool", self.store.find_pool(pool_id))
            .await?
            .ok_or(LedgerError::PoolNotFound(pool_id))
    }

    pub async fn stake(&self, stake_id: StakeId) -> Result<Stake> {
        self.io("find stake", self.store.find_stake(stake_id))
            .await?
            .ok_or(LedgerError::StakeNotFound(stake_id))
    }

    pub async fn pools(&self, page: Page) -> Result<Vec<Pool>> {
        self.io("list pools", self.store.list_pools(page)).await
    }

    pub async fn pools_by_owner(&self, owner_id: UserId, page: Page) -> Result<Vec<Pool>> {
        self.io("list pools", self.store.list_pools_by_owner(owner_id, page))
            .await
    }

    pub async fn stakes_by_pool(&self, pool_id: PoolId) -> Result<Vec<Stake>> {
        self.io("list stakes", self.store.list_stakes_by_pool(pool_id))
            .await
    }

    pub async fn stakes_by_user(&self, user_id: UserId, page: Page) -> Result<Vec<Stake>> {
        self.io("list stakes", self.store.list_stakes_by_user(user_id, page))
            .await
    }

    pub async fn active_stakes(&self) -> Result<Vec<Stake>> {
        self.io("list active stakes", self.store.list_active_stakes())
            .await
    }

    pub async fn operations(&self, user_id: UserId, page: Page) -> Result<Vec<Operation>> {
        self.io("list operations", self.store.list_operations_by_user(user_id, page))
            .await
    }

    // Pools

    pub async fn create_pool(&self, params: NewPool) -> Result<Pool> {
        validate_new_pool(&params)?;
        self.user(params.owner_id).await?;

        let pool = Pool {
            id: 0,
            owner_id: params.owner_id,
            deposit_address: params.deposit_address,
            token_master: params.token_master,
            reserve: params.reserve_deposit,
            temp_reserve: params.reserve_deposit,
            reward_percent: params.reward_percent,
            period_days: params.period_days,
            insurance_coating_percent: params.insurance_coating_percent,
            is_active: false,
            is_commission_paid: false,
            created_at: Utc::now(),
        };
        let pool = self.io("save pool", self.store.save_pool(pool)).await?;

        info!(
            pool = pool.id,
            owner = pool.owner_id,
            reserve = %pool.reserve,
            reward_percent = %pool.reward_percent,
            period_days = pool.period_days,
            "🏦 Pool created"
        );
        self.record(
            OperationKind::PoolCreated,
            pool.owner_id,
            format!("Pool #{} created with reserve {}", pool.id, pool.reserve),
        )
        .await;
        Ok(pool)
    }

    /// Returns the new total reserve
    pub async fn add_reserve(&self, pool_id: PoolId, amount: Decimal) -> Result<Decimal> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidParameter(format!(
                "reserve top-up must be positive, got {}",
                amount
            )));
        }

        let _guard = self.lock_pool(pool_id).await;
        let mut pool = self.pool(pool_id).await?;
        pool.reserve += amount;
        self.refresh_temp_reserve(&mut pool).await?;
        self.io("update pool", self.store.update_pool(&pool)).await?;

        info!(pool = pool_id, added = %amount, reserve = %pool.reserve, "💰 Reserve added");
        self.record(
            OperationKind::ReserveAdded,
            pool.owner_id,
            format!("Added {} to pool #{} reserve", amount, pool_id),
        )
        .await;
        Ok(pool.reserve)
    }

    /// Mark the commission paid when `amount` covers `required`
    ///
    /// Paying an already paid commission is a no-op.
    pub async fn pay_commission(
        &self,
        pool_id: PoolId,
        amount: Decimal,
        required: Decimal,
    ) -> Result<Pool> {
        let _guard = self.lock_pool(pool_id).await;
        let mut pool = self.pool(pool_id).await?;

        if pool.is_commission_paid {
            debug!(pool = pool_id, "Commission already paid");
            return Ok(pool);
        }
        if amount < required {
            return Err(LedgerError::InvalidParameter(format!(
                "commission {} is below the required {}",
                amount, required
            )));
        }

        pool.is_commission_paid = true;
        self.io("update pool", self.store.update_pool(&pool)).await?;

        info!(pool = pool_id, amount = %amount, "🧾 Commission paid");
        self.record(
            OperationKind::CommissionPaid,
            pool.owner_id,
            format!("Commission {} paid for pool #{}", amount, pool_id),
        )
        .await;
        Ok(pool)
    }

    pub async fn set_active(&self, pool_id: PoolId, active: bool) -> Result<Pool> {
        let _guard = self.lock_pool(pool_id).await;
        let mut pool = self.pool(pool_id).await?;

        if active && !pool.is_commission_paid {
            return Err(LedgerError::CommissionUnpaid(pool_id));
        }
        if pool.is_active == active {
            return Ok(pool);
        }

        pool.is_active = active;
        self.io("update pool", self.store.update_pool(&pool)).await?;

        let kind = if active {
            info!(pool = pool_id, "🟢 Pool opened for staking");
            OperationKind::PoolActivated
        } else {
            info!(pool = pool_id, "🔴 Pool closed for staking");
            OperationKind::PoolDeactivated
        };
        self.record(kind, pool.owner_id, format!("Pool #{} {}", pool_id, kind))
            .await;
        Ok(pool)
    }

    pub async fn delete_pool(&self, pool_id: PoolId) -> Result<()> {
        let _guard = self.lock_pool(pool_id).await;
        let pool = self.pool(pool_id).await?;

        if !pool.reserve.is_zero() {
            return Err(LedgerError::ReserveNotEmpty(pool_id));
        }
        if pool.is_active {
            return Err(LedgerError::PoolStillActive(pool_id));
        }
        let stakes = self.stakes_by_pool(pool_id).await?;
        if stakes.iter().any(|stake| !stake.is_settled()) {
            return Err(LedgerError::UnsettledStakesExist(pool_id));
        }

        self.io("delete pool", self.store.delete_pool(pool_id)).await?;
        self.locks.remove(&pool_id);

        info!(pool = pool_id, "🗑️  Pool deleted");
        self.record(
            OperationKind::PoolDeleted,
            pool.owner_id,
            format!("Pool #{} deleted", pool_id),
        )
        .await;
        Ok(())
    }

    // Stakes

    pub async fn create_stake(
        &self,
        user_id: UserId,
        pool_id: PoolId,
        amount: Decimal,
        price_at_creation: Decimal,
    ) -> Result<Stake> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidParameter(format!(
                "stake amount must be positive, got {}",
                amount
            )));
        }
        if price_at_creation < Decimal::ZERO {
            return Err(LedgerError::InvalidParameter(format!(
                "price must not be negative, got {}",
                price_at_creation
            )));
        }
        self.user(user_id).await?;

        let _guard = self.lock_pool(pool_id).await;
        let pool = self.pool(pool_id).await?;
        if !pool.is_active {
            return Err(LedgerError::PoolInactive(pool_id));
        }

        let stakes = self.stakes_by_pool(pool_id).await?;
        let active_principal = active_principal(&stakes);
        if !fits_capacity(active_principal, amount, pool.reserve) {
            let available = capacity_left(active_principal, pool.reserve);
            warn!(
                pool = pool_id,
                requested = %amount,
                available = %available,
                "⚠️  Stake rejected: capacity exceeded"
            );
            return Err(LedgerError::CapacityExceeded {
                pool_id,
                requested: amount,
                available,
            });
        }

        let start = Utc::now();
        let stake = Stake {
            id: 0,
            user_id,
            pool_id,
            amount,
            balance: amount,
            start_date: start,
            end_date: Stake::term_end(start, pool.period_days),
            close_date: None,
            is_active: true,
            deposit_creation_price: price_at_creation,
            jetton_price_closed: None,
            is_reward_paid: false,
            is_insurance_paid: false,
        };
        let stake = self.io("save stake", self.store.save_stake(stake)).await?;

        info!(
            stake = stake.id,
            pool = pool_id,
            user = user_id,
            amount = %amount,
            price = %price_at_creation,
            "📥 Stake created"
        );
        self.record(
            OperationKind::StakeCreated,
            user_id,
            format!("Staked {} in pool #{} (stake #{})", amount, pool_id, stake.id),
        )
        .await;
        Ok(stake)
    }

    /// Recompute `temp_reserve` from the pool's current stakes
    ///
    /// The caller holds the pool lock and persists the pool.
    pub async fn refresh_temp_reserve(&self, pool: &mut Pool) -> Result<()> {
        let stakes = self.stakes_by_pool(pool.id).await?;
        pool.temp_reserve = accounting::temp_reserve(pool, &stakes);
        Ok(())
    }

    pub async fn pool_summary(&self, pool_id: PoolId) -> Result<PoolSummary> {
        let pool = self.pool(pool_id).await?;
        let stakes = self.stakes_by_pool(pool_id).await?;

        let active_principal = active_principal(&stakes);
        let outstanding_liability = accounting::outstanding_liability(&pool, &stakes);
        Ok(PoolSummary {
            active_stakes: stakes.iter().filter(|stake| stake.is_active).count(),
            capacity_left: capacity_left(active_principal, pool.reserve),
            temp_reserve: pool.reserve - outstanding_liability,
            active_principal,
            outstanding_liability,
            pool,
        })
    }

    /// Append an audit record; a failed append never undoes the action
    pub(crate) async fn record(&self, kind: OperationKind, user_id: UserId, description: String) {
        if let Err(e) = self
            .io(
                "append operation",
                self.store.append_operation(kind, user_id, &description),
            )
            .await
        {
            warn!(kind = %kind, user = user_id, error = %e, "Failed to record operation");
        }
    }
}

/// Principal of stakes still flagged active
pub fn active_principal(stakes: &[Stake]) -> Decimal {
    stakes
        .iter()
        .filter(|stake| stake.is_active)
        .map(|stake| stake.amount)
        .sum()
}

fn validate_new_pool(params: &NewPool) -> Result<()> {
    if params.reserve_deposit < MIN_RESERVE_DEPOSIT {
        return Err(LedgerError::InvalidParameter(format!(
            "reserve deposit must be at least {}, got {}",
            MIN_RESERVE_DEPOSIT, params.reserve_deposit
        )));
    }
    if params.token_master.trim().is_empty() || params.deposit_address.trim().is_empty() {
        return Err(LedgerError::InvalidParameter(
            "token wallet is empty".to_string(),
        ));
    }
    if params.reward_percent < MIN_REWARD_PERCENT || params.reward_percent > MAX_REWARD_PERCENT {
        return Err(LedgerError::InvalidParameter(format!(
            "reward percent must be within [{}, {}], got {}",
            MIN_REWARD_PERCENT, MAX_REWARD_PERCENT, params.reward_percent
        )));
    }
    if params.period_days < MIN_PERIOD_DAYS {
        return Err(LedgerError::InvalidParameter(format!(
            "period must be at least {} day, got {}",
            MIN_PERIOD_DAYS, params.period_days
        )));
    }
    if params.insurance_coating_percent < Decimal::ZERO
        || params.insurance_coating_percent > Decimal::ONE_HUNDRED
    {
        return Err(LedgerError::InvalidParameter(format!(
            "insurance coating must be within [0, 100], got {}",
            params.insurance_coating_percent
        )));
    }
    Ok(())
}
