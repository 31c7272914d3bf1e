//! Periodic reward accrual and maturity closing
//!
//! One tick walks the active-stake index. Matured stakes are closed at the
//! current market price; the rest earn one day of reward up to the
//! contractual cap. Each stake is handled on its own: an oracle failure or a
//! storage error skips that stake until the next tick.

use chrono::{DateTime, Utc};
use pool_core::accounting::{is_insurance_eligible, next_balance, stake_price_change};
use pool_core::{OperationKind, Pool, PoolId, Stake, StakeId};
use pool_economics::PriceOracle;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{bounded, Result};
use crate::ledger::Ledger;
use crate::notify::Notifier;

/// Counts for one scheduler pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub scanned: usize,
    pub accrued: usize,
    pub capped: usize,
    pub closed: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum StakeOutcome {
    Accrued,
    Capped,
    Closed,
    Skipped,
}

pub struct AccrualScheduler {
    ledger: Arc<Ledger>,
    oracle: Arc<dyn PriceOracle>,
    notifier: Notifier,
    call_timeout: Duration,
}

impl AccrualScheduler {
    pub fn new(
        ledger: Arc<Ledger>,
        oracle: Arc<dyn PriceOracle>,
        notifier: Notifier,
        call_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            oracle,
            notifier,
            call_timeout,
        }
    }

    /// Tick every `interval` until `shutdown` flips to true
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) => debug!(?report, "Accrual tick finished"),
                        Err(e) => error!(error = %e, "❌ Accrual tick failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Accrual scheduler stopped");
                        return;
                    }
                }
            }
        }
    }

    /// One pass over all active stakes
    ///
    /// Fails only when the active-stake list itself cannot be loaded.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let stakes = self.ledger.active_stakes().await?;
        let mut report = TickReport {
            scanned: stakes.len(),
            ..TickReport::default()
        };
        let mut prices: HashMap<String, Decimal> = HashMap::new();

        for stake in stakes {
            let stake_id = stake.id;
            match self.process(stake, now, &mut prices).await {
                Ok(StakeOutcome::Accrued) => report.accrued += 1,
                Ok(StakeOutcome::Capped) => report.capped += 1,
                Ok(StakeOutcome::Closed) => report.closed += 1,
                Ok(StakeOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    warn!(stake = stake_id, error = %e, "⚠️  Stake update failed, retrying next tick");
                    report.failed += 1;
                }
            }
        }

        if report.closed > 0 || report.failed > 0 {
            info!(
                scanned = report.scanned,
                accrued = report.accrued,
                closed = report.closed,
                skipped = report.skipped,
                failed = report.failed,
                "⏱️  Accrual tick"
            );
        }
        Ok(report)
    }

    async fn process(
        &self,
        stake: Stake,
        now: DateTime<Utc>,
        prices: &mut HashMap<String, Decimal>,
    ) -> Result<StakeOutcome> {
        let pool = self.ledger.pool(stake.pool_id).await?;

        if stake.has_matured(now) {
            let price = match self.price(&pool.token_master, prices).await {
                Ok(price) => price,
                Err(e) => {
                    warn!(
                        stake = stake.id,
                        token = %pool.token_master,
                        error = %e,
                        "⚠️  No price for matured stake, closing next tick"
                    );
                    return Ok(StakeOutcome::Skipped);
                }
            };
            return self.close(stake.id, pool.id, price, now).await;
        }

        let _guard = self.ledger.lock_pool(pool.id).await;
        let mut stake = self.ledger.stake(stake.id).await?;
        if !stake.is_active {
            return Ok(StakeOutcome::Skipped);
        }
        match next_balance(&pool, &stake) {
            Some(balance) => {
                stake.balance = balance;
                self.ledger
                    .io("update stake", self.ledger.store().update_stake(&stake))
                    .await?;
                debug!(stake = stake.id, balance = %balance, "Reward accrued");
                Ok(StakeOutcome::Accrued)
            }
            None => Ok(StakeOutcome::Capped),
        }
    }

    /// Prices are looked up once per token per tick
    async fn price(
        &self,
        token_master: &str,
        prices: &mut HashMap<String, Decimal>,
    ) -> Result<Decimal> {
        if let Some(price) = prices.get(token_master) {
            return Ok(*price);
        }
        let price = bounded(
            self.call_timeout,
            "price lookup",
            self.oracle.get_usd_price(token_master),
        )
        .await?;
        prices.insert(token_master.to_string(), price);
        Ok(price)
    }

    async fn close(
        &self,
        stake_id: StakeId,
        pool_id: PoolId,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<StakeOutcome> {
        let _guard = self.ledger.lock_pool(pool_id).await;

        let mut stake = self.ledger.stake(stake_id).await?;
        if !stake.is_active {
            return Ok(StakeOutcome::Skipped);
        }
        stake.is_active = false;
        stake.close_date = Some(now);
        stake.jetton_price_closed = Some(price);
        self.ledger
            .io("update stake", self.ledger.store().update_stake(&stake))
            .await?;

        let mut pool = self.ledger.pool(pool_id).await?;
        self.ledger.refresh_temp_reserve(&mut pool).await?;
        self.ledger
            .io("update pool", self.ledger.store().update_pool(&pool))
            .await?;

        let message = closing_message(&pool, &stake);
        info!(
            stake = stake.id,
            pool = pool_id,
            balance = %stake.balance,
            price = %price,
            temp_reserve = %pool.temp_reserve,
            "🔒 Stake closed at maturity"
        );
        self.ledger
            .record(OperationKind::StakeClosed, stake.user_id, message.clone())
            .await;
        self.notifier.stake_closed(stake, message);
        Ok(StakeOutcome::Closed)
    }
}

fn closing_message(pool: &Pool, stake: &Stake) -> String {
    let change = stake_price_change(stake).unwrap_or(Decimal::ZERO).round_dp(2);
    if is_insurance_eligible(pool, stake) {
        format!(
            "Stake #{} in pool #{} has matured. The token price moved {}%, past the {}% coating: insurance can be claimed.",
            stake.id, pool.id, change, pool.insurance_coating_percent
        )
    } else {
        format!(
            "Stake #{} in pool #{} has matured with balance {}. The reward can be claimed.",
            stake.id, pool.id, stake.balance
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notification;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use pool_core::{MemoryStore, NewPool, User};
    use pool_economics::OracleError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct MockOracle {
        price: StdMutex<Option<Decimal>>,
        calls: AtomicUsize,
    }

    impl MockOracle {
        fn new(price: Option<Decimal>) -> Arc<Self> {
            Arc::new(Self {
                price: StdMutex::new(price),
                calls: AtomicUsize::new(0),
            })
        }

        fn set(&self, price: Option<Decimal>) {
            *self.price.lock().unwrap() = price;
        }
    }

    #[async_trait]
    impl PriceOracle for MockOracle {
        async fn get_usd_price(&self, token_master: &str) -> pool_economics::Result<Decimal> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.price
                .lock()
                .unwrap()
                .ok_or_else(|| OracleError::NoPrice(token_master.to_string()))
        }
    }

    async fn setup(
        oracle: Arc<MockOracle>,
    ) -> (
        Arc<Ledger>,
        AccrualScheduler,
        tokio::sync::mpsc::UnboundedReceiver<Notification>,
        User,
        u64,
    ) {
        let ledger = Arc::new(Ledger::new(Arc::new(MemoryStore::new())));
        let owner = ledger.register_user("0:owner").await.unwrap();
        let staker = ledger.register_user("0:staker").await.unwrap();
        let pool = ledger
            .create_pool(NewPool {
                owner_id: owner.id,
                reserve_deposit: Decimal::from(1000),
                token_master: "0:master".to_string(),
                deposit_address: "0:deposit".to_string(),
                reward_percent: Decimal::from(2),
                period_days: 10,
                insurance_coating_percent: Decimal::from(10),
            })
            .await
            .unwrap();
        ledger
            .pay_commission(pool.id, Decimal::ONE, Decimal::ONE)
            .await
            .unwrap();
        ledger.set_active(pool.id, true).await.unwrap();

        let (notifier, rx) = Notifier::channel();
        let scheduler =
            AccrualScheduler::new(Arc::clone(&ledger), oracle, notifier, Duration::from_secs(5));
        (ledger, scheduler, rx, staker, pool.id)
    }

    #[tokio::test]
    async fn test_accrual_until_cap() {
        let oracle = MockOracle::new(Some(Decimal::ONE));
        let (ledger, scheduler, _rx, staker, pool_id) = setup(oracle.clone()).await;
        let stake = ledger
            .create_stake(staker.id, pool_id, Decimal::from(50), Decimal::ONE)
            .await
            .unwrap();

        let now = stake.start_date;
        for _ in 0..12 {
            scheduler.tick(now).await.unwrap();
        }

        let stake = ledger.stake(stake.id).await.unwrap();
        // 50 + 10 × 1
        assert_eq!(stake.balance, Decimal::from(60));
        assert!(stake.is_active);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);

        let report = scheduler.tick(now).await.unwrap();
        assert_eq!(report.capped, 1);
    }

    #[tokio::test]
    async fn test_matured_stake_closes_and_notifies() {
        let oracle = MockOracle::new(Some(Decimal::new(85, 2)));
        let (ledger, scheduler, mut rx, staker, pool_id) = setup(oracle).await;
        let stake = ledger
            .create_stake(staker.id, pool_id, Decimal::from(50), Decimal::ONE)
            .await
            .unwrap();

        let later = stake.end_date + ChronoDuration::seconds(1);
        let report = scheduler.tick(later).await.unwrap();
        assert_eq!(report.closed, 1);

        let closed = ledger.stake(stake.id).await.unwrap();
        assert!(!closed.is_active);
        assert_eq!(closed.close_date, Some(later));
        assert_eq!(closed.jetton_price_closed, Some(Decimal::new(85, 2)));
        assert!(ledger.active_stakes().await.unwrap().is_empty());

        // Insurance of ceil(9 × 50) is now earmarked
        let pool = ledger.pool(pool_id).await.unwrap();
        assert_eq!(pool.temp_reserve, Decimal::from(550));

        match rx.recv().await.unwrap() {
            Notification::StakeClosed(n) => {
                assert_eq!(n.stake.id, stake.id);
                assert!(n.message.contains("insurance"));
            }
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oracle_failure_skips_until_next_tick() {
        let oracle = MockOracle::new(None);
        let (ledger, scheduler, _rx, staker, pool_id) = setup(oracle.clone()).await;
        let stake = ledger
            .create_stake(staker.id, pool_id, Decimal::from(50), Decimal::ONE)
            .await
            .unwrap();
        let later = stake.end_date + ChronoDuration::hours(1);

        let report = scheduler.tick(later).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(ledger.stake(stake.id).await.unwrap().is_active);

        oracle.set(Some(Decimal::ONE));
        let report = scheduler.tick(later).await.unwrap();
        assert_eq!(report.closed, 1);
    }

    #[tokio::test]
    async fn test_price_cached_within_tick() {
        let oracle = MockOracle::new(Some(Decimal::ONE));
        let (ledger, scheduler, _rx, staker, pool_id) = setup(oracle.clone()).await;
        let first = ledger
            .create_stake(staker.id, pool_id, Decimal::from(10), Decimal::ONE)
            .await
            .unwrap();
        ledger
            .create_stake(staker.id, pool_id, Decimal::from(10), Decimal::ONE)
            .await
            .unwrap();

        let later = first.end_date + ChronoDuration::days(1);
        let report = scheduler.tick(later).await.unwrap();
        assert_eq!(report.closed, 2);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_pool_isolated() {
        let oracle = MockOracle::new(Some(Decimal::ONE));
        let (ledger, scheduler, _rx, staker, pool_id) = setup(oracle).await;
        let stake = ledger
            .create_stake(staker.id, pool_id, Decimal::from(10), Decimal::ONE)
            .await
            .unwrap();

        let mut orphan = stake.clone();
        orphan.id = 0;
        orphan.pool_id = 404;
        ledger.store().save_stake(orphan).await.unwrap();

        let report = scheduler.tick(stake.start_date).await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.accrued, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let oracle = MockOracle::new(Some(Decimal::ONE));
        let (_ledger, scheduler, _rx, _staker, _pool_id) = setup(oracle).await;
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            scheduler.run(Duration::from_secs(60), rx).await;
        });
        tokio::time::sleep(Duration::from_secs(130)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
