//! Reward, insurance and reserve payouts
//!
//! Each payout holds the pool lock from the precondition check through the
//! transfer to the ledger update. Paid flags and reserve debits are written
//! only after the transfer succeeded, so any failure leaves the stake (or
//! pool) exactly as it was and the call can be retried.

use pool_core::accounting::{
    insurance_amount, is_insurance_eligible, outstanding_liability, temp_reserve,
};
use pool_core::{OperationKind, Pool, PoolId, Stake, StakeId, UserId};
use pool_wallet::{TransferExecutor, TransferRequest};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{bounded, LedgerError, Result};
use crate::ledger::Ledger;
use crate::notify::Notifier;

/// A completed transfer out of the treasury
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payout {
    pub stake_id: Option<StakeId>,
    pub pool_id: PoolId,
    pub recipient: String,
    pub amount: Decimal,
    pub tx_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClaimKind {
    Reward,
    Insurance,
}

pub struct Settlement {
    ledger: Arc<Ledger>,
    executor: Arc<dyn TransferExecutor>,
    notifier: Notifier,
    decimals: u8,
    call_timeout: Duration,
}

impl Settlement {
    pub fn new(
        ledger: Arc<Ledger>,
        executor: Arc<dyn TransferExecutor>,
        notifier: Notifier,
        decimals: u8,
        call_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            executor,
            notifier,
            decimals,
            call_timeout,
        }
    }

    /// Pay `balance` to the staker of a closed stake that kept its price
    pub async fn claim_reward(&self, stake_id: StakeId) -> Result<Payout> {
        self.claim(stake_id, ClaimKind::Reward).await
    }

    /// Pay `balance + insurance` to the staker of a closed stake past the coating
    pub async fn claim_insurance(&self, stake_id: StakeId) -> Result<Payout> {
        self.claim(stake_id, ClaimKind::Insurance).await
    }

    async fn claim(&self, stake_id: StakeId, kind: ClaimKind) -> Result<Payout> {
        let pool_id = self.ledger.stake(stake_id).await?.pool_id;
        let _guard = self.ledger.lock_pool(pool_id).await;

        let mut stake = self.ledger.stake(stake_id).await?;
        let mut pool = self.ledger.pool(pool_id).await?;

        if stake.is_settled() {
            return Err(LedgerError::AlreadySettled(stake_id));
        }
        if stake.is_active {
            return Err(LedgerError::StakeStillActive(stake_id));
        }

        let eligible = is_insurance_eligible(&pool, &stake);
        let (payout, debit) = match kind {
            ClaimKind::Reward if eligible => return Err(LedgerError::InsuranceEligible(stake_id)),
            ClaimKind::Insurance if !eligible => {
                return Err(LedgerError::NotInsuranceEligible(stake_id))
            }
            ClaimKind::Reward => (stake.balance, stake.accrued_reward()),
            ClaimKind::Insurance => {
                let insurance = insurance_amount(pool.reserve, stake.amount);
                (stake.balance + insurance, stake.accrued_reward() + insurance)
            }
        };

        if payout > pool.reserve {
            let shortfall = payout - pool.reserve;
            warn!(
                stake = stake_id,
                pool = pool_id,
                payout = %payout,
                reserve = %pool.reserve,
                "⚠️  Reserve cannot cover payout"
            );
            self.notifier.user(
                stake.user_id,
                format!(
                    "Payout of {} for stake #{} is delayed: pool #{} is short by {}.",
                    payout, stake_id, pool_id, shortfall
                ),
            );
            self.notifier.user(
                pool.owner_id,
                format!(
                    "Pool #{} cannot pay {} for stake #{}. Add at least {} to the reserve.",
                    pool_id, payout, stake_id, shortfall
                ),
            );
            return Err(LedgerError::InsufficientReserve {
                required: payout,
                available: pool.reserve,
                shortfall,
            });
        }

        let recipient = self.ledger.user(stake.user_id).await?.wallet_address;
        let comment = match kind {
            ClaimKind::Reward => format!("Reward for stake #{}", stake_id),
            ClaimKind::Insurance => format!("Insurance for stake #{}", stake_id),
        };
        let tx_hash = self.transfer(&pool, &recipient, payout, comment).await?;

        match kind {
            ClaimKind::Reward => stake.is_reward_paid = true,
            ClaimKind::Insurance => stake.is_insurance_paid = true,
        }
        pool.reserve -= debit;
        if let Err(e) = self.persist_claim(&stake, &mut pool).await {
            error!(
                stake = stake_id,
                tx = %tx_hash,
                error = %e,
                "❌ Transfer sent but ledger update failed, reconcile manually"
            );
            return Err(e);
        }

        let (op, label) = match kind {
            ClaimKind::Reward => (OperationKind::RewardClaimed, "reward"),
            ClaimKind::Insurance => (OperationKind::InsuranceClaimed, "insurance"),
        };
        info!(
            stake = stake_id,
            pool = pool_id,
            amount = %payout,
            reserve = %pool.reserve,
            tx = %tx_hash,
            "✅ Paid {}", label
        );
        self.ledger
            .record(
                op,
                stake.user_id,
                format!("Paid {} {} for stake #{} (tx {})", label, payout, stake_id, tx_hash),
            )
            .await;

        Ok(Payout {
            stake_id: Some(stake_id),
            pool_id,
            recipient,
            amount: payout,
            tx_hash,
        })
    }

    /// Stake flag and reserve debit land together or not at all
    async fn persist_claim(&self, stake: &Stake, pool: &mut Pool) -> Result<()> {
        let mut stakes = self.ledger.stakes_by_pool(pool.id).await?;
        for settled in stakes.iter_mut().filter(|s| s.id == stake.id) {
            *settled = stake.clone();
        }
        pool.temp_reserve = temp_reserve(pool, &stakes);
        self.ledger
            .io("settle claim", self.ledger.store().settle_claim(stake, pool))
            .await
    }

    /// Owner takes back whatever the reserve holds beyond what closed stakes are owed
    pub async fn withdraw_reserve(&self, pool_id: PoolId, requester: UserId) -> Result<Payout> {
        let _guard = self.ledger.lock_pool(pool_id).await;
        let mut pool = self.ledger.pool(pool_id).await?;

        if pool.owner_id != requester {
            return Err(LedgerError::NotOwner {
                pool_id,
                user_id: requester,
            });
        }
        if pool.reserve <= Decimal::ZERO {
            return Err(LedgerError::InvalidParameter(format!(
                "pool #{} has no reserve",
                pool_id
            )));
        }
        if pool.is_active {
            return Err(LedgerError::PoolStillActive(pool_id));
        }
        if !pool.is_commission_paid {
            return Err(LedgerError::CommissionUnpaid(pool_id));
        }

        let stakes = self.ledger.stakes_by_pool(pool_id).await?;
        let active = stakes.iter().filter(|stake| stake.is_active).count();
        if active > 0 {
            return Err(LedgerError::ActiveStakesRemain {
                pool_id,
                count: active,
            });
        }

        let liabilities = outstanding_liability(&pool, &stakes);
        if liabilities > pool.reserve {
            let shortfall = liabilities - pool.reserve;
            warn!(
                pool = pool_id,
                liabilities = %liabilities,
                reserve = %pool.reserve,
                shortfall = %shortfall,
                "⚠️  Withdrawal refused: liabilities exceed reserve"
            );
            return Err(LedgerError::InsufficientReserve {
                required: liabilities,
                available: pool.reserve,
                shortfall,
            });
        }

        let amount = pool.reserve - liabilities;
        if amount.is_zero() {
            return Err(LedgerError::InvalidParameter(format!(
                "pool #{} reserve is fully owed to stakers",
                pool_id
            )));
        }

        let recipient = self.ledger.user(pool.owner_id).await?.wallet_address;
        let tx_hash = self
            .transfer(
                &pool,
                &recipient,
                amount,
                format!("Reserve withdrawal from pool #{}", pool_id),
            )
            .await?;

        pool.reserve = Decimal::ZERO;
        pool.temp_reserve = -liabilities;
        if let Err(e) = self
            .ledger
            .io("update pool", self.ledger.store().update_pool(&pool))
            .await
        {
            error!(
                pool = pool_id,
                tx = %tx_hash,
                error = %e,
                "❌ Transfer sent but ledger update failed, reconcile manually"
            );
            return Err(e);
        }

        info!(pool = pool_id, amount = %amount, tx = %tx_hash, "🏧 Reserve withdrawn");
        self.ledger
            .record(
                OperationKind::ReserveWithdrawn,
                pool.owner_id,
                format!("Withdrew {} from pool #{} (tx {})", amount, pool_id, tx_hash),
            )
            .await;

        Ok(Payout {
            stake_id: None,
            pool_id,
            recipient,
            amount,
            tx_hash,
        })
    }

    async fn transfer(
        &self,
        pool: &Pool,
        destination: &str,
        amount: Decimal,
        comment: String,
    ) -> Result<String> {
        let request = TransferRequest {
            token_master: pool.token_master.clone(),
            destination: destination.to_string(),
            amount,
            decimals: self.decimals,
            comment,
        };
        bounded(self.call_timeout, "transfer", self.executor.send(&request))
            .await
            .map_err(|e| {
                warn!(pool = pool.id, destination = %destination, error = %e, "⚠️  Transfer failed, nothing recorded");
                e
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::notify::Notification;
    use async_trait::async_trait;
    use pool_core::{MemoryStore, NewPool};
    use pool_wallet::{TokenMetadata, TransferError};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockExecutor {
        sends: AtomicUsize,
        failing: AtomicBool,
    }

    #[async_trait]
    impl TransferExecutor for MockExecutor {
        async fn send(&self, request: &TransferRequest) -> pool_wallet::Result<String> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(TransferError::Rejected {
                    status: 503,
                    message: "unavailable".to_string(),
                });
            }
            let n = self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(format!("tx{}-{}", n, request.destination))
        }

        async fn resolve_token_wallet(
            &self,
            _token_master: &str,
            owner: &str,
        ) -> pool_wallet::Result<String> {
            Ok(format!("{}-wallet", owner))
        }

        async fn token_metadata(&self, _token_master: &str) -> pool_wallet::Result<TokenMetadata> {
            Ok(TokenMetadata {
                name: "Test".to_string(),
                symbol: "TST".to_string(),
                decimals: 9,
                total_supply: "0".to_string(),
            })
        }
    }

    struct Fixture {
        ledger: Arc<Ledger>,
        executor: Arc<MockExecutor>,
        settlement: Arc<Settlement>,
        notifications: tokio::sync::mpsc::UnboundedReceiver<Notification>,
        owner: UserId,
        staker: UserId,
        pool_id: PoolId,
    }

    async fn fixture(reserve: i64) -> Fixture {
        let ledger = Arc::new(Ledger::new(Arc::new(MemoryStore::new())));
        let owner = ledger.register_user("0:owner").await.unwrap().id;
        let staker = ledger.register_user("0:staker").await.unwrap().id;
        let pool = ledger
            .create_pool(NewPool {
                owner_id: owner,
                reserve_deposit: Decimal::from(reserve),
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

        let executor = Arc::new(MockExecutor::default());
        let (notifier, notifications) = Notifier::channel();
        let settlement = Arc::new(Settlement::new(
            Arc::clone(&ledger),
            executor.clone(),
            notifier,
            9,
            Duration::from_secs(5),
        ));
        Fixture {
            ledger,
            executor,
            settlement,
            notifications,
            owner,
            staker,
            pool_id: pool.id,
        }
    }

    /// Stake closed at maturity with the given balance and closing price
    async fn closed_stake(f: &Fixture, amount: i64, balance: i64, closed_price: Decimal) -> Stake {
        let mut stake = f
            .ledger
            .create_stake(f.staker, f.pool_id, Decimal::from(amount), Decimal::ONE)
            .await
            .unwrap();
        stake.is_active = false;
        stake.balance = Decimal::from(balance);
        stake.close_date = Some(stake.end_date);
        stake.jetton_price_closed = Some(closed_price);
        f.ledger.store().update_stake(&stake).await.unwrap();
        stake
    }

    #[tokio::test]
    async fn test_claim_reward_pays_and_debits() {
        let f = fixture(1000).await;
        let stake = closed_stake(&f, 50, 60, Decimal::ONE).await;

        let payout = f.settlement.claim_reward(stake.id).await.unwrap();
        assert_eq!(payout.amount, Decimal::from(60));
        assert_eq!(payout.recipient, "0:staker");

        let stake = f.ledger.stake(stake.id).await.unwrap();
        assert!(stake.is_reward_paid);
        assert!(!stake.is_insurance_paid);

        let pool = f.ledger.pool(f.pool_id).await.unwrap();
        assert_eq!(pool.reserve, Decimal::from(990));
        assert_eq!(pool.temp_reserve, Decimal::from(990));
    }

    #[tokio::test]
    async fn test_second_claim_is_already_settled_without_transfer() {
        let f = fixture(1000).await;
        let stake = closed_stake(&f, 50, 60, Decimal::ONE).await;

        f.settlement.claim_reward(stake.id).await.unwrap();
        let err = f.settlement.claim_reward(stake.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadySettled);
        let err = f.settlement.claim_insurance(stake.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadySettled);

        assert_eq!(f.executor.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_pay_once() {
        let f = fixture(1000).await;
        let stake = closed_stake(&f, 50, 60, Decimal::ONE).await;

        let stake_id = stake.id;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let settlement = Arc::clone(&f.settlement);
            handles.push(tokio::spawn(async move {
                settlement.claim_reward(stake_id).await
            }));
        }
        let mut paid = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => paid += 1,
                Err(e) => assert_eq!(e.kind(), ErrorKind::AlreadySettled),
            }
        }
        assert_eq!(paid, 1);
        assert_eq!(f.executor.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_claim_routes_by_price_drop() {
        let f = fixture(1000).await;
        let insured = closed_stake(&f, 10, 12, Decimal::new(85, 2)).await;

        assert!(matches!(
            f.settlement.claim_reward(insured.id).await,
            Err(LedgerError::InsuranceEligible(_))
        ));

        let payout = f.settlement.claim_insurance(insured.id).await.unwrap();
        // 12 + ceil(9 × 10)
        assert_eq!(payout.amount, Decimal::from(102));

        let pool = f.ledger.pool(f.pool_id).await.unwrap();
        // debit of reward 2 + insurance 90
        assert_eq!(pool.reserve, Decimal::from(908));

        let rewarded = closed_stake(&f, 10, 12, Decimal::new(95, 2)).await;
        assert!(matches!(
            f.settlement.claim_insurance(rewarded.id).await,
            Err(LedgerError::NotInsuranceEligible(_))
        ));
    }

    #[tokio::test]
    async fn test_active_stake_cannot_be_claimed() {
        let f = fixture(1000).await;
        let stake = f
            .ledger
            .create_stake(f.staker, f.pool_id, Decimal::from(10), Decimal::ONE)
            .await
            .unwrap();
        assert!(matches!(
            f.settlement.claim_reward(stake.id).await,
            Err(LedgerError::StakeStillActive(_))
        ));
        assert!(matches!(
            f.settlement.claim_reward(999).await,
            Err(LedgerError::StakeNotFound(999))
        ));
    }

    #[tokio::test]
    async fn test_transfer_failure_leaves_stake_retriable() {
        let f = fixture(1000).await;
        let stake = closed_stake(&f, 50, 60, Decimal::ONE).await;

        f.executor.failing.store(true, Ordering::SeqCst);
        let err = f.settlement.claim_reward(stake.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalUnavailable);
        assert!(err.is_retriable());

        let unchanged = f.ledger.stake(stake.id).await.unwrap();
        assert!(!unchanged.is_reward_paid);
        assert_eq!(f.ledger.pool(f.pool_id).await.unwrap().reserve, Decimal::from(1000));

        f.executor.failing.store(false, Ordering::SeqCst);
        f.settlement.claim_reward(stake.id).await.unwrap();
        assert!(f.ledger.stake(stake.id).await.unwrap().is_reward_paid);
    }

    #[tokio::test]
    async fn test_insufficient_reserve_notifies_both_parties() {
        let mut f = fixture(1000).await;
        let stake = closed_stake(&f, 50, 60, Decimal::ONE).await;

        let mut pool = f.ledger.pool(f.pool_id).await.unwrap();
        pool.reserve = Decimal::from(40);
        f.ledger.store().update_pool(&pool).await.unwrap();

        match f.settlement.claim_reward(stake.id).await.unwrap_err() {
            LedgerError::InsufficientReserve { shortfall, .. } => {
                assert_eq!(shortfall, Decimal::from(20))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(f.executor.sends.load(Ordering::SeqCst), 0);

        let first = f.notifications.recv().await.unwrap();
        let second = f.notifications.recv().await.unwrap();
        assert_eq!(first.recipient(), f.staker);
        assert_eq!(second.recipient(), f.owner);
    }

    #[tokio::test]
    async fn test_withdraw_reserve() {
        let f = fixture(1000).await;
        let _owed = closed_stake(&f, 10, 12, Decimal::ONE).await;
        f.ledger.set_active(f.pool_id, false).await.unwrap();

        assert!(matches!(
            f.settlement.withdraw_reserve(f.pool_id, f.staker).await,
            Err(LedgerError::NotOwner { .. })
        ));

        let payout = f.settlement.withdraw_reserve(f.pool_id, f.owner).await.unwrap();
        // 1000 − reward 2 still owed
        assert_eq!(payout.amount, Decimal::from(998));
        assert_eq!(payout.recipient, "0:owner");

        let pool = f.ledger.pool(f.pool_id).await.unwrap();
        assert_eq!(pool.reserve, Decimal::ZERO);
        assert_eq!(pool.temp_reserve, Decimal::from(-2));
    }

    #[tokio::test]
    async fn test_withdraw_reserve_guards() {
        let f = fixture(1000).await;
        let active = f
            .ledger
            .create_stake(f.staker, f.pool_id, Decimal::from(10), Decimal::ONE)
            .await
            .unwrap();

        assert!(matches!(
            f.settlement.withdraw_reserve(f.pool_id, f.owner).await,
            Err(LedgerError::PoolStillActive(_))
        ));

        f.ledger.set_active(f.pool_id, false).await.unwrap();
        assert!(matches!(
            f.settlement.withdraw_reserve(f.pool_id, f.owner).await,
            Err(LedgerError::ActiveStakesRemain { count: 1, .. })
        ));
        assert_eq!(f.ledger.stake(active.id).await.unwrap().id, active.id);
        assert_eq!(f.executor.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_withdraw_reports_exact_shortfall() {
        let f = fixture(100).await;
        // Two insured stakes owe ceil(9 × 9) + 3 = 84 each
        closed_stake(&f, 9, 12, Decimal::new(5, 1)).await;
        closed_stake(&f, 9, 12, Decimal::new(5, 1)).await;
        f.ledger.set_active(f.pool_id, false).await.unwrap();

        match f.settlement.withdraw_reserve(f.pool_id, f.owner).await.unwrap_err() {
            LedgerError::InsufficientReserve {
                required,
                available,
                shortfall,
            } => {
                assert_eq!(required, Decimal::from(168));
                assert_eq!(available, Decimal::from(100));
                assert_eq!(shortfall, Decimal::from(68));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(f.executor.sends.load(Ordering::SeqCst), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_paid_flags_mutually_exclusive(
            price_cents in 1i64..200,
            claims in proptest::collection::vec(any::<bool>(), 1..6),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let f = fixture(10_000).await;
                let stake = closed_stake(&f, 10, 12, Decimal::new(price_cents, 2)).await;

                for insurance in claims {
                    let _ = if insurance {
                        f.settlement.claim_insurance(stake.id).await
                    } else {
                        f.settlement.claim_reward(stake.id).await
                    };
                    let current = f.ledger.stake(stake.id).await.unwrap();
                    assert!(!(current.is_reward_paid && current.is_insurance_paid));
                }
                assert!(f.executor.sends.load(Ordering::SeqCst) <= 1);
            });
        }
    }
}
