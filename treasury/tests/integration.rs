//! End-to-end flow: ledger feed → decoder → dispatcher → commands → ledger
//! → accrual → settlement

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use pool_core::{LedgerStore, MemoryStore, OperationKind, Page};
use pool_economics::PriceOracle;
use pool_network::protocol::{build_forward_payload, build_transfer_notification};
use pool_network::{
    Dispatcher, Handled, InboundMessage, IngestionCursor, IngestionPipeline, LedgerTransaction, MsgAddress,
    OperationType, SubmitTransaction,
};
use pool_treasury::{
    AccrualScheduler, CommandOutcome, CommandProcessor, CommandSettings, ErrorKind, Ledger,
    Notification, Notifier, Settlement,
};
use pool_wallet::{TokenMetadata, TransferExecutor, TransferRequest};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const DEPOSIT_WALLET: &str = "0:5555555555555555555555555555555555555555555555555555555555555555";
const UNITS: u128 = 1_000_000_000;

struct StaticOracle(Decimal);

#[async_trait]
impl PriceOracle for StaticOracle {
    async fn get_usd_price(&self, _token_master: &str) -> pool_economics::Result<Decimal> {
        Ok(self.0)
    }
}

#[derive(Default)]
struct RecordingExecutor {
    sent: Mutex<Vec<TransferRequest>>,
    counter: AtomicUsize,
}

#[async_trait]
impl TransferExecutor for RecordingExecutor {
    async fn send(&self, request: &TransferRequest) -> pool_wallet::Result<String> {
        self.sent.lock().unwrap().push(request.clone());
        Ok(format!("out{}", self.counter.fetch_add(1, Ordering::SeqCst)))
    }

    async fn resolve_token_wallet(
        &self,
        _token_master: &str,
        _owner: &str,
    ) -> pool_wallet::Result<String> {
        Ok(DEPOSIT_WALLET.to_string())
    }

    async fn token_metadata(&self, _token_master: &str) -> pool_wallet::Result<TokenMetadata> {
        Ok(TokenMetadata {
            name: "Pool Token".to_string(),
            symbol: "POOL".to_string(),
            decimals: 9,
            total_supply: "1000000000000000".to_string(),
        })
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    ledger: Arc<Ledger>,
    pipeline: IngestionPipeline,
    commands: mpsc::UnboundedReceiver<SubmitTransaction>,
    processor: CommandProcessor,
    scheduler: AccrualScheduler,
    settlement: Settlement,
    executor: Arc<RecordingExecutor>,
    notifications: mpsc::UnboundedReceiver<Notification>,
    next_lt: u64,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(Ledger::new(store.clone()));
        let oracle: Arc<dyn PriceOracle> = Arc::new(StaticOracle(Decimal::ONE));
        let executor = Arc::new(RecordingExecutor::default());
        let (notifier, notifications) = Notifier::channel();
        let (dispatcher, commands) = Dispatcher::channel();
        let timeout = Duration::from_secs(5);
        let cursor = IngestionCursor::new(store.clone());

        Self {
            pipeline: IngestionPipeline::new(dispatcher, Arc::clone(&cursor)),
            processor: CommandProcessor::new(
                Arc::clone(&ledger),
                Arc::clone(&oracle),
                executor.clone(),
                CommandSettings {
                    token_decimals: 9,
                    commission_amount: Decimal::from(5),
                    treasury_address: "0:treasury".to_string(),
                },
                timeout,
            )
            .with_cursor(cursor),
            scheduler: AccrualScheduler::new(
                Arc::clone(&ledger),
                oracle,
                notifier.clone(),
                timeout,
            ),
            settlement: Settlement::new(
                Arc::clone(&ledger),
                executor.clone(),
                notifier,
                9,
                timeout,
            ),
            store,
            ledger,
            commands,
            executor,
            notifications,
            next_lt: 100,
        }
    }

    /// Push one jetton deposit through ingestion and the command processor
    async fn deposit(
        &mut self,
        sender: &MsgAddress,
        tokens: u128,
        op: OperationType,
        payload: serde_json::Value,
    ) -> pool_treasury::Result<CommandOutcome> {
        self.next_lt += 1;
        let forward =
            build_forward_payload(op.code(), &serde_json::to_vec(&payload).unwrap()).unwrap();
        let body = build_transfer_notification(self.next_lt, tokens * UNITS, sender, forward, false)
            .unwrap()
            .to_boc();
        let tx = LedgerTransaction {
            hash: format!("in{}", self.next_lt),
            lt: self.next_lt,
            utime: 0,
            in_msg: Some(InboundMessage {
                source: Some(DEPOSIT_WALLET.to_string()),
                value: 50_000_000,
                body,
                ..Default::default()
            }),
        };

        assert_eq!(self.pipeline.process(&tx).await.unwrap(), Handled::Dispatched);
        let request = self.commands.try_recv().unwrap();
        assert_eq!(request.operation_type, op);
        self.processor.handle(request).await
    }
}

#[tokio::test]
async fn test_pool_lifecycle_end_to_end() {
    let mut h = Harness::new();
    let owner = MsgAddress::new(0, [0x01; 32]);
    let staker = MsgAddress::new(0, [0x02; 32]);

    // Owner creates a pool with a 1000 token reserve and pays the commission
    let pool = match h
        .deposit(
            &owner,
            1000,
            OperationType::CreatePool,
            serde_json::json!({
                "token_master": "0:master",
                "reward_percent": "2",
                "period_days": 10,
                "insurance_coating_percent": "10"
            }),
        )
        .await
        .unwrap()
    {
        CommandOutcome::PoolCreated(pool) => pool,
        other => panic!("unexpected outcome: {other:?}"),
    };
    let target = serde_json::json!({ "pool_id": pool.id });

    // Staking into a closed pool is refused
    let err = h
        .deposit(&staker, 10, OperationType::CreateStake, target.clone())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    h.deposit(&owner, 5, OperationType::PayCommission, target.clone())
        .await
        .unwrap();
    h.ledger.set_active(pool.id, true).await.unwrap();

    // 50 fits under 0.1 × 1000, another 60 would not
    let stake = match h
        .deposit(&staker, 50, OperationType::CreateStake, target.clone())
        .await
        .unwrap()
    {
        CommandOutcome::StakeCreated(stake) => stake,
        other => panic!("unexpected outcome: {other:?}"),
    };
    let err = h
        .deposit(&staker, 60, OperationType::CreateStake, target.clone())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CapacityExceeded);

    // Two days of accrual, then maturity
    h.scheduler.tick(stake.start_date).await.unwrap();
    h.scheduler.tick(stake.start_date).await.unwrap();
    assert_eq!(
        h.ledger.stake(stake.id).await.unwrap().balance,
        Decimal::from(52)
    );

    let report = h
        .scheduler
        .tick(stake.end_date + ChronoDuration::minutes(1))
        .await
        .unwrap();
    assert_eq!(report.closed, 1);
    match h.notifications.recv().await.unwrap() {
        Notification::StakeClosed(n) => assert_eq!(n.stake.id, stake.id),
        other => panic!("unexpected notification: {other:?}"),
    }

    // Pool reserve cannot be withdrawn while open
    assert!(h.settlement.withdraw_reserve(pool.id, pool.owner_id).await.is_err());

    // Reward paid once
    let payout = h.settlement.claim_reward(stake.id).await.unwrap();
    assert_eq!(payout.amount, Decimal::from(52));
    assert_eq!(payout.recipient, staker.to_string());
    assert_eq!(
        h.settlement.claim_reward(stake.id).await.unwrap_err().kind(),
        ErrorKind::AlreadySettled
    );

    // Owner closes the pool, withdraws and deletes it
    h.ledger.set_active(pool.id, false).await.unwrap();
    let withdrawal = h
        .settlement
        .withdraw_reserve(pool.id, pool.owner_id)
        .await
        .unwrap();
    assert_eq!(withdrawal.amount, Decimal::from(998));
    assert_eq!(withdrawal.recipient, owner.to_string());
    h.ledger.delete_pool(pool.id).await.unwrap();

    let sent = h.executor.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|t| t.token_master == "0:master" && t.decimals == 9));

    assert_eq!(h.store.load_cursor().await.unwrap(), Some(h.next_lt));

    let staker_ops = h
        .ledger
        .operations(stake.user_id, Page::all())
        .await
        .unwrap();
    let kinds: Vec<_> = staker_ops.iter().map(|op| op.kind).collect();
    assert_eq!(
        kinds,
        vec![
            OperationKind::StakeCreated,
            OperationKind::StakeClosed,
            OperationKind::RewardClaimed
        ]
    );
}

#[tokio::test]
async fn test_insured_stake_end_to_end() {
    let mut h = Harness::new();
    let owner = MsgAddress::new(0, [0x0a; 32]);
    let staker = MsgAddress::new(-1, [0x0b; 32]);

    let pool = match h
        .deposit(
            &owner,
            1000,
            OperationType::CreatePool,
            serde_json::json!({
                "token_master": "0:master",
                "reward_percent": "1",
                "period_days": 1,
                "insurance_coating_percent": "10"
            }),
        )
        .await
        .unwrap()
    {
        CommandOutcome::PoolCreated(pool) => pool,
        other => panic!("unexpected outcome: {other:?}"),
    };
    let target = serde_json::json!({ "pool_id": pool.id });
    h.deposit(&owner, 5, OperationType::PayCommission, target.clone())
        .await
        .unwrap();
    h.ledger.set_active(pool.id, true).await.unwrap();

    let stake = match h
        .deposit(&staker, 10, OperationType::CreateStake, target)
        .await
        .unwrap()
    {
        CommandOutcome::StakeCreated(stake) => stake,
        other => panic!("unexpected outcome: {other:?}"),
    };

    // Price dropped 15% by the time the stake closes
    let scheduler = AccrualScheduler::new(
        Arc::clone(&h.ledger),
        Arc::new(StaticOracle(Decimal::new(85, 2))),
        Notifier::disabled(),
        Duration::from_secs(5),
    );
    scheduler
        .tick(stake.end_date + ChronoDuration::seconds(1))
        .await
        .unwrap();

    let summary = h.ledger.pool_summary(pool.id).await.unwrap();
    assert_eq!(summary.outstanding_liability, Decimal::from(90));

    assert_eq!(
        h.settlement.claim_reward(stake.id).await.unwrap_err().kind(),
        ErrorKind::Validation
    );
    let payout = h.settlement.claim_insurance(stake.id).await.unwrap();
    assert_eq!(payout.amount, Decimal::from(100));

    let stake = h.ledger.stake(stake.id).await.unwrap();
    assert!(stake.is_insurance_paid && !stake.is_reward_paid);
    assert_eq!(h.ledger.pool(pool.id).await.unwrap().reserve, Decimal::from(910));
}
