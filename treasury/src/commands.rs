//! Applies dispatched requests to the ledger
//!
//! Every request carries a token deposit. Failures of external services or
//! storage are retried a few times; when a request is finally rejected the
//! deposit stays in the treasury and the warning carries sender, amount and
//! transaction hash so it can be refunded by hand.

use pool_core::{NewPool, Pool, PoolId, Stake, User};
use pool_economics::PriceOracle;
use pool_network::{IngestionCursor, MsgAddress, OperationType, SubmitTransaction};
use pool_wallet::{from_base_units, TransferExecutor};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{bounded, LedgerError, Result};
use crate::ledger::Ledger;

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Create-pool request body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatePoolPayload {
    pub token_master: String,
    pub reward_percent: Decimal,
    pub period_days: u32,
    pub insurance_coating_percent: Decimal,
}

/// Body of requests that target an existing pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolPayload {
    pub pool_id: PoolId,
}

#[derive(Debug, Clone)]
pub struct CommandSettings {
    /// Decimals of the pool tokens, used to read deposit amounts
    pub token_decimals: u8,
    /// Commission owed before a pool may open
    pub commission_amount: Decimal,
    /// Treasury account; deposit wallets are resolved against it
    pub treasury_address: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    PoolCreated(Pool),
    ReserveAdded { pool_id: PoolId, reserve: Decimal },
    StakeCreated(Stake),
    CommissionPaid(Pool),
}

pub struct CommandProcessor {
    ledger: Arc<Ledger>,
    oracle: Arc<dyn PriceOracle>,
    executor: Arc<dyn TransferExecutor>,
    settings: CommandSettings,
    call_timeout: Duration,
    retry_attempts: u32,
    retry_backoff: Duration,
    cursor: Option<Arc<IngestionCursor>>,
}

impl CommandProcessor {
    pub fn new(
        ledger: Arc<Ledger>,
        oracle: Arc<dyn PriceOracle>,
        executor: Arc<dyn TransferExecutor>,
        settings: CommandSettings,
        call_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            oracle,
            executor,
            settings,
            call_timeout,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            cursor: None,
        }
    }

    /// Release each request's transaction on this cursor once it is finished
    pub fn with_cursor(mut self, cursor: Arc<IngestionCursor>) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// Attempts per request for retriable failures; the backoff grows linearly
    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_backoff = backoff;
        self
    }

    /// Handle requests in arrival order until the dispatcher goes away
    pub async fn run(&self, mut rx: mpsc::UnboundedReceiver<SubmitTransaction>) {
        while let Some(request) = rx.recv().await {
            // Outcome is logged by `handle`
            let _ = self.handle(request).await;
        }
        info!("Command channel closed, processor stopped");
    }

    pub async fn handle(&self, request: SubmitTransaction) -> Result<CommandOutcome> {
        let result = self.apply_with_retry(&request).await;
        match &result {
            Ok(outcome) => info!(
                operation = %request.operation_type,
                sender = %request.sender_addr,
                tx = %request.tx_hash,
                "✅ {}", describe(outcome)
            ),
            Err(e) => warn!(
                operation = %request.operation_type,
                sender = %request.sender_addr,
                amount = request.amount,
                tx = %request.tx_hash,
                error = %e,
                "⚠️  Request rejected, manual refund required"
            ),
        }
        if let Some(cursor) = &self.cursor {
            cursor.release(request.lt).await;
        }
        result
    }

    async fn apply_with_retry(&self, request: &SubmitTransaction) -> Result<CommandOutcome> {
        let mut attempt = 1;
        loop {
            match self.apply(request).await {
                Err(e) if e.is_retriable() && attempt < self.retry_attempts => {
                    let delay = self.retry_backoff * attempt;
                    warn!(
                        operation = %request.operation_type,
                        tx = %request.tx_hash,
                        attempt,
                        error = %e,
                        "🔄 Request failed, retrying in {:?}", delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn apply(&self, request: &SubmitTransaction) -> Result<CommandOutcome> {
        let user = self.ledger.register_user(&request.sender_addr).await?;
        let amount = from_base_units(request.amount, self.settings.token_decimals)
            .map_err(|e| LedgerError::InvalidParameter(e.to_string()))?;

        match request.operation_type {
            OperationType::CreatePool => {
                let payload: CreatePoolPayload = parse_payload(&request.payload)?;
                self.create_pool(request, &user, amount, payload).await
            }
            OperationType::AddReserve => {
                let pool = self.owned_pool(request, &user).await?;
                let reserve = self.ledger.add_reserve(pool.id, amount).await?;
                Ok(CommandOutcome::ReserveAdded {
                    pool_id: pool.id,
                    reserve,
                })
            }
            OperationType::CreateStake => {
                let pool = self.target_pool(request).await?;
                let price = bounded(
                    self.call_timeout,
                    "price lookup",
                    self.oracle.get_usd_price(&pool.token_master),
                )
                .await?;
                let stake = self
                    .ledger
                    .create_stake(user.id, pool.id, amount, price)
                    .await?;
                Ok(CommandOutcome::StakeCreated(stake))
            }
            OperationType::PayCommission => {
                let pool = self.owned_pool(request, &user).await?;
                let pool = self
                    .ledger
                    .pay_commission(pool.id, amount, self.settings.commission_amount)
                    .await?;
                Ok(CommandOutcome::CommissionPaid(pool))
            }
        }
    }

    async fn create_pool(
        &self,
        request: &SubmitTransaction,
        owner: &User,
        reserve: Decimal,
        payload: CreatePoolPayload,
    ) -> Result<CommandOutcome> {
        let deposit_address = bounded(
            self.call_timeout,
            "token wallet lookup",
            self.executor
                .resolve_token_wallet(&payload.token_master, &self.settings.treasury_address),
        )
        .await?;
        if let Some(wallet) = &request.token_wallet {
            if !same_address(wallet, &deposit_address) {
                return Err(LedgerError::InvalidParameter(format!(
                    "deposit came from {} but {} is the treasury wallet for {}",
                    wallet, deposit_address, payload.token_master
                )));
            }
        }

        let pool = self
            .ledger
            .create_pool(NewPool {
                owner_id: owner.id,
                reserve_deposit: reserve,
                token_master: payload.token_master,
                deposit_address,
                reward_percent: payload.reward_percent,
                period_days: payload.period_days,
                insurance_coating_percent: payload.insurance_coating_percent,
            })
            .await?;
        Ok(CommandOutcome::PoolCreated(pool))
    }

    /// Pool named in the payload, checked against the wallet the deposit came through
    async fn target_pool(&self, request: &SubmitTransaction) -> Result<Pool> {
        let payload: PoolPayload = parse_payload(&request.payload)?;
        let pool = self.ledger.pool(payload.pool_id).await?;
        if let Some(wallet) = &request.token_wallet {
            if !same_address(wallet, &pool.deposit_address) {
                return Err(LedgerError::InvalidParameter(format!(
                    "deposit came from {}, pool #{} takes deposits at {}",
                    wallet, pool.id, pool.deposit_address
                )));
            }
        }
        Ok(pool)
    }

    async fn owned_pool(&self, request: &SubmitTransaction, user: &User) -> Result<Pool> {
        let pool = self.target_pool(request).await?;
        if pool.owner_id != user.id {
            return Err(LedgerError::NotOwner {
                pool_id: pool.id,
                user_id: user.id,
            });
        }
        Ok(pool)
    }
}

fn parse_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| LedgerError::InvalidParameter(format!("malformed payload: {}", e)))
}

/// Compare addresses across raw and user-friendly forms
fn same_address(a: &str, b: &str) -> bool {
    match (a.parse::<MsgAddress>(), b.parse::<MsgAddress>()) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}

fn describe(outcome: &CommandOutcome) -> String {
    match outcome {
        CommandOutcome::PoolCreated(pool) => format!("Pool #{} created", pool.id),
        CommandOutcome::ReserveAdded { pool_id, reserve } => {
            format!("Pool #{} reserve now {}", pool_id, reserve)
        }
        CommandOutcome::StakeCreated(stake) => {
            format!("Stake #{} opened in pool #{}", stake.id, stake.pool_id)
        }
        CommandOutcome::CommissionPaid(pool) => format!("Pool #{} commission paid", pool.id),
    }
}
