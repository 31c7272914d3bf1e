//! Wiring of store, collaborators and the treasury services

use anyhow::Context;
use pool_core::{LedgerDB, LedgerStore};
use pool_economics::{DexPairsSource, FallbackOracle, PriceOracle, RatesApiSource};
use pool_network::{
    Dispatcher, FeedConfig, HttpLedgerFeed, IngestionCursor, IngestionPipeline, LedgerFeed,
};
use pool_treasury::{
    AccrualScheduler, CommandProcessor, CommandSettings, Ledger, Notification, Notifier,
    Settlement,
};
use pool_wallet::{TransferExecutor, WalletServiceClient, WalletServiceConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// How long queued requests may take to finish on shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

use crate::config::NodeConfig;

pub struct Node {
    config: NodeConfig,
    store: Arc<dyn LedgerStore>,
    ledger: Arc<Ledger>,
    settlement: Settlement,
    oracle: Arc<dyn PriceOracle>,
    executor: Arc<dyn TransferExecutor>,
    notifier: Notifier,
    notifications: mpsc::UnboundedReceiver<Notification>,
}

impl Node {
    pub fn build(config: NodeConfig) -> anyhow::Result<Self> {
        let path = config.storage_path();
        let store: Arc<dyn LedgerStore> = Arc::new(
            LedgerDB::open(&path)
                .with_context(|| format!("opening ledger database at {}", path.display()))?,
        );
        let call_timeout = config.call_timeout();
        let ledger = Arc::new(Ledger::with_timeout(Arc::clone(&store), call_timeout));

        let oracle_timeout = Duration::from_secs(config.oracle.timeout_secs);
        let mut oracle = FallbackOracle::new(oracle_timeout).with_source(Box::new(
            RatesApiSource::new(
                &config.oracle.primary_endpoint,
                config.oracle.primary_api_key.clone(),
                oracle_timeout,
            )
            .context("building primary price source")?,
        ));
        if !config.oracle.fallback_endpoint.trim().is_empty() {
            oracle = oracle.with_source(Box::new(
                DexPairsSource::new(&config.oracle.fallback_endpoint, oracle_timeout)
                    .context("building fallback price source")?,
            ));
        }
        let oracle: Arc<dyn PriceOracle> = Arc::new(oracle);

        let executor: Arc<dyn TransferExecutor> = Arc::new(
            WalletServiceClient::new(
                WalletServiceConfig {
                    endpoint: config.wallet.endpoint.clone(),
                    api_key: config.wallet.api_key.clone(),
                    timeout: Duration::from_secs(config.wallet.timeout_secs),
                },
                config.treasury.signing_secret.clone(),
            )
            .context("building wallet service client")?,
        );

        let (notifier, notifications) = Notifier::channel();
        let settlement = Settlement::new(
            Arc::clone(&ledger),
            Arc::clone(&executor),
            notifier.clone(),
            config.treasury.token_decimals,
            call_timeout,
        );

        Ok(Self {
            config,
            store,
            ledger,
            settlement,
            oracle,
            executor,
            notifier,
            notifications,
        })
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn settlement(&self) -> &Settlement {
        &self.settlement
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Run ingestion, command processing and accrual until Ctrl-C
    pub async fn run(self) -> anyhow::Result<()> {
        let cursor = match self.store.load_cursor().await? {
            Some(lt) => lt,
            None => self.config.feed.start_lt,
        };

        let feed = HttpLedgerFeed::new(FeedConfig {
            endpoint: self.config.feed.endpoint.clone(),
            api_key: self.config.feed.api_key.clone(),
            poll_interval: Duration::from_secs(self.config.feed.poll_interval_secs),
            page_size: self.config.feed.page_size,
            request_timeout: Duration::from_secs(self.config.feed.request_timeout_secs),
        })?;
        let transactions = feed.subscribe(&self.config.treasury.address, cursor).await?;
        info!(
            account = %self.config.treasury.address,
            from_lt = cursor,
            "📡 Subscribed to treasury transactions"
        );

        let (dispatcher, commands) = Dispatcher::channel();
        let ingestion_cursor = IngestionCursor::new(Arc::clone(&self.store));
        let pipeline = IngestionPipeline::new(dispatcher, Arc::clone(&ingestion_cursor));
        let processor = CommandProcessor::new(
            Arc::clone(&self.ledger),
            Arc::clone(&self.oracle),
            Arc::clone(&self.executor),
            CommandSettings {
                token_decimals: self.config.treasury.token_decimals,
                commission_amount: self.config.treasury.commission_amount,
                treasury_address: self.config.treasury.address.clone(),
            },
            self.config.call_timeout(),
        )
        .with_cursor(Arc::clone(&ingestion_cursor));
        let scheduler = AccrualScheduler::new(
            Arc::clone(&self.ledger),
            Arc::clone(&self.oracle),
            self.notifier.clone(),
            self.config.call_timeout(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tick_interval = self.config.tick_interval();

        let ingestion = tokio::spawn(async move { pipeline.run(transactions).await });
        let processing = tokio::spawn(async move { processor.run(commands).await });
        let accrual = tokio::spawn(async move { scheduler.run(tick_interval, shutdown_rx).await });
        let delivery = tokio::spawn(deliver(self.notifications));

        info!(
            token = %self.config.treasury.token_name,
            tick_secs = tick_interval.as_secs(),
            "🚀 Pool treasury node running"
        );

        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        info!("🛑 Shutdown requested");

        if shutdown_tx.send(true).is_err() {
            error!("Accrual scheduler already stopped");
        }
        if let Err(e) = accrual.await {
            error!(error = %e, "Accrual task ended abnormally");
        }

        // Stopping ingestion drops the dispatcher; the processor then drains
        // what is queued and exits
        ingestion.abort();
        let _ = ingestion.await;
        match tokio::time::timeout(DRAIN_TIMEOUT, processing).await {
            Ok(Err(e)) => error!(error = %e, "Command processor ended abnormally"),
            Ok(Ok(())) => {}
            Err(_) => {
                let pending = ingestion_cursor.pending().await;
                warn!(pending, "Queued requests not finished, they will be replayed on restart");
            }
        }
        delivery.abort();

        info!("👋 Node stopped");
        Ok(())
    }
}

/// Chat and e-mail delivery live outside the node; notices are logged here
async fn deliver(mut notifications: mpsc::UnboundedReceiver<Notification>) {
    while let Some(notification) = notifications.recv().await {
        info!(
            user = notification.recipient(),
            "📣 {}",
            notification.message()
        );
    }
}
