//! Single-consumer ingestion: feed → decoder → dispatcher
//!
//! Transactions are handled strictly in feed order by one task. Transactions
//! without a request release the cursor at once; dispatched ones stay held
//! until the consumer has applied their request.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cursor::IngestionCursor;
use crate::decoder::MessageDecoder;
use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;
use crate::protocol::LedgerTransaction;

/// Outcome of handling one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Dispatched,
    Skipped,
    Dropped,
}

pub struct IngestionPipeline {
    decoder: MessageDecoder,
    dispatcher: Dispatcher,
    cursor: Arc<IngestionCursor>,
}

impl IngestionPipeline {
    pub fn new(dispatcher: Dispatcher, cursor: Arc<IngestionCursor>) -> Self {
        Self {
            decoder: MessageDecoder::new(),
            dispatcher,
            cursor,
        }
    }

    /// Consume until the feed closes or the dispatcher's consumer goes away
    pub async fn run(&self, mut feed: mpsc::UnboundedReceiver<LedgerTransaction>) {
        while let Some(tx) = feed.recv().await {
            if let Err(DispatchError::ChannelClosed) = self.process(&tx).await {
                warn!("Command channel closed, stopping ingestion");
                return;
            }
        }
        info!("Ledger feed closed, ingestion stopped");
    }

    pub async fn process(&self, tx: &LedgerTransaction) -> Result<Handled, DispatchError> {
        let request = match self.decoder.decode(tx) {
            Ok(Some(request)) => request,
            Ok(None) => {
                self.cursor.release(tx.lt).await;
                return Ok(Handled::Skipped);
            }
            Err(e) => {
                warn!(lt = tx.lt, hash = %tx.hash, error = %e, "⚠️  Dropping undecodable transaction");
                self.cursor.release(tx.lt).await;
                return Ok(Handled::Dropped);
            }
        };

        // Hold before sending; the consumer releases it once applied
        self.cursor.hold(tx.lt).await;
        if self.dispatcher.dispatch(request)? {
            Ok(Handled::Dispatched)
        } else {
            self.cursor.release(tx.lt).await;
            Ok(Handled::Skipped)
        }
    }
}
