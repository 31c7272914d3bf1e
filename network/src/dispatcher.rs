//! Forwards decoded requests to the application layer

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::DispatchError;
use crate::protocol::{InboundRequest, OperationType, SubmitTransaction};

/// Translation boundary between ingestion and the command processor
///
/// The output channel is unbounded, so `dispatch` never waits on a slow
/// consumer.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<SubmitTransaction>,
}

impl Dispatcher {
    pub fn new(tx: mpsc::UnboundedSender<SubmitTransaction>) -> Self {
        Self { tx }
    }

    /// Dispatcher plus the receiving end for the application layer
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SubmitTransaction>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Returns `false` when the op code is unknown and nothing was forwarded
    pub fn dispatch(&self, request: InboundRequest) -> Result<bool, DispatchError> {
        let Some(operation_type) = OperationType::from_code(request.op_code) else {
            warn!(
                op_code = request.op_code,
                sender = %request.sender,
                lt = request.lt,
                "⚠️  Unknown operation code, request dropped"
            );
            return Ok(false);
        };

        debug!(
            operation = %operation_type,
            sender = %request.sender,
            amount = request.amount,
            "📨 Dispatching request"
        );

        self.tx
            .send(SubmitTransaction::from_request(operation_type, request))
            .map_err(|_| DispatchError::ChannelClosed)?;
        Ok(true)
    }
}
