//! Pool Treasury Network Module
//!
//! Everything between the ledger and the application layer: the cell codec,
//! the transaction feed, message decoding and request dispatch.
pub mod cell;
pub mod cursor;
pub mod decoder;
pub mod dispatcher;
pub mod error;
pub mod feed;
pub mod pipeline;
pub mod protocol;

pub use cell::{Cell, CellBuilder, CellSlice, MsgAddress};
pub use cursor::IngestionCursor;
pub use decoder::MessageDecoder;
pub use dispatcher::Dispatcher;
pub use error::{CellError, DecodeError, DispatchError, FeedError};
pub use feed::{FeedConfig, HttpLedgerFeed, LedgerFeed};
pub use pipeline::{Handled, IngestionPipeline};
pub use protocol::{
    InboundMessage, InboundRequest, LedgerTransaction, OperationType, SubmitTransaction,
};
