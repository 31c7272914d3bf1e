//! Error types for the ingestion side

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CellError {
    #[error("Invalid BOC magic: {0}")]
    InvalidMagic(String),

    #[error("Unexpected end of data at offset {0}")]
    UnexpectedEof(usize),

    #[error("Cell data exhausted: wanted {wanted} bits, {left} left")]
    BitsExhausted { wanted: usize, left: usize },

    #[error("Cell has no reference at position {0}")]
    MissingRef(usize),

    #[error("Cell overflow: {0}")]
    Overflow(String),

    #[error("Unsupported cell: {0}")]
    Unsupported(String),

    #[error("Invalid reference {reference} from cell {cell}")]
    InvalidRef { cell: usize, reference: usize },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed message body: {0}")]
    Malformed(#[from] CellError),

    #[error("Forward payload truncated: declared {declared} bytes, found {found}")]
    TruncatedPayload { declared: usize, found: usize },

    #[error("Payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Indexer returned status {0}")]
    Status(u16),

    #[error("Invalid feed response: {0}")]
    InvalidResponse(String),
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Output channel closed")]
    ChannelClosed,
}

pub type CellResult<T> = std::result::Result<T, CellError>;
