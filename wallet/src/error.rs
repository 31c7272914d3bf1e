use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Wallet service rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, TransferError>;
