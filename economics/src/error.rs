use thiserror::Error;

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{source_name} returned status {status}")]
    Status { source_name: String, status: u16 },

    #[error("No usable price for {0}")]
    NoPrice(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0} timed out")]
    Timeout(String),

    #[error("All price sources failed for {0}")]
    AllSourcesFailed(String),
}

pub type Result<T> = std::result::Result<T, OracleError>;
