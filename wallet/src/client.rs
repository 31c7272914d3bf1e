//! HTTP client for the treasury's transfer service
//!
//! The service holds the treasury keys' signing session; this client only
//! asks it to transfer, resolve jetton wallets and describe tokens. The
//! signing secret authorizes transfers and is wiped from memory on drop.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info};
use zeroize::Zeroizing;

use crate::error::{Result, TransferError};
use crate::executor::{TokenMetadata, TransferExecutor, TransferRequest};
use crate::units::to_base_units;

#[derive(Debug, Clone)]
pub struct WalletServiceConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct WalletServiceClient {
    endpoint: String,
    client: Client,
    api_key: Option<Zeroizing<String>>,
    signing_secret: Zeroizing<String>,
}

impl std::fmt::Debug for WalletServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletServiceClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct TransferResponse {
    tx_hash: String,
}

#[derive(Deserialize)]
struct WalletResponse {
    address: String,
}

impl WalletServiceClient {
    pub fn new(config: WalletServiceConfig, signing_secret: Zeroizing<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        info!(endpoint = %config.endpoint, "📡 Wallet service client initialized");
        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            client,
            api_key: config.api_key.map(Zeroizing::new),
            signing_secret,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("X-API-Key", key.as_str()),
            None => request,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(TransferError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl TransferExecutor for WalletServiceClient {
    async fn send(&self, request: &TransferRequest) -> Result<String> {
        let units = to_base_units(request.amount, request.decimals)?;
        if units == 0 {
            return Err(TransferError::InvalidAmount(format!(
                "{} is below one base unit",
                request.amount
            )));
        }

        let url = format!("{}/jetton/transfer", self.endpoint);
        debug!(url = %url, destination = %request.destination, "→ POST");

        let body = serde_json::json!({
            "token_master": request.token_master,
            "destination": request.destination,
            "amount": units.to_string(),
            "comment": request.comment,
        });

        let response = self
            .authorize(self.client.post(&url))
            .bearer_auth(self.signing_secret.as_str())
            .json(&body)
            .send()
            .await?;
        let response = match Self::check(response).await {
            Ok(r) => r,
            Err(e) => {
                error!(destination = %request.destination, error = %e, "❌ Transfer failed");
                return Err(e);
            }
        };

        let result: TransferResponse = response
            .json()
            .await
            .map_err(|e| TransferError::InvalidResponse(e.to_string()))?;
        info!(
            tx = %result.tx_hash,
            destination = %request.destination,
            amount = %request.amount,
            "✅ Transfer sent"
        );
        Ok(result.tx_hash)
    }

    async fn resolve_token_wallet(&self, token_master: &str, owner: &str) -> Result<String> {
        let url = format!("{}/jetton/wallet", self.endpoint);
        debug!(url = %url, "→ GET");

        let response = self
            .authorize(self.client.get(&url))
            .query(&[("master", token_master), ("owner", owner)])
            .send()
            .await?;
        let wallet: WalletResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| TransferError::InvalidResponse(e.to_string()))?;
        Ok(wallet.address)
    }

    async fn token_metadata(&self, token_master: &str) -> Result<TokenMetadata> {
        let url = format!("{}/jetton/metadata", self.endpoint);
        debug!(url = %url, "→ GET");

        let response = self
            .authorize(self.client.get(&url))
            .query(&[("master", token_master)])
            .send()
            .await?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| TransferError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn client() -> WalletServiceClient {
        WalletServiceClient::new(
            WalletServiceConfig {
                endpoint: "http://127.0.0.1:9/".to_string(),
                api_key: Some("key".to_string()),
                timeout: Duration::from_millis(200),
            },
            Zeroizing::new("secret".to_string()),
        )
        .unwrap()
    }

    #[test]
    fn test_debug_hides_secrets() {
        let printed = format!("{:?}", client());
        assert!(printed.contains("127.0.0.1:9"));
        assert!(!printed.contains("secret"));
        assert!(!printed.contains("key"));
    }

    #[tokio::test]
    async fn test_dust_transfer_rejected_before_request() {
        let request = TransferRequest {
            token_master: "0:master".to_string(),
            destination: "0:dest".to_string(),
            amount: Decimal::new(1, 12),
            decimals: 9,
            comment: String::new(),
        };
        assert!(matches!(
            client().send(&request).await,
            Err(TransferError::InvalidAmount(_))
        ));
    }
}
