//! Ledger feed: an ordered stream of confirmed treasury transactions

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::FeedError;
use crate::protocol::{InboundMessage, LedgerTransaction};

#[async_trait]
pub trait LedgerFeed: Send + Sync {
    /// Stream transactions of `account` with logical time greater than `from_lt`, in order
    async fn subscribe(
        &self,
        account: &str,
        from_lt: u64,
    ) -> Result<mpsc::UnboundedReceiver<LedgerTransaction>, FeedError>;
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Indexer base URL, e.g. `https://toncenter.com/api/v3`
    pub endpoint: String,
    pub api_key: Option<String>,
    pub poll_interval: Duration,
    pub page_size: usize,
    pub request_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://toncenter.com/api/v3".to_string(),
            api_key: None,
            poll_interval: Duration::from_secs(5),
            page_size: 50,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Polling feed over an indexer's `/transactions` endpoint
#[derive(Debug, Clone)]
pub struct HttpLedgerFeed {
    client: reqwest::Client,
    config: FeedConfig,
}

impl HttpLedgerFeed {
    pub fn new(config: FeedConfig) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    /// One page of transactions after `after_lt`, ascending
    pub async fn fetch_page(
        &self,
        account: &str,
        after_lt: u64,
    ) -> Result<Vec<LedgerTransaction>, FeedError> {
        let url = format!("{}/transactions", self.config.endpoint.trim_end_matches('/'));
        let start_lt = after_lt.saturating_add(1).to_string();
        let limit = self.config.page_size.to_string();

        let mut request = self.client.get(&url).query(&[
            ("account", account),
            ("start_lt", start_lt.as_str()),
            ("sort", "asc"),
            ("limit", limit.as_str()),
        ]);
        if let Some(key) = &self.config.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(FeedError::Status(response.status().as_u16()));
        }

        let body = response.text().await?;
        let mut transactions = parse_transactions(&body)?;
        transactions.retain(|tx| tx.lt > after_lt);
        transactions.sort_by_key(|tx| tx.lt);
        Ok(transactions)
    }

    async fn poll_loop(
        self,
        account: String,
        mut cursor: u64,
        tx: mpsc::UnboundedSender<LedgerTransaction>,
    ) {
        info!(account = %account, from_lt = cursor, "📡 Subscribed to ledger feed");

        while !tx.is_closed() {
            match self.fetch_page(&account, cursor).await {
                Ok(page) => {
                    let full = page.len() >= self.config.page_size;
                    for transaction in page {
                        cursor = transaction.lt;
                        if tx.send(transaction).is_err() {
                            debug!("Feed consumer gone, stopping");
                            return;
                        }
                    }
                    if full {
                        continue;
                    }
                }
                Err(e) => {
                    warn!(error = %e, lt = cursor, "⚠️  Ledger feed request failed, retrying");
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

#[async_trait]
impl LedgerFeed for HttpLedgerFeed {
    async fn subscribe(
        &self,
        account: &str,
        from_lt: u64,
    ) -> Result<mpsc::UnboundedReceiver<LedgerTransaction>, FeedError> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().poll_loop(account.to_string(), from_lt, tx));
        Ok(rx)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Numeric {
    Number(u64),
    Text(String),
}

impl Numeric {
    fn to_u128(&self) -> Result<u128, FeedError> {
        match self {
            Numeric::Number(n) => Ok(*n as u128),
            Numeric::Text(s) => s
                .parse()
                .map_err(|_| FeedError::InvalidResponse(format!("not a number: {}", s))),
        }
    }

    fn to_u64(&self) -> Result<u64, FeedError> {
        u64::try_from(self.to_u128()?)
            .map_err(|_| FeedError::InvalidResponse("number out of range".to_string()))
    }
}

#[derive(Deserialize)]
struct TransactionsResponse {
    #[serde(default)]
    transactions: Vec<TransactionDto>,
}

#[derive(Deserialize)]
struct TransactionDto {
    hash: String,
    lt: Numeric,
    #[serde(default)]
    now: i64,
    in_msg: Option<MessageDto>,
}

#[derive(Deserialize)]
struct MessageDto {
    source: Option<String>,
    value: Option<Numeric>,
    #[serde(default)]
    bounced: Option<bool>,
    #[serde(default)]
    value_extra_currencies: Option<BTreeMap<String, serde_json::Value>>,
    message_content: Option<MessageContentDto>,
}

#[derive(Deserialize)]
struct MessageContentDto {
    body: Option<String>,
}

impl TransactionDto {
    fn into_transaction(self) -> Result<LedgerTransaction, FeedError> {
        let lt = self.lt.to_u64()?;
        let in_msg = match self.in_msg {
            Some(msg) => Some(msg.into_message(&self.hash)?),
            None => None,
        };
        Ok(LedgerTransaction {
            hash: self.hash,
            lt,
            utime: self.now,
            in_msg,
        })
    }
}

impl MessageDto {
    fn into_message(self, tx_hash: &str) -> Result<InboundMessage, FeedError> {
        let value = match &self.value {
            Some(v) => v.to_u128()?,
            None => 0,
        };

        let body = match self.message_content.and_then(|c| c.body) {
            Some(encoded) => STANDARD.decode(encoded.trim()).unwrap_or_else(|e| {
                warn!(hash = %tx_hash, error = %e, "⚠️  Message body is not base64, ignoring body");
                Vec::new()
            }),
            None => Vec::new(),
        };

        let extra_currencies = self
            .value_extra_currencies
            .unwrap_or_default()
            .into_iter()
            .map(|(id, amount)| {
                let amount = match amount {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (id, amount)
            })
            .collect();

        Ok(InboundMessage {
            source: self.source,
            value,
            body,
            bounced: self.bounced.unwrap_or(false),
            extra_currencies,
        })
    }
}

/// Parse an indexer `/transactions` response body
pub fn parse_transactions(body: &str) -> Result<Vec<LedgerTransaction>, FeedError> {
    let response: TransactionsResponse = serde_json::from_str(body)
        .map_err(|e| FeedError::InvalidResponse(format!("Failed to parse response: {}", e)))?;
    response
        .transactions
        .into_iter()
        .map(TransactionDto::into_transaction)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "transactions": [
            {
                "hash": "tx2",
                "lt": "48000000000002",
                "now": 1700000100,
                "in_msg": {
                    "source": "0:ABCD",
                    "value": "50000000",
                    "bounced": false,
                    "value_extra_currencies": {"100": "7"},
                    "message_content": {"body": "te6cckEBAQEAAgAAAEysuc0="}
                }
            },
            {
                "hash": "tx1",
                "lt": 48000000000001,
                "now": 1700000000,
                "in_msg": null
            }
        ],
        "address_book": {}
    }"#;

    #[test]
    fn test_parse_transactions() {
        let txs = parse_transactions(SAMPLE).unwrap();
        assert_eq!(txs.len(), 2);

        let first = &txs[0];
        assert_eq!(first.lt, 48_000_000_000_002);
        assert_eq!(first.utime, 1_700_000_100);
        let msg = first.in_msg.as_ref().unwrap();
        assert_eq!(msg.source.as_deref(), Some("0:ABCD"));
        assert_eq!(msg.value, 50_000_000);
        assert!(!msg.bounced);
        assert_eq!(msg.extra_currencies.get("100").map(String::as_str), Some("7"));
        assert_eq!(&msg.body[..4], &[0xb5, 0xee, 0x9c, 0x72]);

        assert!(txs[1].in_msg.is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_transactions("not json"),
            Err(FeedError::InvalidResponse(_))
        ));
        assert!(parse_transactions(r#"{"transactions":[{"hash":"x","lt":"abc"}]}"#).is_err());
    }

    #[test]
    fn test_invalid_body_is_dropped_not_fatal() {
        let body = r#"{"transactions":[{"hash":"x","lt":"5","in_msg":{"message_content":{"body":"%%%"}}}]}"#;
        let txs = parse_transactions(body).unwrap();
        assert!(txs[0].in_msg.as_ref().unwrap().body.is_empty());
    }
}
