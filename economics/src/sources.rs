//! HTTP price sources
//!
//! Both sources expose a pure `parse_*` function so the response handling
//! can be tested without a network.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{OracleError, Result};
use crate::oracle::PriceSource;

fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Accepts `1.5`, `"1.5"` and scientific notation such as `1.2e-5`
fn decimal_from_json(value: &serde_json::Value) -> Option<Decimal> {
    let text = match value {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.clone(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

fn usable(price: Option<Decimal>) -> Option<Decimal> {
    price.filter(|p| *p > Decimal::ZERO)
}

/// Token rates endpoint (`GET /v2/rates?tokens=..&currencies=usd`)
pub struct RatesApiSource {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct RatesResponse {
    #[serde(default)]
    rates: HashMap<String, TokenRates>,
}

#[derive(Deserialize)]
struct TokenRates {
    #[serde(default)]
    prices: HashMap<String, serde_json::Value>,
}

impl RatesApiSource {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

/// Price for `token_master` in a rates response
///
/// The service may echo the token in another address form, so a response
/// with a single entry is accepted regardless of its key.
pub fn parse_rates(body: &str, token_master: &str) -> Result<Decimal> {
    let response: RatesResponse = serde_json::from_str(body)
        .map_err(|e| OracleError::InvalidResponse(format!("rates: {}", e)))?;

    let rates = match response.rates.get(token_master) {
        Some(rates) => Some(rates),
        None if response.rates.len() == 1 => response.rates.values().next(),
        None => None,
    };

    let price = rates.and_then(|r| {
        r.prices
            .get("USD")
            .or_else(|| r.prices.get("usd"))
            .and_then(decimal_from_json)
    });
    usable(price).ok_or_else(|| OracleError::NoPrice(token_master.to_string()))
}

#[async_trait]
impl PriceSource for RatesApiSource {
    fn name(&self) -> &str {
        "rates-api"
    }

    async fn usd_price(&self, token_master: &str) -> Result<Decimal> {
        let url = format!("{}/rates", self.endpoint);
        let mut request = self
            .client
            .get(&url)
            .query(&[("tokens", token_master), ("currencies", "usd")]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(OracleError::Status {
                source_name: self.name().to_string(),
                status: response.status().as_u16(),
            });
        }
        parse_rates(&response.text().await?, token_master)
    }
}

/// DEX aggregator pairs endpoint (`GET /latest/dex/tokens/{address}`)
pub struct DexPairsSource {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct PairsResponse {
    #[serde(default)]
    pairs: Option<Vec<Pair>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pair {
    price_usd: Option<serde_json::Value>,
    #[serde(default)]
    liquidity: Option<Liquidity>,
}

#[derive(Deserialize)]
struct Liquidity {
    usd: Option<f64>,
}

impl DexPairsSource {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

/// USD price of the most liquid pair that reports one
pub fn parse_pairs(body: &str, token_master: &str) -> Result<Decimal> {
    let response: PairsResponse = serde_json::from_str(body)
        .map_err(|e| OracleError::InvalidResponse(format!("pairs: {}", e)))?;

    let mut pairs: Vec<(f64, Decimal)> = response
        .pairs
        .unwrap_or_default()
        .into_iter()
        .filter_map(|pair| {
            let price = usable(pair.price_usd.as_ref().and_then(decimal_from_json))?;
            let liquidity = pair.liquidity.and_then(|l| l.usd).unwrap_or(0.0);
            Some((liquidity, price))
        })
        .collect();

    pairs.sort_by(|a, b| b.0.total_cmp(&a.0));
    pairs
        .first()
        .map(|(_, price)| *price)
        .ok_or_else(|| OracleError::NoPrice(token_master.to_string()))
}

#[async_trait]
impl PriceSource for DexPairsSource {
    fn name(&self) -> &str {
        "dex-pairs"
    }

    async fn usd_price(&self, token_master: &str) -> Result<Decimal> {
        let url = format!("{}/latest/dex/tokens/{}", self.endpoint, token_master);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(OracleError::Status {
                source_name: self.name().to_string(),
                status: response.status().as_u16(),
            });
        }
        parse_pairs(&response.text().await?, token_master)
    }
}
