use async_trait::async_trait;
use base64::Engine;
use chrono::{TimeZone, Utc};
use eyre::{Result, WrapErr};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::info;

use crate::config::RelayConfig;
use crate::engine::swap_guard::ContractState;

type HmacSha256 = Hmac<Sha256>;

/// Fixed-point prices for the on-chain price update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdate {
    pub usdc_price: u64,
    pub usdt_price: u64,
    pub apm_price: u64,
}

impl PriceUpdate {
    /// Scale to `10^decimals`. Missing or non-positive stablecoin prices are
    /// published at par.
    pub fn new(apm: f64, usdc: Option<f64>, usdt: Option<f64>, decimals: u32) -> Self {
        let par = |p: Option<f64>| p.filter(|p| p.is_finite() && *p > 0.0).unwrap_or(1.0);
        Self {
            usdc_price: to_fixed(par(usdc), decimals),
            usdt_price: to_fixed(par(usdt), decimals),
            apm_price: to_fixed(apm, decimals),
        }
    }
}

pub fn to_fixed(value: f64, decimals: u32) -> u64 {
    (value.max(0.0) * 10f64.powi(decimals as i32)).round() as u64
}

pub fn from_fixed(value: u64, decimals: u32) -> f64 {
    value as f64 / 10f64.powi(decimals as i32)
}

/// The external swap program, reached through some transaction relay.
#[async_trait]
pub trait SwapContract: Send + Sync {
    async fn fetch_state(&self) -> Result<ContractState>;

    /// Ask the contract to extend price validity. Returns a transaction reference.
    async fn extend_price_validity(&self) -> Result<String>;

    async fn publish_prices(&self, update: &PriceUpdate) -> Result<String>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateResponse {
    apm_price: u64,
    usdc_price: u64,
    usdt_price: u64,
    active: bool,
    price_valid_until: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    success: bool,
    signature: Option<String>,
    error: Option<String>,
}

impl TxResponse {
    fn into_signature(self, action: &str) -> Result<String> {
        if !self.success {
            eyre::bail!(
                "{} rejected: {}",
                action,
                self.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }
        Ok(self.signature.unwrap_or_default())
    }
}

/// HTTP client for the signing relay in front of the swap program.
#[derive(Clone)]
pub struct RelayClient {
    client: Client,
    config: RelayConfig,
}

impl RelayClient {
    pub fn new(config: RelayConfig, timeout: std::time::Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(5)
            .timeout(timeout)
            .build()
            .wrap_err("Failed to build HTTP client")?;

        Ok(Self { client, config })
    }

    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String> {
        sign_request(&self.config.secret, timestamp, method, path, body)
    }

    fn auth_headers(&self, method: &str, path: &str, body: &str) -> Result<Vec<(String, String)>> {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = self.sign(&timestamp, method, path, body)?;

        Ok(vec![
            ("RELAY-API-KEY".into(), self.config.api_key.clone()),
            ("RELAY-SIGNATURE".into(), signature),
            ("RELAY-TIMESTAMP".into(), timestamp),
        ])
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    async fn post_signed(&self, path: &str, body: String, action: &str) -> Result<String> {
        let headers = self.auth_headers("POST", path, &body)?;
        let mut builder = self
            .client
            .post(self.url(path))
            .body(body)
            .header("Content-Type", "application/json");
        for (k, v) in headers {
            builder = builder.header(&k, &v);
        }

        let resp: TxResponse = builder
            .send()
            .await
            .wrap_err_with(|| format!("{} request failed", action))?
            .json()
            .await
            .wrap_err_with(|| format!("{} parse failed", action))?;

        resp.into_signature(action)
    }
}

/// Base64 HMAC-SHA256 over `timestamp + method + path + body`, keyed by the
/// base64-decoded secret.
pub fn sign_request(secret: &str, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String> {
    let message = format!("{}{}{}{}", timestamp, method, path, body);
    let secret_bytes = base64::engine::general_purpose::STANDARD
        .decode(secret)
        .wrap_err("Failed to decode relay secret")?;
    let mut mac = HmacSha256::new_from_slice(&secret_bytes).wrap_err("Invalid HMAC key")?;
    mac.update(message.as_bytes());
    let result = mac.finalize();
    Ok(base64::engine::general_purpose::STANDARD.encode(result.into_bytes()))
}

#[async_trait]
impl SwapContract for RelayClient {
    async fn fetch_state(&self) -> Result<ContractState> {
        let path = "/swap/state";
        let headers = self.auth_headers("GET", path, "")?;

        let mut builder = self.client.get(self.url(path));
        for (k, v) in headers {
            builder = builder.header(&k, &v);
        }

        let state: StateResponse = builder
            .send()
            .await
            .wrap_err("fetch_state request failed")?
            .error_for_status()
            .wrap_err("fetch_state returned error status")?
            .json()
            .await
            .wrap_err("fetch_state parse failed")?;

        let decimals = self.config.price_decimals;
        Ok(ContractState {
            apm_price: from_fixed(state.apm_price, decimals),
            usdc_price: from_fixed(state.usdc_price, decimals),
            usdt_price: from_fixed(state.usdt_price, decimals),
            active: state.active,
            price_valid_until: state
                .price_valid_until
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        })
    }

    async fn extend_price_validity(&self) -> Result<String> {
        let signature = self
            .post_signed("/swap/price-expiration", "{}".to_string(), "extend_price_validity")
            .await?;
        info!("📋 Price validity extended, tx {}", signature);
        Ok(signature)
    }

    async fn publish_prices(&self, update: &PriceUpdate) -> Result<String> {
        let body = serde_json::to_string(update)?;
        self.post_signed("/swap/prices", body, "publish_prices").await
    }
}
