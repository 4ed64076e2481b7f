use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::exchange::{ExchangeClient, OrderSide, OrderState, OrderStatus};
use crate::error::ExecutionError;
use crate::models::Candle;
use crate::persistence::timestamp_from_millis;

const DEFAULT_RATE_LIMIT_RPM: u32 = 120;
const REQUEST_TIMEOUT_SECS: u64 = 10;

type HmacSha256 = Hmac<Sha256>;

type ExchangeRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Serialize)]
struct PlaceOrderRequest<'a> {
    symbol: &'a str,
    side: &'a str,
    #[serde(rename = "type")]
    order_type: &'a str,
    quantity: Decimal,
    client_order_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct PlaceOrderResponse {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct OrderStatusResponse {
    order_id: String,
    status: String,
    quantity: Decimal,
    filled_quantity: Decimal,
    average_price: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    free: Decimal,
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    last: Decimal,
}

/// [timestamp_ms, open, high, low, close, volume]
type OhlcvRow = (i64, Decimal, Decimal, Decimal, Decimal, Decimal);

/// Signed REST adapter.
///
/// Every request is rate limited and signed with HMAC-SHA256 over
/// `timestamp + method + path + body`. Retrying is left to the gateway; this
/// adapter only classifies failures.
#[derive(Clone)]
pub struct HttpExchange {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    rate_limiter: Arc<ExchangeRateLimiter>,
}

impl HttpExchange {
    pub fn new(base_url: &str, api_key: &str, api_secret: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            rate_limiter: Arc::new(Self::limiter(DEFAULT_RATE_LIMIT_RPM)),
        })
    }

    pub fn with_rate_limit(mut self, requests_per_minute: u32) -> Self {
        self.rate_limiter = Arc::new(Self::limiter(requests_per_minute));
        self
    }

    fn limiter(requests_per_minute: u32) -> ExchangeRateLimiter {
        let rpm = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
        RateLimiter::direct(Quota::per_minute(rpm))
    }

    fn sign(&self, timestamp: i64, method: &Method, path: &str, body: &str) -> Result<String, ExecutionError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExecutionError::Rejected(format!("failed to init signer: {}", e)))?;
        mac.update(format!("{}{}{}{}", timestamp, method.as_str(), path, body).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Send a signed request and decode a successful JSON response.
    ///
    /// 429 and 5xx are transient, any other non-success status is a rejection.
    async fn request<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> Result<T, ExecutionError> {
        self.rate_limiter.until_ready().await;

        let body = body.unwrap_or_default();
        let timestamp = Utc::now().timestamp_millis();
        let signature = self.sign(timestamp, &method, path, &body)?;

        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header("X-API-KEY", &self.api_key)
            .header("X-TIMESTAMP", timestamp.to_string())
            .header("X-SIGNATURE", signature);
        if !body.is_empty() {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(classify(status, &text));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ExecutionError::Transient(format!("malformed response from {}: {}", path, e)))
    }
}

fn classify(status: StatusCode, body: &str) -> ExecutionError {
    let message = format!("exchange returned {}: {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        tracing::warn!("{}", message);
        ExecutionError::Transient(message)
    } else {
        ExecutionError::Rejected(message)
    }
}

fn encode_symbol(symbol: &str) -> String {
    symbol.replace('/', "%2F")
}

fn parse_state(status: &str) -> Result<OrderState, ExecutionError> {
    match status.to_ascii_lowercase().as_str() {
        "new" | "open" => Ok(OrderState::Open),
        "partially_filled" => Ok(OrderState::PartiallyFilled),
        "filled" => Ok(OrderState::Filled),
        "cancelled" | "canceled" | "expired" => Ok(OrderState::Cancelled),
        "rejected" => Ok(OrderState::Rejected),
        other => Err(ExecutionError::Transient(format!("unknown order status {:?}", other))),
    }
}

#[async_trait]
impl ExchangeClient for HttpExchange {
    fn name(&self) -> &str {
        "http"
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        client_order_id: Uuid,
    ) -> Result<String, ExecutionError> {
        let body = serde_json::to_string(&PlaceOrderRequest {
            symbol,
            side: side.as_str(),
            order_type: "market",
            quantity,
            client_order_id,
        })
        .map_err(|e| ExecutionError::Rejected(e.to_string()))?;

        let response: PlaceOrderResponse = self.request(Method::POST, "/orders", Some(body)).await?;
        Ok(response.order_id)
    }

    async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderStatus, ExecutionError> {
        let path = format!("/orders/{}?symbol={}", order_id, encode_symbol(symbol));
        let response: OrderStatusResponse = self.request(Method::GET, &path, None).await?;

        Ok(OrderStatus {
            state: parse_state(&response.status)?,
            order_id: response.order_id,
            requested_quantity: response.quantity,
            filled_quantity: response.filled_quantity,
            average_price: response.average_price,
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExecutionError> {
        let path = format!("/orders/{}?symbol={}", order_id, encode_symbol(symbol));
        let _: serde_json::Value = self.request(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn get_balance(&self, asset: &str) -> Result<Decimal, ExecutionError> {
        let response: BalanceResponse = self
            .request(Method::GET, &format!("/balance/{}", asset), None)
            .await?;
        Ok(response.free)
    }

    async fn get_last_price(&self, symbol: &str) -> Result<Decimal, ExecutionError> {
        let path = format!("/ticker?symbol={}", encode_symbol(symbol));
        let response: TickerResponse = self.request(Method::GET, &path, None).await?;
        Ok(response.last)
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExecutionError> {
        let path = format!(
            "/ohlcv?symbol={}&timeframe={}&limit={}",
            encode_symbol(symbol),
            timeframe,
            limit
        );
        let rows: Vec<OhlcvRow> = self.request(Method::GET, &path, None).await?;

        let mut candles = Vec::with_capacity(rows.len());
        for (ts, open, high, low, close, volume) in rows {
            let timestamp = timestamp_from_millis(ts)
                .ok_or_else(|| ExecutionError::Transient(format!("invalid candle timestamp {}", ts)))?;
            candles.push(Candle {
                symbol: symbol.to_string(),
                timestamp,
                open,
                high,
                low,
                close,
                volume,
            });
        }
        candles.sort_by_key(|c| c.timestamp);

        tracing::debug!("Fetched {} {} candles for {}", candles.len(), timeframe, symbol);
        Ok(candles)
    }
}
