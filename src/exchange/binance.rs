use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use super::{Exchange, ExchangeError, OrderRequest, OrderUpdate};
use crate::config::ExchangeConfig;
use crate::models::{Balance, OrderStatus, Position, PositionSide};

type HmacSha256 = Hmac<Sha256>;

type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

const QUOTE_ASSET: &str = "USDT";

/// Signed client for the Binance USDⓈ-M futures REST API
///
/// Cloneable; clones share the rate limiter.
#[derive(Clone)]
pub struct BinanceFutures {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
    rate_limiter: Arc<BinanceRateLimiter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewOrderResponse {
    order_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderQueryResponse {
    order_id: i64,
    status: String,
    executed_qty: String,
    avg_price: String,
    update_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRiskResponse {
    symbol: String,
    position_amt: String,
    entry_price: String,
    un_realized_profit: String,
    leverage: String,
    #[serde(default)]
    notional: Option<String>,
    #[serde(default)]
    isolated_margin: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceResponse {
    asset: String,
    balance: String,
    cross_un_pnl: String,
    available_balance: String,
}

fn number(field: &str, value: &str) -> Result<f64, ExchangeError> {
    value
        .parse::<f64>()
        .map_err(|_| ExchangeError::Parse(format!("invalid {}: {:?}", field, value)))
}

fn millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// Map a Binance order status string
pub fn map_order_status(status: &str) -> Result<OrderStatus, ExchangeError> {
    match status {
        "NEW" => Ok(OrderStatus::Pending),
        "PARTIALLY_FILLED" => Ok(OrderStatus::PartiallyFilled),
        "FILLED" => Ok(OrderStatus::Filled),
        "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" => Ok(OrderStatus::Canceled),
        "REJECTED" => Ok(OrderStatus::Rejected),
        other => Err(ExchangeError::Parse(format!("unknown order status {}", other))),
    }
}

impl BinanceFutures {
    pub fn new(config: &ExchangeConfig) -> Result<Self, ExchangeError> {
        let (Some(api_key), Some(api_secret)) = (&config.api_key, &config.api_secret) else {
            return Err(ExchangeError::Auth(
                "exchange.api_key and exchange.api_secret are required".to_string(),
            ));
        };

        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        Ok(Self {
            client,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            api_key: api_key.clone(),
            api_secret: api_secret.clone(),
            recv_window_ms: config.recv_window_ms,
            rate_limiter,
        })
    }

    /// Hex HMAC-SHA256 of the payload with the API secret
    fn sign(&self, payload: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Auth(e.to_string()))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Query string with recvWindow, timestamp and signature appended
    fn signed_query(&self, params: &[(&str, String)]) -> Result<String, ExchangeError> {
        let mut parts: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        parts.push(format!("recvWindow={}", self.recv_window_ms));
        parts.push(format!("timestamp={}", Utc::now().timestamp_millis()));

        let query = parts.join("&");
        let signature = self.sign(&query)?;
        Ok(format!("{}&signature={}", query, signature))
    }

    async fn signed_request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}?{}", self.base_url, path, self.signed_query(params)?);
        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(ExchangeError::from_reqwest)?;

        let status = response.status();
        let body = response.text().await.map_err(ExchangeError::from_reqwest)?;

        if !status.is_success() {
            return Err(ExchangeError::from_api_response(status.as_u16(), &body));
        }

        serde_json::from_str(&body).map_err(|e| ExchangeError::Parse(format!("{}: {}", e, body)))
    }
}

#[async_trait]
impl Exchange for BinanceFutures {
    async fn submit_order(&self, order: &OrderRequest) -> Result<String, ExchangeError> {
        let mut params = vec![
            ("symbol", order.symbol.clone()),
            ("side", order.side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", order.quantity.normalize().to_string()),
            ("newClientOrderId", order.client_order_id.clone()),
        ];
        if order.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let response: NewOrderResponse = self
            .signed_request(Method::POST, "/fapi/v1/order", &params)
            .await?;

        tracing::info!(
            symbol = %order.symbol,
            client_order_id = %order.client_order_id,
            order_id = response.order_id,
            "Order accepted by Binance"
        );

        Ok(response.order_id.to_string())
    }

    async fn order_status(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<OrderUpdate, ExchangeError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("origClientOrderId", client_order_id.to_string()),
        ];
        let response: OrderQueryResponse = self
            .signed_request(Method::GET, "/fapi/v1/order", &params)
            .await?;

        let avg_price = number("avgPrice", &response.avg_price)?;
        Ok(OrderUpdate {
            exchange_order_id: response.order_id.to_string(),
            status: map_order_status(&response.status)?,
            filled_quantity: number("executedQty", &response.executed_qty)?,
            avg_price: (avg_price > 0.0).then_some(avg_price),
            updated_at: millis(response.update_time),
        })
    }

    async fn position(&self, symbol: &str) -> Result<Position, ExchangeError> {
        let params = [("symbol", symbol.to_string())];
        let rows: Vec<PositionRiskResponse> = self
            .signed_request(Method::GET, "/fapi/v2/positionRisk", &params)
            .await?;

        let now = Utc::now();
        // one-way mode: a single row per symbol
        let Some(row) = rows.into_iter().find(|r| r.symbol == symbol) else {
            return Ok(Position::flat(symbol, now));
        };

        let amount = number("positionAmt", &row.position_amt)?;
        let leverage = row
            .leverage
            .parse::<u32>()
            .map_err(|_| ExchangeError::Parse(format!("invalid leverage {:?}", row.leverage)))?;
        let entry_price = number("entryPrice", &row.entry_price)?;

        let side = if amount > 0.0 {
            PositionSide::Long
        } else if amount < 0.0 {
            PositionSide::Short
        } else {
            PositionSide::Flat
        };

        let isolated = match row.isolated_margin.as_deref() {
            Some(v) => number("isolatedMargin", v)?,
            None => 0.0,
        };
        let margin = if isolated > 0.0 {
            isolated
        } else {
            let notional = match row.notional.as_deref() {
                Some(v) => number("notional", v)?.abs(),
                None => amount.abs() * entry_price,
            };
            notional / leverage.max(1) as f64
        };

        Ok(Position {
            symbol: symbol.to_string(),
            side,
            size: amount.abs(),
            entry_price,
            leverage,
            margin,
            unrealized_pnl: number("unRealizedProfit", &row.un_realized_profit)?,
            updated_at: now,
        })
    }

    async fn balance(&self) -> Result<Balance, ExchangeError> {
        let rows: Vec<BalanceResponse> = self
            .signed_request(Method::GET, "/fapi/v2/balance", &[])
            .await?;

        let row = rows
            .into_iter()
            .find(|r| r.asset == QUOTE_ASSET)
            .ok_or_else(|| ExchangeError::Parse(format!("no {} balance", QUOTE_ASSET)))?;

        let wallet = number("balance", &row.balance)?;
        let unrealized = number("crossUnPnl", &row.cross_un_pnl)?;

        Ok(Balance {
            total: wallet + unrealized,
            available: number("availableBalance", &row.available_balance)?,
            unrealized_pnl: unrealized,
            realized_pnl_today: 0.0,
            as_of: Utc::now(),
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("leverage", leverage.to_string()),
        ];
        let _: serde_json::Value = self
            .signed_request(Method::POST, "/fapi/v1/leverage", &params)
            .await?;

        tracing::info!(symbol = %symbol, leverage, "Leverage set");
        Ok(())
    }
}
