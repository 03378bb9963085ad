// Exchange seam: order submission, order status, position, balance, leverage

pub mod binance;
pub mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{Balance, OrderSide, OrderStatus, Position};

pub use binance::BinanceFutures;
pub use paper::PaperExchange;

/// Market order as sent to the exchange
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    /// Generated locally; reused verbatim on retries so the exchange can de-duplicate
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub reduce_only: bool,
}

/// Order state as reported by the exchange
#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpdate {
    pub exchange_order_id: String,
    pub status: OrderStatus,
    pub filled_quantity: f64,
    pub avg_price: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExchangeError {
    /// Connection could not be established; the request never left
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    /// Connection broke after the request was sent
    #[error("transport error: {0}")]
    Transport(String),

    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("rejected by exchange ({code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("order not found")]
    NotFound,

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("parse error: {0}")]
    Parse(String),
}

impl ExchangeError {
    /// Failed before the exchange could have accepted anything; safe to resend
    pub fn is_pre_acceptance(&self) -> bool {
        matches!(self, ExchangeError::Connect(_))
    }

    /// The request may or may not have been processed; only a status query can tell
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout(_)
                | ExchangeError::Transport(_)
                | ExchangeError::Server { .. }
                | ExchangeError::Parse(_)
        )
    }

    pub fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_connect() {
            ExchangeError::Connect(error.to_string())
        } else if error.is_timeout() {
            ExchangeError::Timeout(error.to_string())
        } else if error.is_decode() {
            ExchangeError::Parse(error.to_string())
        } else {
            ExchangeError::Transport(error.to_string())
        }
    }

    /// Classify a non-success response
    ///
    /// Binance returns errors in the format: `{"code": -1000, "msg": "..."}`
    pub fn from_api_response(status: u16, body: &str) -> Self {
        #[derive(serde::Deserialize)]
        struct ApiError {
            code: i64,
            msg: String,
        }

        if status >= 500 {
            return ExchangeError::Server {
                status,
                body: body.to_string(),
            };
        }

        match serde_json::from_str::<ApiError>(body) {
            Ok(err) => match err.code {
                -2011 | -2013 => ExchangeError::NotFound,
                -1022 | -2014 | -2015 => ExchangeError::Auth(err.msg),
                code => ExchangeError::Rejected {
                    code,
                    message: err.msg,
                },
            },
            Err(_) => ExchangeError::Rejected {
                code: status as i64,
                message: body.to_string(),
            },
        }
    }
}

/// Authoritative account state and order entry
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Submit a market order; returns the exchange order id
    async fn submit_order(&self, order: &OrderRequest) -> Result<String, ExchangeError>;

    async fn order_status(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<OrderUpdate, ExchangeError>;

    async fn position(&self, symbol: &str) -> Result<Position, ExchangeError>;

    /// Account balance; `realized_pnl_today` is left at zero for the engine to fill in
    async fn balance(&self) -> Result<Balance, ExchangeError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_api_errors() {
        assert_eq!(
            ExchangeError::from_api_response(400, r#"{"code":-2013,"msg":"Order does not exist."}"#),
            ExchangeError::NotFound
        );
        assert!(matches!(
            ExchangeError::from_api_response(400, r#"{"code":-2019,"msg":"Margin is insufficient."}"#),
            ExchangeError::Rejected { code: -2019, .. }
        ));
        assert!(matches!(
            ExchangeError::from_api_response(401, r#"{"code":-2015,"msg":"Invalid API-key"}"#),
            ExchangeError::Auth(_)
        ));
        assert!(ExchangeError::from_api_response(503, "busy").is_ambiguous());
        assert!(ExchangeError::Parse("truncated body".into()).is_ambiguous());
        assert!(!ExchangeError::NotFound.is_ambiguous());
    }

    #[test]
    fn test_only_connect_errors_are_pre_acceptance() {
        assert!(ExchangeError::Connect("refused".into()).is_pre_acceptance());
        assert!(!ExchangeError::Timeout("slow".into()).is_pre_acceptance());
        assert!(!ExchangeError::Transport("reset".into()).is_pre_acceptance());
        assert!(!ExchangeError::Rejected { code: -1, message: "no".into() }.is_pre_acceptance());
    }
}
