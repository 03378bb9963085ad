// Market data: rolling bar cache, Binance kline sources and the ingestion task

pub mod backoff;
pub mod binance;
pub mod cache;
pub mod ingestion;
pub mod validator;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{PriceBar, Timeframe};

pub use backoff::ExponentialBackoff;
pub use binance::BinanceMarketData;
pub use cache::{CacheError, Gap, IngestOutcome, MarketDataCache, MarketSnapshot, SymbolHealth};
pub use ingestion::IngestionTask;
pub use validator::BarValidator;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("parse error: {0}")]
    Parse(String),
}

/// Historical bar source used for warm-up and gap backfill
#[async_trait]
pub trait HistoricalBars: Send + Sync {
    /// Up to `limit` bars opening in `[start, end]`, oldest first
    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<PriceBar>, IngestError>;
}

/// Opens live bar streams
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(
        &self,
        symbols: &[String],
        timeframes: &[Timeframe],
    ) -> Result<Box<dyn BarStream>, IngestError>;
}

/// One live connection delivering bar updates
#[async_trait]
pub trait BarStream: Send {
    /// Next bar update, `Ok(None)` once the server closed the stream
    async fn next_bar(&mut self) -> Result<Option<PriceBar>, IngestError>;
}
