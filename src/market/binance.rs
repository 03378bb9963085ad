use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::{BarStream, HistoricalBars, IngestError, StreamConnector};
use crate::models::{PriceBar, Timeframe};

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Hard cap of the klines endpoint
const MAX_KLINES_PER_REQUEST: usize = 1500;

/// Binance USDⓈ-M futures market data: klines over REST and the combined kline stream
#[derive(Clone)]
pub struct BinanceMarketData {
    client: reqwest::Client,
    rest_url: String,
    ws_url: String,
}

impl BinanceMarketData {
    pub fn new(rest_url: &str, ws_url: &str) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            rest_url: rest_url.trim_end_matches('/').to_string(),
            ws_url: ws_url.trim_end_matches('/').to_string(),
        })
    }

    /// `{ws}/stream?streams=btcusdt@kline_3m/btcusdt@kline_4h/...`
    pub fn stream_url(&self, symbols: &[String], timeframes: &[Timeframe]) -> String {
        let streams: Vec<String> = symbols
            .iter()
            .flat_map(|symbol| {
                let lower = symbol.to_lowercase();
                timeframes
                    .iter()
                    .map(move |tf| format!("{}@kline_{}", lower, tf))
            })
            .collect();
        format!("{}/stream?streams={}", self.ws_url, streams.join("/"))
    }
}

/// One row of `GET /fapi/v1/klines`
type KlineRow = (
    i64,    // open time
    String, // open
    String, // high
    String, // low
    String, // close
    String, // volume
    i64,    // close time
    String, // quote volume
    u64,    // trades
    String, // taker buy base volume
    String, // taker buy quote volume
    String, // ignore
);

fn millis(ms: i64) -> Result<DateTime<Utc>, IngestError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| IngestError::Parse(format!("invalid timestamp {}", ms)))
}

fn number(field: &str, value: &str) -> Result<f64, IngestError> {
    value
        .parse::<f64>()
        .map_err(|_| IngestError::Parse(format!("invalid {}: {:?}", field, value)))
}

fn parse_kline_row(
    symbol: &str,
    timeframe: Timeframe,
    row: &KlineRow,
    now: DateTime<Utc>,
) -> Result<PriceBar, IngestError> {
    let close_time = millis(row.6)?;
    Ok(PriceBar {
        symbol: symbol.to_string(),
        timeframe,
        open_time: millis(row.0)?,
        close_time,
        open: number("open", &row.1)?,
        high: number("high", &row.2)?,
        low: number("low", &row.3)?,
        close: number("close", &row.4)?,
        volume: number("volume", &row.5)?,
        // the last row is the bar still forming
        is_closed: close_time < now,
    })
}

#[async_trait]
impl HistoricalBars for BinanceMarketData {
    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<PriceBar>, IngestError> {
        let mut query: Vec<(&str, String)> = vec![
            ("symbol", symbol.to_string()),
            ("interval", timeframe.to_string()),
            ("limit", limit.clamp(1, MAX_KLINES_PER_REQUEST).to_string()),
        ];
        if let Some(start) = start {
            query.push(("startTime", start.timestamp_millis().to_string()));
        }
        if let Some(end) = end {
            query.push(("endTime", end.timestamp_millis().to_string()));
        }

        let url = format!("{}/fapi/v1/klines", self.rest_url);
        let response = self.client.get(&url).query(&query).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let rows: Vec<KlineRow> = response
            .json()
            .await
            .map_err(|e| IngestError::Parse(e.to_string()))?;

        let now = Utc::now();
        let bars = rows
            .iter()
            .map(|row| parse_kline_row(symbol, timeframe, row, now))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            symbol = %symbol,
            timeframe = %timeframe,
            count = bars.len(),
            "Fetched historical klines"
        );

        Ok(bars)
    }
}

#[async_trait]
impl StreamConnector for BinanceMarketData {
    async fn connect(
        &self,
        symbols: &[String],
        timeframes: &[Timeframe],
    ) -> Result<Box<dyn BarStream>, IngestError> {
        let url = self.stream_url(symbols, timeframes);
        tracing::info!(url = %url, "Connecting to Binance kline stream");

        let (socket, _) = tokio::time::timeout(CONNECTION_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| IngestError::Connect("connection timeout".to_string()))?
            .map_err(|e| IngestError::Connect(e.to_string()))?;

        Ok(Box::new(BinanceKlineStream { socket }))
    }
}

pub struct BinanceKlineStream {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[derive(Debug, Deserialize)]
struct CombinedMessage {
    data: KlineEvent,
}

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "k")]
    kline: StreamKline,
}

#[derive(Debug, Deserialize)]
struct StreamKline {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    is_closed: bool,
}

/// Parse one combined-stream kline message
pub fn parse_kline_message(text: &str) -> Result<PriceBar, IngestError> {
    let message: CombinedMessage =
        serde_json::from_str(text).map_err(|e| IngestError::Parse(e.to_string()))?;
    let k = message.data.kline;

    Ok(PriceBar {
        timeframe: k.interval.parse().map_err(IngestError::Parse)?,
        open_time: millis(k.open_time)?,
        close_time: millis(k.close_time)?,
        open: number("open", &k.open)?,
        high: number("high", &k.high)?,
        low: number("low", &k.low)?,
        close: number("close", &k.close)?,
        volume: number("volume", &k.volume)?,
        is_closed: k.is_closed,
        symbol: k.symbol,
    })
}

#[async_trait]
impl BarStream for BinanceKlineStream {
    async fn next_bar(&mut self) -> Result<Option<PriceBar>, IngestError> {
        loop {
            let message = match self.socket.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(IngestError::Stream(e.to_string())),
                None => return Ok(None),
            };

            match message {
                Message::Text(text) => match parse_kline_message(&text) {
                    Ok(bar) => return Ok(Some(bar)),
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping unparseable stream message");
                    }
                },
                Message::Ping(payload) => {
                    self.socket
                        .send(Message::Pong(payload))
                        .await
                        .map_err(|e| IngestError::Stream(e.to_string()))?;
                }
                Message::Close(frame) => {
                    tracing::info!(frame = ?frame, "Kline stream closed by server");
                    return Ok(None);
                }
                _ => {}
            }
        }
    }
}
