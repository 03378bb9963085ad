use crate::models::{PriceBar, Timeframe};
use crate::Result;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::time::{timeout, Duration};

/// Redis archive of closed bars, used to warm the cache when REST history is unavailable
///
/// Uses one sorted set per series, scored by open time (ms)
#[derive(Clone)]
pub struct BarArchive {
    conn: ConnectionManager,
}

fn series_key(symbol: &str, timeframe: Timeframe) -> String {
    format!("bars:{}:{}", symbol, timeframe)
}

impl BarArchive {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| "Redis connection timeout after 5 seconds")??;

        tracing::info!("Connected to Redis bar archive at {}", redis_url);

        Ok(Self { conn })
    }

    /// Archive closed bars; in-progress bars are skipped
    pub async fn save_bars(&self, bars: &[PriceBar]) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut saved = 0;

        for bar in bars.iter().filter(|b| b.is_closed) {
            let key = series_key(&bar.symbol, bar.timeframe);
            let value = serde_json::to_string(bar)?;
            let score = bar.open_time.timestamp_millis() as f64;

            conn.zadd::<_, _, _, ()>(&key, value, score).await?;
            saved += 1;
        }

        Ok(saved)
    }

    /// Load the most recent `limit` bars of a series (oldest first)
    pub async fn load_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<PriceBar>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let key = series_key(symbol, timeframe);
        let results: Vec<String> = conn.zrange(&key, -(limit as isize), -1).await?;

        let mut bars = Vec::with_capacity(results.len());
        for json_str in results {
            bars.push(serde_json::from_str::<PriceBar>(&json_str)?);
        }

        tracing::info!(
            symbol = %symbol,
            timeframe = %timeframe,
            count = bars.len(),
            "Loaded archived bars from Redis"
        );

        Ok(bars)
    }

    /// Remove bars that opened more than `keep_hours` ago
    pub async fn prune(&self, symbol: &str, timeframe: Timeframe, keep_hours: i64) -> Result<usize> {
        let mut conn = self.conn.clone();
        let key = series_key(symbol, timeframe);
        let cutoff = Utc::now() - chrono::Duration::hours(keep_hours);

        let removed: usize = conn
            .zrembyscore(&key, "-inf", cutoff.timestamp_millis() as f64)
            .await?;

        if removed > 0 {
            tracing::debug!(symbol = %symbol, timeframe = %timeframe, removed, "Pruned archived bars");
        }

        Ok(removed)
    }

    pub async fn count_bars(&self, symbol: &str, timeframe: Timeframe) -> Result<usize> {
        let mut conn = self.conn.clone();
        let count: usize = conn.zcard(series_key(symbol, timeframe)).await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_bar(symbol: &str, minutes_ago: i64, price: f64) -> PriceBar {
        let open_time = Utc::now() - chrono::Duration::minutes(minutes_ago);
        PriceBar {
            symbol: symbol.to_string(),
            timeframe: Timeframe::M3,
            open_time,
            close_time: open_time + chrono::Duration::minutes(3),
            open: price,
            high: price + 1.0,
            low: price - 1.0,
            close: price,
            volume: 1000.0,
            is_closed: true,
        }
    }

    #[test]
    fn test_series_key() {
        assert_eq!(series_key("BTCUSDT", Timeframe::H4), "bars:BTCUSDT:4h");
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_connection_timeout() {
        let result = BarArchive::connect("redis://192.0.2.1:6379").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_save_and_load_round_trip() {
        let archive = BarArchive::connect("redis://127.0.0.1:6379")
            .await
            .expect("Failed to connect to Redis");
        let _ = archive.prune("TEST_ARCHIVE", Timeframe::M3, -1).await;

        let bars = vec![
            create_test_bar("TEST_ARCHIVE", 9, 100.0),
            create_test_bar("TEST_ARCHIVE", 6, 101.0),
            create_test_bar("TEST_ARCHIVE", 3, 102.0),
        ];
        assert_eq!(archive.save_bars(&bars).await.unwrap(), 3);

        let loaded = archive.load_bars("TEST_ARCHIVE", Timeframe::M3, 2).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].close, 101.0);
        assert_eq!(loaded[1].close, 102.0);

        let _ = archive.prune("TEST_ARCHIVE", Timeframe::M3, -1).await;
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_in_progress_bars_not_archived() {
        let archive = BarArchive::connect("redis://127.0.0.1:6379")
            .await
            .expect("Failed to connect to Redis");
        let _ = archive.prune("TEST_OPEN", Timeframe::M3, -1).await;

        let mut bar = create_test_bar("TEST_OPEN", 1, 100.0);
        bar.is_closed = false;
        assert_eq!(archive.save_bars(&[bar]).await.unwrap(), 0);
        assert_eq!(archive.count_bars("TEST_OPEN", Timeframe::M3).await.unwrap(), 0);
    }
}
