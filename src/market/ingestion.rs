use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::{
    BarValidator, ExponentialBackoff, Gap, HistoricalBars, IngestError, IngestOutcome,
    MarketDataCache, StreamConnector,
};
use crate::config::MarketConfig;
use crate::models::{PriceBar, Timeframe};
use crate::persistence::BarArchive;

const ARCHIVE_PRUNE_INTERVAL: Duration = Duration::from_secs(3600);
const BACKOFF_JITTER: f64 = 0.2;

/// Long-lived task feeding one streaming connection into the cache
///
/// Warms every series at startup, reconnects with capped backoff, backfills
/// over REST after every reconnect and every reported gap, and marks a symbol
/// degraded when its backfill keeps failing.
pub struct IngestionTask {
    cache: MarketDataCache,
    connector: Arc<dyn StreamConnector>,
    history: Arc<dyn HistoricalBars>,
    archive: Option<BarArchive>,
    validator: BarValidator,
    config: MarketConfig,
}

enum SessionEnd {
    Shutdown,
    Disconnected(Option<IngestError>),
}

impl IngestionTask {
    pub fn new(
        cache: MarketDataCache,
        connector: Arc<dyn StreamConnector>,
        history: Arc<dyn HistoricalBars>,
        config: MarketConfig,
    ) -> Self {
        Self {
            cache,
            connector,
            history,
            archive: None,
            validator: BarValidator::new(),
            config,
        }
    }

    pub fn with_archive(mut self, archive: BarArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    fn series(&self) -> Vec<(String, Timeframe)> {
        self.config
            .symbols
            .iter()
            .flat_map(|s| self.config.timeframes.iter().map(move |tf| (s.clone(), *tf)))
            .collect()
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            self.config.reconnect_base(),
            self.config.reconnect_max(),
            BACKOFF_JITTER,
        )
    }

    /// Load `buffer_capacity` closed bars into every series (REST first, then the archive)
    pub async fn warm_up(&self) {
        for (symbol, timeframe) in self.series() {
            let fetched = self
                .history
                .fetch_bars(&symbol, timeframe, None, None, self.config.buffer_capacity + 1)
                .await;

            let bars = match fetched {
                Ok(bars) => bars,
                Err(e) => {
                    tracing::warn!(
                        symbol = %symbol,
                        timeframe = %timeframe,
                        error = %e,
                        "Historical fetch failed, trying archive"
                    );
                    self.load_archived(&symbol, timeframe).await
                }
            };

            let added = self.cache.fill_gap(&symbol, timeframe, self.valid(bars));
            tracing::info!(
                symbol = %symbol,
                timeframe = %timeframe,
                bars = added,
                "Warmed market data cache"
            );
        }
    }

    async fn load_archived(&self, symbol: &str, timeframe: Timeframe) -> Vec<PriceBar> {
        let Some(archive) = &self.archive else {
            return Vec::new();
        };
        match archive
            .load_bars(symbol, timeframe, self.config.buffer_capacity)
            .await
        {
            Ok(bars) => bars,
            Err(e) => {
                tracing::warn!(symbol = %symbol, error = %e, "Archive load failed");
                Vec::new()
            }
        }
    }

    fn valid(&self, bars: Vec<PriceBar>) -> Vec<PriceBar> {
        bars.into_iter()
            .filter(|bar| match self.validator.validate(bar) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(symbol = %bar.symbol, error = %e, "Dropping invalid bar");
                    false
                }
            })
            .collect()
    }

    /// Fetch the bars of one series opening at or after `since`, retrying with backoff
    ///
    /// Without `since` the fetch starts right after the last closed bar.
    /// Returns false (and marks the symbol degraded) once every attempt failed.
    pub async fn backfill(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: Option<DateTime<Utc>>,
    ) -> bool {
        let start = since.or_else(|| {
            self.cache
                .series(symbol, timeframe)
                .and_then(|s| s.last_closed().map(|b| b.open_time + timeframe.duration()))
        });

        let mut backoff = self.backoff();
        let attempts = self.config.backfill_attempts.max(1);

        for attempt in 1..=attempts {
            match self
                .history
                .fetch_bars(symbol, timeframe, start, None, self.config.buffer_capacity)
                .await
            {
                Ok(bars) => {
                    let bars = self.valid(bars);
                    self.archive_bars(&bars).await;
                    let added = self.cache.fill_gap(symbol, timeframe, bars);
                    tracing::info!(
                        symbol = %symbol,
                        timeframe = %timeframe,
                        added,
                        "Backfill complete"
                    );
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        symbol = %symbol,
                        timeframe = %timeframe,
                        attempt,
                        attempts,
                        error = %e,
                        "Backfill failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                }
            }
        }

        tracing::error!(
            symbol = %symbol,
            timeframe = %timeframe,
            cycles = self.config.degraded_cycles,
            "Backfill exhausted, excluding symbol from decision cycles"
        );
        self.cache.mark_degraded(symbol, self.config.degraded_cycles);
        false
    }

    async fn archive_bars(&self, bars: &[PriceBar]) {
        if let Some(archive) = &self.archive {
            if let Err(e) = archive.save_bars(bars).await {
                tracing::warn!(error = %e, "Failed to archive bars");
            }
        }
    }

    /// Validate and apply one streamed bar; returns the gap it revealed, if any
    pub async fn handle_bar(&self, bar: PriceBar) -> Option<Gap> {
        if let Err(e) = self.validator.validate(&bar) {
            tracing::warn!(symbol = %bar.symbol, error = %e, "Dropping invalid bar");
            return None;
        }

        let closed = bar.is_closed.then(|| bar.clone());
        match self.cache.ingest_bar(bar) {
            IngestOutcome::Closed { gap } => {
                if let Some(bar) = closed {
                    self.archive_bars(std::slice::from_ref(&bar)).await;
                }
                gap
            }
            IngestOutcome::Updated => None,
            IngestOutcome::Ignored(reason) => {
                tracing::debug!(reason = ?reason, "Ignored bar update");
                None
            }
        }
    }

    async fn prune_archive(&self) {
        let Some(archive) = &self.archive else {
            return;
        };
        for (symbol, timeframe) in self.series() {
            if let Err(e) = archive
                .prune(&symbol, timeframe, self.config.archive_retention_hours)
                .await
            {
                tracing::warn!(symbol = %symbol, error = %e, "Archive pruning failed");
            }
        }
    }

    /// Run until shutdown is signalled
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        self.warm_up().await;

        let mut backoff = self.backoff();
        let mut connected_before = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let stream = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                result = self.connector.connect(&self.config.symbols, &self.config.timeframes) => result,
            };

            let mut stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "Stream connection failed, retrying"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            };

            backoff.reset();
            tracing::info!("Market data stream connected");

            if connected_before {
                for (symbol, timeframe) in self.series() {
                    self.backfill(&symbol, timeframe, None).await;
                }
            }
            connected_before = true;

            match self.session(stream.as_mut(), &mut shutdown).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Disconnected(error) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = ?error.map(|e| e.to_string()),
                        delay_ms = delay.as_millis() as u64,
                        "Market data stream disconnected, reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        tracing::info!("Ingestion task stopped");
    }

    async fn session(
        &self,
        stream: &mut dyn super::BarStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let mut prune = tokio::time::interval(ARCHIVE_PRUNE_INTERVAL);
        prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return SessionEnd::Shutdown;
                    }
                }

                _ = prune.tick() => self.prune_archive().await,

                next = stream.next_bar() => match next {
                    Ok(Some(bar)) => {
                        if let Some(gap) = self.handle_bar(bar).await {
                            tracing::warn!(
                                symbol = %gap.symbol,
                                timeframe = %gap.timeframe,
                                expected = %gap.expected,
                                received = %gap.received,
                                "Gap in bar sequence, backfilling"
                            );
                            self.backfill(&gap.symbol, gap.timeframe, Some(gap.expected)).await;
                        }
                    }
                    Ok(None) => return SessionEnd::Disconnected(None),
                    Err(e) => return SessionEnd::Disconnected(Some(e)),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::BarStream;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn create_test_bar(index: i64, is_closed: bool) -> PriceBar {
        let open_time = start() + ChronoDuration::minutes(3 * index);
        PriceBar {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::M3,
            open_time,
            close_time: open_time + ChronoDuration::minutes(3) - ChronoDuration::milliseconds(1),
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 10.0,
            is_closed,
        }
    }

    /// Serves bars `[0, available)` and fails the first `failures` calls
    struct ScriptedHistory {
        available: i64,
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    impl ScriptedHistory {
        fn new(available: i64, failures: usize) -> Self {
            Self {
                available,
                failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HistoricalBars for ScriptedHistory {
        async fn fetch_bars(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            start_at: Option<DateTime<Utc>>,
            _end: Option<DateTime<Utc>>,
            limit: usize,
        ) -> Result<Vec<PriceBar>, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(IngestError::Connect("scripted failure".to_string()));
            }

            let bars: Vec<PriceBar> = (0..self.available)
                .map(|i| create_test_bar(i, true))
                .filter(|b| start_at.map_or(true, |s| b.open_time >= s))
                .collect();
            let skip = bars.len().saturating_sub(limit);
            Ok(bars.into_iter().skip(skip).collect())
        }
    }

    struct ChannelStream(mpsc::UnboundedReceiver<PriceBar>);

    #[async_trait]
    impl BarStream for ChannelStream {
        async fn next_bar(&mut self) -> Result<Option<PriceBar>, IngestError> {
            Ok(self.0.recv().await)
        }
    }

    /// Hands out pre-made streams, one per connect
    struct ScriptedConnector {
        streams: Mutex<Vec<mpsc::UnboundedReceiver<PriceBar>>>,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl StreamConnector for ScriptedConnector {
        async fn connect(
            &self,
            _symbols: &[String],
            _timeframes: &[Timeframe],
        ) -> Result<Box<dyn BarStream>, IngestError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let next = self.streams.lock().unwrap().pop();
            match next {
                Some(rx) => Ok(Box::new(ChannelStream(rx))),
                None => Err(IngestError::Connect("no more streams".to_string())),
            }
        }
    }

    fn test_config() -> MarketConfig {
        MarketConfig {
            symbols: vec!["BTCUSDT".to_string()],
            timeframes: vec![Timeframe::M3],
            buffer_capacity: 100,
            reconnect_base_ms: 5,
            reconnect_max_ms: 20,
            backfill_attempts: 3,
            degraded_cycles: 2,
            ..Default::default()
        }
    }

    fn create_task(history: Arc<ScriptedHistory>, connector: Arc<ScriptedConnector>) -> IngestionTask {
        let cache = MarketDataCache::new(100, std::time::Duration::from_secs(3600));
        IngestionTask::new(cache, connector, history, test_config())
    }

    fn no_streams() -> Arc<ScriptedConnector> {
        Arc::new(ScriptedConnector {
            streams: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_warm_up_fills_series() {
        let task = create_task(Arc::new(ScriptedHistory::new(60, 0)), no_streams());
        task.warm_up().await;
        assert_eq!(task.cache.bars("BTCUSDT", Timeframe::M3).len(), 60);
    }

    #[tokio::test]
    async fn test_gap_backfilled_after_retry() {
        let history = Arc::new(ScriptedHistory::new(12, 0));
        let task = create_task(history.clone(), no_streams());

        for i in 0..5 {
            task.handle_bar(create_test_bar(i, true)).await;
        }
        let gap = task.handle_bar(create_test_bar(10, true)).await;
        assert!(gap.is_some());

        history.failures.store(1, Ordering::SeqCst);
        let since = gap.map(|g| g.expected);
        assert!(task.backfill("BTCUSDT", Timeframe::M3, since).await);

        assert_eq!(task.cache.bars("BTCUSDT", Timeframe::M3).len(), 12);
        assert_eq!(task.cache.health("BTCUSDT").degraded_remaining, 0);
    }

    #[tokio::test]
    async fn test_exhausted_backfill_marks_degraded() {
        let history = Arc::new(ScriptedHistory::new(12, 10));
        let task = create_task(history.clone(), no_streams());

        assert!(!task.backfill("BTCUSDT", Timeframe::M3, None).await);
        assert_eq!(history.calls.load(Ordering::SeqCst), 3);
        assert_eq!(task.cache.health("BTCUSDT").degraded_remaining, 2);
    }

    #[tokio::test]
    async fn test_invalid_bar_dropped() {
        let task = create_task(Arc::new(ScriptedHistory::new(0, 0)), no_streams());
        let mut bar = create_test_bar(0, true);
        bar.high = 10.0;

        assert!(task.handle_bar(bar).await.is_none());
        assert!(task.cache.bars("BTCUSDT", Timeframe::M3).is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_triggers_backfill() {
        let (first_tx, first_rx) = mpsc::unbounded_channel();
        let (second_tx, second_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(ScriptedConnector {
            // popped from the back
            streams: Mutex::new(vec![second_rx, first_rx]),
            connects: AtomicUsize::new(0),
        });
        let history = Arc::new(ScriptedHistory::new(20, 0));
        let task = create_task(history.clone(), connector.clone());
        let cache = task.cache.clone();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(task.run(shutdown_rx));

        // first session: one live bar, then the server drops us
        first_tx.send(create_test_bar(20, true)).unwrap();
        drop(first_tx);

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while connector.connects.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // warm-up + post-reconnect backfill
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while history.calls.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        second_tx.send(create_test_bar(21, true)).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while cache.bars("BTCUSDT", Timeframe::M3).len() < 22 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
