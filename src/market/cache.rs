use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

use crate::indicators::{build_indicator_set, REQUIRED_BARS};
use crate::models::{IndicatorSet, PriceBar, Timeframe};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CacheError {
    #[error("{symbol} {timeframe}: {have} closed bars, need {need}")]
    InsufficientData {
        symbol: String,
        timeframe: Timeframe,
        have: usize,
        need: usize,
    },

    #[error("{symbol}: no market data for {silent_for_secs:?}s")]
    Stale {
        symbol: String,
        silent_for_secs: Option<i64>,
    },

    #[error("{symbol}: degraded for {remaining_cycles} more cycle(s)")]
    Degraded {
        symbol: String,
        remaining_cycles: u32,
    },
}

impl CacheError {
    /// Hold reason recorded when a cycle skips the oracle because of this error
    pub fn hold_reason(&self) -> &'static str {
        match self {
            CacheError::InsufficientData { .. } => "insufficient_data",
            CacheError::Stale { .. } => "stale_data",
            CacheError::Degraded { .. } => "degraded_data",
        }
    }
}

/// Immutable view of one symbol×timeframe series
///
/// Replaced wholesale on every accepted update; readers holding an `Arc`
/// keep a consistent copy.
#[derive(Debug, Clone, Default)]
pub struct SeriesSnapshot {
    pub closed: Arc<VecDeque<PriceBar>>,
    pub in_progress: Option<PriceBar>,
    pub indicators: Option<Arc<IndicatorSet>>,
    pub version: u64,
}

impl SeriesSnapshot {
    pub fn last_closed(&self) -> Option<&PriceBar> {
        self.closed.back()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gap {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Open time the next closed bar should have had
    pub expected: DateTime<Utc>,
    pub received: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Older than the last closed bar
    Late,
    /// Update to a bar that is already closed
    AlreadyClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// In-progress bar replaced
    Updated,
    /// Bar closed and indicators recomputed; `gap` is set when bars are missing before it
    Closed { gap: Option<Gap> },
    Ignored(IgnoreReason),
}

/// Liveness bookkeeping of a symbol
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolHealth {
    pub last_update: Option<DateTime<Utc>>,
    pub degraded_remaining: u32,
}

/// Latest closed-bar-derived view of a symbol across timeframes
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub last_price: f64,
    pub indicators: Vec<IndicatorSet>,
}

#[derive(Default)]
struct CacheState {
    series: HashMap<(String, Timeframe), Arc<SeriesSnapshot>>,
    health: HashMap<String, SymbolHealth>,
}

/// Thread-safe rolling bar buffers with derived indicators
///
/// One bounded series per symbol and timeframe. Cloning shares the buffers.
#[derive(Clone)]
pub struct MarketDataCache {
    state: Arc<RwLock<CacheState>>,
    capacity: usize,
    max_silence: Duration,
    required_bars: usize,
}

impl MarketDataCache {
    /// # Arguments
    /// * `capacity` - Closed bars kept per series
    /// * `max_silence` - Silence after which a symbol's data is stale
    pub fn new(capacity: usize, max_silence: std::time::Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(CacheState::default())),
            capacity: capacity.max(1),
            max_silence: Duration::from_std(max_silence).unwrap_or_else(|_| Duration::days(365)),
            required_bars: REQUIRED_BARS,
        }
    }

    /// Override the closed-bar minimum (defaults to the longest indicator lookback)
    pub fn with_required_bars(mut self, required_bars: usize) -> Self {
        self.required_bars = required_bars;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ingest_bar(&self, bar: PriceBar) -> IngestOutcome {
        self.ingest_bar_at(bar, Utc::now())
    }

    /// Apply a streamed bar update received at `received_at`
    pub fn ingest_bar_at(&self, bar: PriceBar, received_at: DateTime<Utc>) -> IngestOutcome {
        let key = (bar.symbol.clone(), bar.timeframe);
        let mut state = self.write();
        let current = state.series.get(&key).cloned().unwrap_or_default();

        if let Some(last) = current.last_closed() {
            if bar.open_time == last.open_time {
                return IngestOutcome::Ignored(IgnoreReason::AlreadyClosed);
            }
            if bar.open_time < last.open_time {
                return IngestOutcome::Ignored(IgnoreReason::Late);
            }
        }

        if !bar.is_closed {
            if let Some(open) = &current.in_progress {
                if bar.open_time < open.open_time {
                    return IngestOutcome::Ignored(IgnoreReason::Late);
                }
            }

            let next = SeriesSnapshot {
                closed: Arc::clone(&current.closed),
                in_progress: Some(bar.clone()),
                indicators: current.indicators.clone(),
                version: current.version + 1,
            };
            state.series.insert(key, Arc::new(next));
            touch(&mut state, &bar.symbol, received_at);
            return IngestOutcome::Updated;
        }

        let gap = current.last_closed().and_then(|last| {
            let expected = last.open_time + bar.timeframe.duration();
            (bar.open_time != expected).then(|| Gap {
                symbol: bar.symbol.clone(),
                timeframe: bar.timeframe,
                expected,
                received: bar.open_time,
            })
        });

        let mut closed = (*current.closed).clone();
        closed.push_back(bar.clone());
        while closed.len() > self.capacity {
            closed.pop_front();
        }

        let in_progress = current
            .in_progress
            .clone()
            .filter(|open| open.open_time > bar.open_time);

        let next = self.rebuild(closed, in_progress, current.version + 1);
        state.series.insert(key, Arc::new(next));
        touch(&mut state, &bar.symbol, received_at);

        IngestOutcome::Closed { gap }
    }

    /// Merge backfilled closed bars into a series
    ///
    /// Bars are ordered by open time, duplicates of bars already held are
    /// dropped, and the series is trimmed to capacity. Returns how many bars
    /// were added.
    pub fn fill_gap(&self, symbol: &str, timeframe: Timeframe, bars: Vec<PriceBar>) -> usize {
        let key = (symbol.to_string(), timeframe);
        let mut state = self.write();
        let current = state.series.get(&key).cloned().unwrap_or_default();

        let mut merged: Vec<PriceBar> = current.closed.iter().cloned().collect();
        let before = merged.len();
        for bar in bars {
            if bar.is_closed && bar.symbol == symbol && bar.timeframe == timeframe {
                merged.push(bar);
            }
        }

        // stable sort keeps held bars ahead of duplicates
        merged.sort_by_key(|b| b.open_time);
        merged.dedup_by_key(|b| b.open_time);
        let added = merged.len() - before;
        if added == 0 {
            return 0;
        }

        let skip = merged.len().saturating_sub(self.capacity);
        let closed: VecDeque<PriceBar> = merged.into_iter().skip(skip).collect();

        let last_open = closed.back().map(|b| b.open_time);
        let in_progress = current
            .in_progress
            .clone()
            .filter(|open| Some(open.open_time) > last_open);

        let next = self.rebuild(closed, in_progress, current.version + 1);
        state.series.insert(key, Arc::new(next));
        touch(&mut state, symbol, Utc::now());

        added
    }

    fn rebuild(
        &self,
        closed: VecDeque<PriceBar>,
        in_progress: Option<PriceBar>,
        version: u64,
    ) -> SeriesSnapshot {
        let bars: Vec<PriceBar> = closed.iter().cloned().collect();
        let indicators = build_indicator_set(&bars).map(Arc::new);
        SeriesSnapshot {
            closed: Arc::new(closed),
            in_progress,
            indicators,
            version,
        }
    }

    /// Current snapshot of one series
    pub fn series(&self, symbol: &str, timeframe: Timeframe) -> Option<Arc<SeriesSnapshot>> {
        self.read()
            .series
            .get(&(symbol.to_string(), timeframe))
            .cloned()
    }

    /// Copy of the closed bars of one series (oldest first)
    pub fn bars(&self, symbol: &str, timeframe: Timeframe) -> Vec<PriceBar> {
        self.series(symbol, timeframe)
            .map(|s| s.closed.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn snapshot(
        &self,
        symbol: &str,
        timeframes: &[Timeframe],
    ) -> Result<MarketSnapshot, CacheError> {
        self.snapshot_at(symbol, timeframes, Utc::now())
    }

    /// Indicator sets for every requested timeframe, as seen at `now`
    pub fn snapshot_at(
        &self,
        symbol: &str,
        timeframes: &[Timeframe],
        now: DateTime<Utc>,
    ) -> Result<MarketSnapshot, CacheError> {
        let state = self.read();
        let health = state.health.get(symbol).cloned().unwrap_or_default();

        if health.degraded_remaining > 0 {
            return Err(CacheError::Degraded {
                symbol: symbol.to_string(),
                remaining_cycles: health.degraded_remaining,
            });
        }

        match health.last_update {
            Some(at) if now - at <= self.max_silence => {}
            last => {
                return Err(CacheError::Stale {
                    symbol: symbol.to_string(),
                    silent_for_secs: last.map(|at| (now - at).num_seconds()),
                })
            }
        }

        let mut indicators = Vec::with_capacity(timeframes.len());
        let mut last_price = None;
        let mut ordered = timeframes.to_vec();
        ordered.sort();

        for timeframe in ordered {
            let series = state
                .series
                .get(&(symbol.to_string(), timeframe))
                .cloned()
                .unwrap_or_default();

            let have = series.closed.len();
            let set = match &series.indicators {
                Some(set) if have >= self.required_bars => set,
                _ => {
                    return Err(CacheError::InsufficientData {
                        symbol: symbol.to_string(),
                        timeframe,
                        have,
                        need: self.required_bars,
                    })
                }
            };

            // shortest timeframe carries the freshest price
            if last_price.is_none() {
                last_price = series
                    .in_progress
                    .as_ref()
                    .map(|b| b.close)
                    .or_else(|| series.last_closed().map(|b| b.close));
            }
            indicators.push(set.as_ref().clone());
        }

        Ok(MarketSnapshot {
            symbol: symbol.to_string(),
            last_price: last_price.unwrap_or_default(),
            indicators,
        })
    }

    /// Exclude a symbol from the next `cycles` decision cycles
    pub fn mark_degraded(&self, symbol: &str, cycles: u32) {
        let mut state = self.write();
        let health = state.health.entry(symbol.to_string()).or_default();
        health.degraded_remaining = health.degraded_remaining.max(cycles);
        tracing::warn!(symbol = %symbol, cycles, "Symbol marked degraded");
    }

    /// Admit a symbol into a decision cycle, consuming one excluded cycle if degraded
    pub fn admit_cycle(&self, symbol: &str) -> Result<(), CacheError> {
        let mut state = self.write();
        let health = state.health.entry(symbol.to_string()).or_default();
        if health.degraded_remaining == 0 {
            return Ok(());
        }

        let remaining_cycles = health.degraded_remaining;
        health.degraded_remaining -= 1;
        Err(CacheError::Degraded {
            symbol: symbol.to_string(),
            remaining_cycles,
        })
    }

    pub fn health(&self, symbol: &str) -> SymbolHealth {
        self.read().health.get(symbol).cloned().unwrap_or_default()
    }
}

fn touch(state: &mut CacheState, symbol: &str, at: DateTime<Utc>) {
    let health = state.health.entry(symbol.to_string()).or_default();
    if health.last_update.map_or(true, |last| at > last) {
        health.last_update = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn create_test_bar(symbol: &str, index: i64, price: f64, is_closed: bool) -> PriceBar {
        let open_time = start() + Duration::minutes(3 * index);
        PriceBar {
            symbol: symbol.to_string(),
            timeframe: Timeframe::M3,
            open_time,
            close_time: open_time + Duration::minutes(3) - Duration::milliseconds(1),
            open: price,
            high: price + 1.0,
            low: price - 1.0,
            close: price + 0.5,
            volume: 1000.0,
            is_closed,
        }
    }

    fn filled_cache(symbol: &str, bars: i64) -> MarketDataCache {
        let cache = MarketDataCache::new(100, std::time::Duration::from_secs(120));
        for i in 0..bars {
            cache.ingest_bar_at(create_test_bar(symbol, i, 100.0 + i as f64, true), start());
        }
        cache
    }

    #[test]
    fn test_closed_bar_round_trip() {
        let cache = filled_cache("BTCUSDT", 50);
        let bar = create_test_bar("BTCUSDT", 50, 250.0, true);
        cache.ingest_bar_at(bar.clone(), start());

        let snapshot = cache
            .snapshot_at("BTCUSDT", &[Timeframe::M3], start())
            .unwrap();
        let set = &snapshot.indicators[0];

        assert_eq!(set.as_of, bar.close_time);
        assert_eq!(set.get("open"), Some(bar.open));
        assert_eq!(set.get("high"), Some(bar.high));
        assert_eq!(set.get("low"), Some(bar.low));
        assert_eq!(set.get("close"), Some(bar.close));
        assert_eq!(set.get("volume"), Some(bar.volume));
        assert_eq!(cache.bars("BTCUSDT", Timeframe::M3).last(), Some(&bar));
    }

    #[test]
    fn test_in_progress_update_keeps_indicators() {
        let cache = filled_cache("BTCUSDT", 50);
        let before = cache.series("BTCUSDT", Timeframe::M3).unwrap();

        let outcome = cache.ingest_bar_at(create_test_bar("BTCUSDT", 50, 300.0, false), start());
        assert_eq!(outcome, IngestOutcome::Updated);

        let after = cache.series("BTCUSDT", Timeframe::M3).unwrap();
        assert!(Arc::ptr_eq(
            before.indicators.as_ref().unwrap(),
            after.indicators.as_ref().unwrap()
        ));
        assert_eq!(after.version, before.version + 1);

        // price comes from the in-progress bar
        let snapshot = cache.snapshot_at("BTCUSDT", &[Timeframe::M3], start()).unwrap();
        assert_eq!(snapshot.last_price, 300.5);
    }

    #[test]
    fn test_readers_keep_their_snapshot() {
        let cache = filled_cache("BTCUSDT", 10);
        let held = cache.series("BTCUSDT", Timeframe::M3).unwrap();

        cache.ingest_bar_at(create_test_bar("BTCUSDT", 10, 500.0, true), start());

        assert_eq!(held.closed.len(), 10);
        assert_eq!(cache.bars("BTCUSDT", Timeframe::M3).len(), 11);
    }

    #[test]
    fn test_late_and_closed_updates_ignored() {
        let cache = filled_cache("BTCUSDT", 5);

        let outcome = cache.ingest_bar_at(create_test_bar("BTCUSDT", 4, 1.0, true), start());
        assert_eq!(outcome, IngestOutcome::Ignored(IgnoreReason::AlreadyClosed));

        let outcome = cache.ingest_bar_at(create_test_bar("BTCUSDT", 2, 1.0, false), start());
        assert_eq!(outcome, IngestOutcome::Ignored(IgnoreReason::Late));

        assert_eq!(cache.bars("BTCUSDT", Timeframe::M3)[4].open, 104.0);
    }

    #[test]
    fn test_gap_reported() {
        let cache = filled_cache("BTCUSDT", 5);
        let outcome = cache.ingest_bar_at(create_test_bar("BTCUSDT", 8, 108.0, true), start());

        match outcome {
            IngestOutcome::Closed { gap: Some(gap) } => {
                assert_eq!(gap.expected, start() + Duration::minutes(15));
                assert_eq!(gap.received, start() + Duration::minutes(24));
            }
            other => panic!("expected gap, got {:?}", other),
        }

        let outcome = cache.ingest_bar_at(create_test_bar("BTCUSDT", 9, 109.0, true), start());
        assert_eq!(outcome, IngestOutcome::Closed { gap: None });
    }

    #[test]
    fn test_fill_gap_merges_in_order() {
        let cache = filled_cache("BTCUSDT", 5);
        cache.ingest_bar_at(create_test_bar("BTCUSDT", 8, 108.0, true), start());

        let backfill: Vec<PriceBar> = (3..9)
            .map(|i| create_test_bar("BTCUSDT", i, 100.0 + i as f64, true))
            .collect();
        let added = cache.fill_gap("BTCUSDT", Timeframe::M3, backfill);
        assert_eq!(added, 3);

        let bars = cache.bars("BTCUSDT", Timeframe::M3);
        assert_eq!(bars.len(), 9);
        for pair in bars.windows(2) {
            assert_eq!(pair[1].open_time - pair[0].open_time, Duration::minutes(3));
        }
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = MarketDataCache::new(5, std::time::Duration::from_secs(120));
        for i in 0..10 {
            cache.ingest_bar_at(create_test_bar("SOLUSDT", i, 100.0 + i as f64, true), start());
        }

        let bars = cache.bars("SOLUSDT", Timeframe::M3);
        assert_eq!(bars.len(), 5);
        assert_eq!(bars[0].open, 105.0);
        assert_eq!(bars[4].open, 109.0);
    }

    #[test]
    fn test_insufficient_data() {
        let cache = filled_cache("BTCUSDT", 49);
        let err = cache
            .snapshot_at("BTCUSDT", &[Timeframe::M3], start())
            .unwrap_err();
        assert_eq!(
            err,
            CacheError::InsufficientData {
                symbol: "BTCUSDT".to_string(),
                timeframe: Timeframe::M3,
                have: 49,
                need: 50,
            }
        );
        assert_eq!(err.hold_reason(), "insufficient_data");

        // a timeframe never seen is insufficient too
        let cache = filled_cache("BTCUSDT", 50);
        assert!(matches!(
            cache.snapshot_at("BTCUSDT", &[Timeframe::M3, Timeframe::H4], start()),
            Err(CacheError::InsufficientData { have: 0, .. })
        ));
    }

    #[test]
    fn test_stale_after_silence() {
        let cache = filled_cache("BTCUSDT", 50);
        let later = start() + Duration::seconds(121);

        let err = cache.snapshot_at("BTCUSDT", &[Timeframe::M3], later).unwrap_err();
        assert_eq!(err.hold_reason(), "stale_data");

        let unknown = cache.snapshot_at("ETHUSDT", &[Timeframe::M3], start()).unwrap_err();
        assert!(matches!(unknown, CacheError::Stale { silent_for_secs: None, .. }));
    }

    #[test]
    fn test_degraded_refuses_exactly_n_admissions() {
        let cache = filled_cache("BTCUSDT", 50);
        cache.mark_degraded("BTCUSDT", 2);

        assert!(matches!(
            cache.snapshot_at("BTCUSDT", &[Timeframe::M3], start()),
            Err(CacheError::Degraded { remaining_cycles: 2, .. })
        ));
        assert!(cache.admit_cycle("BTCUSDT").is_err());
        assert!(cache.admit_cycle("BTCUSDT").is_err());
        assert!(cache.admit_cycle("BTCUSDT").is_ok());
        assert!(cache.snapshot_at("BTCUSDT", &[Timeframe::M3], start()).is_ok());
    }

    #[test]
    fn test_symbols_are_independent() {
        let cache = filled_cache("BTCUSDT", 50);
        cache.ingest_bar_at(create_test_bar("ETHUSDT", 0, 10.0, true), start());

        assert!(cache.snapshot_at("BTCUSDT", &[Timeframe::M3], start()).is_ok());
        assert!(cache.snapshot_at("ETHUSDT", &[Timeframe::M3], start()).is_err());
    }

    #[test]
    fn test_thread_safety() {
        use std::thread;

        let cache = MarketDataCache::new(100, std::time::Duration::from_secs(120));
        let writer = cache.clone();

        let handle = thread::spawn(move || {
            for i in 0..60 {
                writer.ingest_bar_at(create_test_bar("SOLUSDT", i, 100.0, true), start());
            }
        });

        for _ in 0..60 {
            if let Some(series) = cache.series("SOLUSDT", Timeframe::M3) {
                // every snapshot is internally consistent
                for pair in series.closed.iter().collect::<Vec<_>>().windows(2) {
                    assert!(pair[0].open_time < pair[1].open_time);
                }
            }
        }

        handle.join().unwrap();
        assert_eq!(cache.bars("SOLUSDT", Timeframe::M3).len(), 60);
    }
}
