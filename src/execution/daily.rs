use chrono::{DateTime, NaiveDate, Utc};

/// Realized PnL of the current UTC day, reset at midnight
#[derive(Debug, Clone)]
pub struct DailyPnl {
    day: NaiveDate,
    realized: f64,
    fills: u32,
}

impl DailyPnl {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            day: now.date_naive(),
            realized: 0.0,
            fills: 0,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.day {
            tracing::info!(
                previous_day = %self.day,
                realized = self.realized,
                fills = self.fills,
                "Resetting daily PnL"
            );
            self.day = today;
            self.realized = 0.0;
            self.fills = 0;
        }
    }

    pub fn record(&mut self, pnl: f64, now: DateTime<Utc>) {
        self.roll(now);
        self.realized += pnl;
        self.fills += 1;
    }

    pub fn realized(&mut self, now: DateTime<Utc>) -> f64 {
        self.roll(now);
        self.realized
    }
}
