use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::models::Timeframe;
use crate::risk::RiskLimits;

/// Complete runtime configuration, passed by value into every component
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub market: MarketConfig,
    pub risk: RiskLimits,
    pub execution: ExecutionConfig,
    pub orchestrator: OrchestratorConfig,
    pub oracle: OracleConfig,
    pub exchange: ExchangeConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub symbols: Vec<String>,
    pub timeframes: Vec<Timeframe>,
    /// Closed bars kept per symbol and timeframe
    pub buffer_capacity: usize,
    pub max_silence_secs: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub backfill_attempts: u32,
    pub degraded_cycles: u32,
    pub ws_url: String,
    /// Optional Redis bar archive for warm starts
    pub redis_url: Option<String>,
    pub archive_retention_hours: i64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            timeframes: vec![Timeframe::M3, Timeframe::H4],
            buffer_capacity: 100,
            max_silence_secs: 120,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            backfill_attempts: 3,
            degraded_cycles: 3,
            ws_url: "wss://fstream.binance.com".to_string(),
            redis_url: None,
            archive_retention_hours: 72,
        }
    }
}

impl MarketConfig {
    pub fn max_silence(&self) -> Duration {
        Duration::from_secs(self.max_silence_secs)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub quantity_decimals: u32,
    /// Extra attempts after a pre-acceptance connection failure
    pub submit_retries: u32,
    pub poll_interval_ms: u64,
    pub confirm_timeout_ms: u64,
    pub reconcile_interval_secs: u64,
    pub position_max_age_secs: u64,
    /// Allowed absolute difference in base units before a desync is raised
    pub desync_tolerance: f64,
    pub taker_fee_rate: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            quantity_decimals: 3,
            submit_retries: 1,
            poll_interval_ms: 500,
            confirm_timeout_ms: 10_000,
            reconcile_interval_secs: 30,
            position_max_age_secs: 15,
            desync_tolerance: 1e-6,
            taker_fee_rate: 0.0004,
        }
    }
}

impl ExecutionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn position_max_age(&self) -> Duration {
        Duration::from_secs(self.position_max_age_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub tick_interval_secs: u64,
    pub tick_timeout_secs: u64,
    pub oracle_timeout_secs: u64,
    /// One audit record per tick (true) or per symbol (false)
    pub batch_symbols: bool,
    /// Earlier decisions of the symbol shown to the oracle; 0 disables
    pub history_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 180,
            tick_timeout_secs: 120,
            oracle_timeout_secs: 60,
            batch_symbols: true,
            history_limit: 10,
        }
    }
}

impl OrchestratorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn tick_timeout(&self) -> Duration {
        Duration::from_secs(self.tick_timeout_secs)
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.oracle_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OracleProvider {
    Llm,
    Rules,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub provider: OracleProvider,
    /// OpenAI-compatible endpoint root
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_retries: u32,
    pub temperature: f64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            provider: OracleProvider::Rules,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            max_retries: 3,
            temperature: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub rest_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub recv_window_ms: u64,
    pub requests_per_second: u32,
    pub request_timeout_ms: u64,
    /// Starting equity of the paper exchange used by dry runs
    pub paper_balance: f64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://fapi.binance.com".to_string(),
            api_key: None,
            api_secret: None,
            recv_window_ms: 5_000,
            requests_per_second: 10,
            request_timeout_ms: 5_000,
            paper_balance: 10_000.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// PostgreSQL URL; the in-memory store is used when unset
    pub database_url: Option<String>,
}

impl AppConfig {
    /// Load from an optional TOML file, then `ALPHATRADER__SECTION__KEY` environment overrides
    ///
    /// Without an explicit path, `alphatrader.toml` in the working directory is
    /// read if present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name("alphatrader").required(false),
        };

        let settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("ALPHATRADER")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("market.symbols")
                    .with_list_parse_key("market.timeframes")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.market.symbols.is_empty() {
            return invalid("market.symbols must not be empty".to_string());
        }
        if self.market.timeframes.is_empty() {
            return invalid("market.timeframes must not be empty".to_string());
        }
        if self.market.buffer_capacity < crate::indicators::REQUIRED_BARS {
            return invalid(format!(
                "market.buffer_capacity must be at least {}",
                crate::indicators::REQUIRED_BARS
            ));
        }
        if self.market.reconnect_base_ms == 0 || self.market.reconnect_max_ms < self.market.reconnect_base_ms {
            return invalid("market.reconnect_base_ms must be > 0 and <= reconnect_max_ms".to_string());
        }

        let durations = [
            ("market.max_silence_secs", self.market.max_silence_secs),
            ("execution.poll_interval_ms", self.execution.poll_interval_ms),
            ("execution.confirm_timeout_ms", self.execution.confirm_timeout_ms),
            ("execution.reconcile_interval_secs", self.execution.reconcile_interval_secs),
            ("execution.position_max_age_secs", self.execution.position_max_age_secs),
            ("orchestrator.tick_interval_secs", self.orchestrator.tick_interval_secs),
            ("orchestrator.tick_timeout_secs", self.orchestrator.tick_timeout_secs),
            ("orchestrator.oracle_timeout_secs", self.orchestrator.oracle_timeout_secs),
        ];
        for (name, value) in durations {
            if value == 0 {
                return invalid(format!("{} must be greater than zero", name));
            }
        }

        if self.execution.desync_tolerance < 0.0 {
            return invalid("execution.desync_tolerance must be non-negative".to_string());
        }
        if self.exchange.requests_per_second == 0 {
            return invalid("exchange.requests_per_second must be greater than zero".to_string());
        }

        self.risk.validate().map_err(ConfigError::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_symbols_rejected() {
        let mut config = AppConfig::default();
        config.market.symbols.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = AppConfig::default();
        config.orchestrator.oracle_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("oracle_timeout_secs"));
    }

    #[test]
    fn test_risk_limits_checked() {
        let mut config = AppConfig::default();
        config.risk.leverage = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("alphatrader-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(
            &path,
            r#"
            [market]
            symbols = ["SOLUSDT"]
            timeframes = ["15m", "1h"]

            [risk]
            max_position_size_pct = 0.1

            [orchestrator]
            batch_symbols = false
            "#,
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.market.symbols, vec!["SOLUSDT".to_string()]);
        assert_eq!(config.market.timeframes, vec![Timeframe::M15, Timeframe::H1]);
        assert_eq!(config.risk.max_position_size_pct, 0.1);
        assert!(!config.orchestrator.batch_symbols);
        // untouched sections keep their defaults
        assert_eq!(config.execution.submit_retries, 1);

        std::fs::remove_dir_all(&dir).ok();
    }
}
