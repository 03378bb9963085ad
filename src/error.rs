use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Outcome categories recorded per symbol and reported by `status()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    DataUnavailable,
    OracleError,
    /// An outcome rather than a failure
    RiskRejected,
    ExecutionTimeout,
    PositionDesync,
    SystemFatal,
}

impl ErrorCategory {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::DataUnavailable => "data_unavailable",
            ErrorCategory::OracleError => "oracle_error",
            ErrorCategory::RiskRejected => "risk_rejected",
            ErrorCategory::ExecutionTimeout => "execution_timeout",
            ErrorCategory::PositionDesync => "position_desync",
            ErrorCategory::SystemFatal => "system_fatal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error attached to a symbol entry of a decision cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleError {
    pub category: ErrorCategory,
    pub message: String,
}

impl CycleError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
