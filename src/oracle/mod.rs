// Decision oracles: anything that turns a DecisionRequest into a Decision

pub mod llm;
pub mod rules;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{OracleConfig, OracleProvider};
use crate::models::{Decision, DecisionRequest};

pub use llm::LlmOracle;
pub use rules::RulesOracle;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OracleError {
    #[error("oracle timed out")]
    Timeout,

    #[error("malformed oracle response: {0}")]
    Malformed(String),

    #[error("oracle unavailable: {0}")]
    Unavailable(String),
}

/// Source of trading decisions; its output is never trusted
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, OracleError>;

    /// Short name for logs and audit
    fn name(&self) -> &str;
}

/// Build the oracle selected by `oracle.provider`
pub fn from_config(config: &OracleConfig) -> Result<Arc<dyn DecisionOracle>, OracleError> {
    match config.provider {
        OracleProvider::Llm => Ok(Arc::new(LlmOracle::new(config)?)),
        OracleProvider::Rules => Ok(Arc::new(RulesOracle::new())),
    }
}
