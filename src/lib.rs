// Core modules
pub mod audit;
pub mod config;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod market;
pub mod models;
pub mod oracle;
pub mod orchestrator;
pub mod persistence;
pub mod risk;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::ErrorCategory;
pub use models::*;
pub use orchestrator::DecisionOrchestrator;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
