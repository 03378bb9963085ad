pub mod daily;
pub mod engine;
pub mod orders;
pub mod positions;

pub use daily::DailyPnl;
pub use engine::{EngineEvent, ExecutionEngine, ExecutionError, ExecutionReport, ReconcileReport};
pub use orders::OrderTracker;
pub use positions::{CachedPosition, Observation, PositionBook};
