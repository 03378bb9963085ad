// Risk management module
pub mod gate;
pub mod limits;

pub use gate::evaluate;
pub use limits::RiskLimits;
