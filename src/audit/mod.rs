// Append-only audit trail of decision cycles and late order resolutions

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Action, DecisionCycle, OrderRecord};

pub use memory::MemoryAuditStore;
pub use postgres::PostgresAuditStore;

pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("decision cycle {0} already recorded")]
    Duplicate(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Filter for `AuditStore::query`
///
/// A cycle matches when one of its entries has the symbol and action asked
/// for and it started within `[from, to)`.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleQuery {
    pub symbol: Option<String>,
    pub action: Option<Action>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for CycleQuery {
    fn default() -> Self {
        Self {
            symbol: None,
            action: None,
            from: None,
            to: None,
            offset: 0,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl CycleQuery {
    pub fn matches(&self, cycle: &DecisionCycle) -> bool {
        if self.from.is_some_and(|from| cycle.started_at < from) {
            return false;
        }
        if self.to.is_some_and(|to| cycle.started_at >= to) {
            return false;
        }
        if self.symbol.is_none() && self.action.is_none() {
            return true;
        }
        cycle.entries.iter().any(|entry| {
            self.symbol.as_deref().map_or(true, |s| entry.symbol == s)
                && self.action.as_ref().map_or(true, |a| &entry.decision.action == a)
        })
    }
}

/// One page of cycles, newest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CyclePage {
    pub cycles: Vec<DecisionCycle>,
    /// Matching cycles across all pages
    pub total: usize,
}

/// Order resolution discovered after its cycle was written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLogEntry {
    pub recorded_at: DateTime<Utc>,
    pub order: OrderRecord,
}

/// Write-once store; there is no update or delete
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist a whole cycle atomically; a second append of the same id fails
    async fn append(&self, cycle: &DecisionCycle) -> Result<(), AuditError>;

    async fn append_order_update(&self, order: &OrderRecord) -> Result<(), AuditError>;

    async fn query(&self, filter: &CycleQuery) -> Result<CyclePage, AuditError>;

    /// Order log, oldest first
    async fn order_updates(&self, symbol: Option<&str>) -> Result<Vec<OrderLogEntry>, AuditError>;
}
