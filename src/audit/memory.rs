use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{AuditError, AuditStore, CyclePage, CycleQuery, OrderLogEntry};
use crate::models::{DecisionCycle, OrderRecord};

#[derive(Default)]
struct Records {
    cycles: Vec<DecisionCycle>,
    orders: Vec<OrderLogEntry>,
}

/// Audit store kept in process memory, for dry runs and tests
#[derive(Clone, Default)]
pub struct MemoryAuditStore {
    records: Arc<RwLock<Records>>,
    failing: Arc<AtomicBool>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail, simulating a lost database
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn cycles(&self) -> Vec<DecisionCycle> {
        self.records.read().await.cycles.clone()
    }

    fn check_writable(&self) -> Result<(), AuditError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Database(sqlx::Error::PoolClosed));
        }
        Ok(())
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, cycle: &DecisionCycle) -> Result<(), AuditError> {
        self.check_writable()?;

        let mut records = self.records.write().await;
        if records.cycles.iter().any(|c| c.id == cycle.id) {
            return Err(AuditError::Duplicate(cycle.id));
        }
        records.cycles.push(cycle.clone());
        Ok(())
    }

    async fn append_order_update(&self, order: &OrderRecord) -> Result<(), AuditError> {
        self.check_writable()?;

        self.records.write().await.orders.push(OrderLogEntry {
            recorded_at: Utc::now(),
            order: order.clone(),
        });
        Ok(())
    }

    async fn query(&self, filter: &CycleQuery) -> Result<CyclePage, AuditError> {
        let records = self.records.read().await;

        let mut matching: Vec<&DecisionCycle> =
            records.cycles.iter().filter(|c| filter.matches(c)).collect();
        // newest first; insertion order breaks ties
        matching.reverse();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        Ok(CyclePage {
            total: matching.len(),
            cycles: matching
                .into_iter()
                .skip(filter.offset)
                .take(filter.limit)
                .cloned()
                .collect(),
        })
    }

    async fn order_updates(&self, symbol: Option<&str>) -> Result<Vec<OrderLogEntry>, AuditError> {
        let records = self.records.read().await;
        Ok(records
            .orders
            .iter()
            .filter(|e| symbol.map_or(true, |s| e.order.symbol == s))
            .cloned()
            .collect())
    }
}
