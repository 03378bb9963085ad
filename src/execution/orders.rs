use std::collections::HashMap;

use crate::exchange::OrderUpdate;
use crate::models::{OrderRecord, OrderStatus};

/// Lifecycle records keyed by client order id
#[derive(Debug, Default)]
pub struct OrderTracker {
    records: HashMap<String, OrderRecord>,
}

impl OrderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: OrderRecord) {
        self.records.insert(record.client_order_id.clone(), record);
    }

    pub fn get(&self, client_order_id: &str) -> Option<&OrderRecord> {
        self.records.get(client_order_id)
    }

    /// Exchange order id from a submit response
    pub fn acknowledge(&mut self, client_order_id: &str, exchange_order_id: String) {
        if let Some(record) = self.records.get_mut(client_order_id) {
            record.exchange_order_id = Some(exchange_order_id);
        }
    }

    /// Apply an exchange report; a record already terminal is never touched
    ///
    /// Returns the record after the update, or `None` for unknown ids.
    pub fn apply(
        &mut self,
        client_order_id: &str,
        update: &OrderUpdate,
        fee_rate: f64,
    ) -> Option<OrderRecord> {
        let record = self.records.get_mut(client_order_id)?;
        if record.status.is_terminal() {
            return Some(record.clone());
        }

        record.exchange_order_id = Some(update.exchange_order_id.clone());
        record.status = update.status;
        record.filled_quantity = update.filled_quantity;
        record.fill_price = update.avg_price;
        record.fees = match update.avg_price {
            Some(price) => update.filled_quantity * price * fee_rate,
            None => 0.0,
        };
        record.updated_at = update.updated_at;

        Some(record.clone())
    }

    /// Set a non-terminal status (or a terminal one decided locally)
    pub fn set_status(
        &mut self,
        client_order_id: &str,
        status: OrderStatus,
        reason: Option<String>,
    ) -> Option<OrderRecord> {
        let record = self.records.get_mut(client_order_id)?;
        if record.status.is_terminal() {
            return Some(record.clone());
        }
        record.status = status;
        if reason.is_some() {
            record.reject_reason = reason;
        }
        record.updated_at = chrono::Utc::now();
        Some(record.clone())
    }

    /// Orders without a terminal status, oldest first
    pub fn unresolved(&self) -> Vec<OrderRecord> {
        let mut open: Vec<OrderRecord> = self
            .records
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect();
        open.sort_by_key(|r| r.submitted_at);
        open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderSide;
    use chrono::Utc;

    fn create_test_record(id: &str) -> OrderRecord {
        let now = Utc::now();
        OrderRecord {
            client_order_id: id.to_string(),
            exchange_order_id: None,
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            reduce_only: false,
            requested_quantity: 0.01,
            requested_notional: 500.0,
            requested_price: Some(50_000.0),
            status: OrderStatus::Pending,
            filled_quantity: 0.0,
            fill_price: None,
            fees: 0.0,
            reject_reason: None,
            submitted_at: now,
            updated_at: now,
        }
    }

    fn update(status: OrderStatus, filled: f64, price: Option<f64>) -> OrderUpdate {
        OrderUpdate {
            exchange_order_id: "42".to_string(),
            status,
            filled_quantity: filled,
            avg_price: price,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_terminal_record_is_never_changed() {
        let mut tracker = OrderTracker::new();
        tracker.insert(create_test_record("a"));

        let filled = tracker
            .apply("a", &update(OrderStatus::Filled, 0.01, Some(50_000.0)), 0.0004)
            .unwrap();
        assert_eq!(filled.status, OrderStatus::Filled);
        assert!((filled.fees - 0.2).abs() < 1e-9);

        // a stale or contradictory report later on changes nothing
        for _ in 0..3 {
            let again = tracker
                .apply("a", &update(OrderStatus::Canceled, 0.0, None), 0.0004)
                .unwrap();
            assert_eq!(again, filled);
        }
        assert_eq!(
            tracker.set_status("a", OrderStatus::Unconfirmed, None).unwrap(),
            filled
        );
    }

    #[test]
    fn test_unresolved_lists_open_and_unconfirmed() {
        let mut tracker = OrderTracker::new();
        tracker.insert(create_test_record("a"));
        tracker.insert(create_test_record("b"));
        tracker.insert(create_test_record("c"));

        tracker.set_status("a", OrderStatus::Unconfirmed, None);
        tracker.apply("c", &update(OrderStatus::Rejected, 0.0, None), 0.0);

        let ids: Vec<String> = tracker
            .unresolved()
            .into_iter()
            .map(|r| r.client_order_id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a".to_string()));
        assert!(ids.contains(&"b".to_string()));
    }

    #[test]
    fn test_unknown_order() {
        let mut tracker = OrderTracker::new();
        assert!(tracker
            .apply("missing", &update(OrderStatus::Filled, 1.0, Some(1.0)), 0.0)
            .is_none());
    }
}
