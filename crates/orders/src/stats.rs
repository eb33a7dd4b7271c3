use serde::{Deserialize, Serialize};

use crate::order::{Order, OrderStatus};

/// Status counts and derived rates over a set of orders.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStats {
    pub total_orders: u64,
    pub created_orders: u64,
    pub confirmed_orders: u64,
    pub fulfilled_orders: u64,
    pub cancelled_orders: u64,
    pub compensation_pending_orders: u64,
    pub compensated_orders: u64,
}

impl OrderStats {
    pub fn from_orders<'a>(orders: impl IntoIterator<Item = &'a Order>) -> Self {
        let mut stats = Self::default();
        for order in orders {
            stats.record(order.status());
        }
        stats
    }

    pub fn record(&mut self, status: OrderStatus) {
        self.total_orders += 1;
        let slot = match status {
            OrderStatus::Created => &mut self.created_orders,
            OrderStatus::Confirmed => &mut self.confirmed_orders,
            OrderStatus::Fulfilled => &mut self.fulfilled_orders,
            OrderStatus::Cancelled => &mut self.cancelled_orders,
            OrderStatus::CompensationPending => &mut self.compensation_pending_orders,
            OrderStatus::Compensated => &mut self.compensated_orders,
        };
        *slot += 1;
    }

    /// Percentage of orders fulfilled (0 when there are no orders).
    pub fn fulfillment_rate(&self) -> f64 {
        self.percent(self.fulfilled_orders)
    }

    /// Percentage of orders cancelled (0 when there are no orders).
    pub fn cancellation_rate(&self) -> f64 {
        self.percent(self.cancelled_orders)
    }

    /// Orders still moving through the pipeline.
    pub fn active_orders(&self) -> u64 {
        self.created_orders + self.confirmed_orders
    }

    fn percent(&self, part: u64) -> f64 {
        if self.total_orders == 0 {
            0.0
        } else {
            part as f64 / self.total_orders as f64 * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_has_zero_rates() {
        let stats = OrderStats::default();
        assert_eq!(stats.fulfillment_rate(), 0.0);
        assert_eq!(stats.cancellation_rate(), 0.0);
        assert_eq!(stats.active_orders(), 0);
    }

    #[test]
    fn rates_are_percentages_of_total() {
        let mut stats = OrderStats::default();
        for status in [
            OrderStatus::Fulfilled,
            OrderStatus::Fulfilled,
            OrderStatus::Cancelled,
            OrderStatus::Created,
        ] {
            stats.record(status);
        }

        assert_eq!(stats.total_orders, 4);
        assert_eq!(stats.fulfillment_rate(), 50.0);
        assert_eq!(stats.cancellation_rate(), 25.0);
        assert_eq!(stats.active_orders(), 1);
    }
}
