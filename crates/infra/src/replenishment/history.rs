use std::sync::Arc;

use chrono::{Days, Utc};

use stockwise_ai::{AiError, SalesHistory};
use stockwise_core::ProductId;
use stockwise_inventory::AdjustmentReason;

use crate::ledger::StockLedger;

/// Daily unit sales read back from the ledger's adjustment history.
///
/// A day's sales are its `ORDER_FULFILLED` units minus what came back through
/// cancellations and compensations, floored at zero. Only whole days before
/// today count, and days before the product's first adjustment are left out.
pub struct LedgerSalesHistory {
    ledger: Arc<StockLedger>,
}

impl LedgerSalesHistory {
    pub fn new(ledger: Arc<StockLedger>) -> Self {
        Self { ledger }
    }
}

impl SalesHistory for LedgerSalesHistory {
    fn daily_sales(&self, product_id: ProductId, days: usize) -> Result<Vec<i64>, AiError> {
        let history = self
            .ledger
            .history(product_id)
            .map_err(|e| AiError::InvalidInput(e.to_string()))?;
        let Some(first_day) = history.first().map(|h| h.timestamp.date_naive()) else {
            return Ok(Vec::new());
        };

        let today = Utc::now().date_naive();
        let mut sales = Vec::with_capacity(days);
        for offset in (1..=days as u64).rev() {
            let Some(day) = today.checked_sub_days(Days::new(offset)) else {
                continue;
            };
            if day < first_day {
                continue;
            }
            let net: i64 = history
                .iter()
                .filter(|h| h.timestamp.date_naive() == day && counts_as_sales(h.reason))
                .map(|h| -h.delta)
                .sum();
            sales.push(net.max(0));
        }
        Ok(sales)
    }
}

fn counts_as_sales(reason: AdjustmentReason) -> bool {
    matches!(
        reason,
        AdjustmentReason::OrderFulfilled | AdjustmentReason::OrderCancelled | AdjustmentReason::Compensation
    )
}
