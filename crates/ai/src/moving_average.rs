//! Local demand estimator for deployments without a remote model.
//!
//! Uses the same two features the hosted model is trained on: yesterday's
//! sales and the trailing seven-day mean. The forecast is their average,
//! scaled to the replenishment horizon.

use serde_json::json;

use stockwise_core::ProductId;

use crate::estimator::DemandEstimator;
use crate::result::{AiError, DemandForecast};

/// Source of per-day unit sales.
pub trait SalesHistory: Send + Sync {
    /// Units sold per day for the last `days` days, oldest first. Days without
    /// sales are zero. Fewer entries than requested means the product is newer
    /// than the window.
    fn daily_sales(&self, product_id: ProductId, days: usize) -> Result<Vec<i64>, AiError>;
}

const WEEK: usize = 7;

#[derive(Debug, Clone)]
pub struct MovingAverageEstimator<H> {
    history: H,
    horizon_days: u32,
}

impl<H: SalesHistory> MovingAverageEstimator<H> {
    pub fn new(history: H) -> Self {
        Self {
            history,
            horizon_days: WEEK as u32,
        }
    }

    pub fn with_horizon_days(mut self, days: u32) -> Self {
        self.horizon_days = days.max(1);
        self
    }
}

impl<H: SalesHistory> DemandEstimator for MovingAverageEstimator<H> {
    fn estimate(&self, product_id: ProductId) -> Result<DemandForecast, AiError> {
        let sales = self.history.daily_sales(product_id, WEEK)?;
        if sales.is_empty() {
            return Err(AiError::InvalidInput(format!("no sales history for {product_id}")));
        }

        let prev_sales_1 = sales.last().copied().unwrap_or_default().max(0) as f64;
        let prev_sales_7 = sales.iter().map(|s| (*s).max(0)).sum::<i64>() as f64 / WEEK as f64;
        let daily = (prev_sales_1 + prev_sales_7) / 2.0;
        let prediction = daily * f64::from(self.horizon_days);

        Ok(DemandForecast::new(prediction)
            .with_confidence(sales.len() as f64 / WEEK as f64)
            .with_metadata(json!({
                "model": "moving_average",
                "prev_sales_1": prev_sales_1,
                "prev_sales_7": prev_sales_7,
                "horizon_days": self.horizon_days,
            })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixedHistory(HashMap<ProductId, Vec<i64>>);

    impl SalesHistory for FixedHistory {
        fn daily_sales(&self, product_id: ProductId, _days: usize) -> Result<Vec<i64>, AiError> {
            Ok(self.0.get(&product_id).cloned().unwrap_or_default())
        }
    }

    #[test]
    fn averages_last_day_with_weekly_mean() {
        let product_id = ProductId::new();
        let history = FixedHistory(HashMap::from([(product_id, vec![7, 7, 7, 7, 7, 7, 21])]));
        let est = MovingAverageEstimator::new(history).with_horizon_days(2);

        let forecast = est.estimate(product_id).unwrap();

        // prev_1 = 21, prev_7 = 63 / 7 = 9, daily = 15
        assert_eq!(forecast.prediction, 30.0);
        assert_eq!(forecast.confidence, 1.0);
        assert_eq!(forecast.metadata["model"], "moving_average");
    }

    #[test]
    fn no_history_is_an_error_so_callers_fall_back() {
        let est = MovingAverageEstimator::new(FixedHistory(HashMap::new()));
        assert!(matches!(
            est.estimate(ProductId::new()),
            Err(AiError::InvalidInput(_))
        ));
    }
}
