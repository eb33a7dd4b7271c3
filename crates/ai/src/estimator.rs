//! The demand-estimator capability and a bounded-time wrapper around it.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use stockwise_core::ProductId;

use crate::result::{AiError, DemandForecast};

/// `estimate(productId) -> {prediction}`.
///
/// Implementations may block (remote model, slow query). Callers that need a
/// deadline wrap them in [`TimeoutEstimator`].
pub trait DemandEstimator: Send + Sync {
    fn estimate(&self, product_id: ProductId) -> Result<DemandForecast, AiError>;
}

/// Closures work as estimators; handy for wiring a remote client or a stub.
impl<F> DemandEstimator for F
where
    F: Fn(ProductId) -> Result<DemandForecast, AiError> + Send + Sync,
{
    fn estimate(&self, product_id: ProductId) -> Result<DemandForecast, AiError> {
        self(product_id)
    }
}

/// Runs each estimate on a helper thread and gives up after `timeout`.
///
/// A call that overruns keeps running in the background; its result is
/// discarded. Output is validated so NaN or negative predictions surface as
/// errors.
pub struct TimeoutEstimator<E: ?Sized> {
    inner: Arc<E>,
    timeout: Duration,
}

impl<E> TimeoutEstimator<E>
where
    E: DemandEstimator + ?Sized + 'static,
{
    pub fn new(inner: Arc<E>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl<E> DemandEstimator for TimeoutEstimator<E>
where
    E: DemandEstimator + ?Sized + 'static,
{
    fn estimate(&self, product_id: ProductId) -> Result<DemandForecast, AiError> {
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);

        thread::Builder::new()
            .name("demand-estimate".to_string())
            .spawn(move || {
                // Receiver may be gone after a timeout; nothing to do then.
                let _ = tx.send(inner.estimate(product_id));
            })
            .map_err(|e| AiError::Internal(format!("failed to spawn estimator thread: {e}")))?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result.and_then(DemandForecast::validate),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(product_id = %product_id, timeout_ms = self.timeout.as_millis() as u64, "demand estimate timed out");
                Err(AiError::Timeout(self.timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(AiError::Internal("estimator thread panicked".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub<F>(f: F) -> Arc<F>
    where
        F: Fn(ProductId) -> Result<DemandForecast, AiError> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    #[test]
    fn fast_estimates_pass_through() {
        let inner = stub(|_| Ok(DemandForecast::new(12.0)));
        let est = TimeoutEstimator::new(inner, Duration::from_secs(1));

        assert_eq!(est.estimate(ProductId::new()).unwrap().prediction, 12.0);
    }

    #[test]
    fn slow_estimates_time_out() {
        let inner = stub(|_| {
            thread::sleep(Duration::from_millis(300));
            Ok(DemandForecast::new(1.0))
        });
        let est = TimeoutEstimator::new(inner, Duration::from_millis(20));

        assert_eq!(
            est.estimate(ProductId::new()),
            Err(AiError::Timeout(Duration::from_millis(20)))
        );
    }

    #[test]
    fn nonsense_predictions_are_errors() {
        let inner = stub(|_| Ok(DemandForecast::new(f64::NAN)));
        let est = TimeoutEstimator::new(inner, Duration::from_secs(1));

        assert!(matches!(
            est.estimate(ProductId::new()),
            Err(AiError::InvalidOutput(_))
        ));
    }

    #[test]
    fn inner_errors_are_propagated() {
        let inner = stub(|_| Err(AiError::InferenceFailed("model missing".into())));
        let est = TimeoutEstimator::new(inner, Duration::from_secs(1));

        assert_eq!(
            est.estimate(ProductId::new()),
            Err(AiError::InferenceFailed("model missing".into()))
        );
    }
}
