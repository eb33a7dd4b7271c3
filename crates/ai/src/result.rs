use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use stockwise_core::InventoryError;

/// Demand forecast for one product: `{prediction: number}` on the wire.
///
/// This is an insight, not a domain event; the replenishment scheduler decides
/// what to do with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandForecast {
    /// Expected units of demand over the replenishment horizon.
    pub prediction: f64,

    /// Confidence in \[0, 1\] (convention; not enforced).
    #[serde(default)]
    pub confidence: f64,

    /// Free-form metadata (model name, feature values, timings).
    #[serde(default)]
    pub metadata: JsonValue,
}

impl DemandForecast {
    pub fn new(prediction: f64) -> Self {
        Self {
            prediction,
            confidence: 0.0,
            metadata: JsonValue::Null,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    /// Reject forecasts no caller could act on.
    pub fn validate(self) -> Result<Self, AiError> {
        if !self.prediction.is_finite() || self.prediction < 0.0 {
            return Err(AiError::InvalidOutput(format!(
                "prediction must be a finite non-negative number, got {}",
                self.prediction
            )));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AiError {
    #[error("invalid estimator input: {0}")]
    InvalidInput(String),

    #[error("invalid estimator output: {0}")]
    InvalidOutput(String),

    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("estimator timed out after {0:?}")]
    Timeout(Duration),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<AiError> for InventoryError {
    fn from(err: AiError) -> Self {
        InventoryError::EstimatorUnavailable(err.to_string())
    }
}
