use thiserror::Error;

/// Failure to compute a proposal from one metric spec.
/// `reason` becomes the reason of the `ScalingActive` condition.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct MetricError {
    pub reason: &'static str,
    pub message: String,
}

impl MetricError {
    pub fn new(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    /// Wrap a collaborator error, keeping its whole context chain.
    pub fn from_source(reason: &'static str, what: &str, err: anyhow::Error) -> Self {
        Self::new(reason, format!("failed to get {}: {:#}", what, err))
    }
}

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("{0}")]
    InvalidSelector(String),
    #[error("invalid metrics ({invalid} invalid out of {total}), first error is: {first}")]
    InvalidMetrics {
        invalid: usize,
        total: usize,
        first: MetricError,
    },
}

impl AggregationError {
    /// Reason of the `ScalingActive=False` condition.
    pub fn reason(&self) -> &'static str {
        match self {
            AggregationError::InvalidSelector(_) => "InvalidSelector",
            AggregationError::InvalidMetrics { first, .. } => first.reason,
        }
    }
}

/// A simple scaler that could not vote this tick.
#[derive(Debug, Error)]
#[error("{scaler} scaler failed: {kind}")]
pub struct ScalerError {
    pub scaler: &'static str,
    #[source]
    pub kind: ScalerErrorKind,
}

#[derive(Debug, Error)]
pub enum ScalerErrorKind {
    #[error("webhook client config must set exactly one of url and service")]
    InvalidClientConfig,
    #[error("invalid CA bundle: {0}")]
    InvalidCaBundle(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("webhook returned an empty body")]
    EmptyBody,
    #[error("failed to decode webhook response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("webhook response is missing")]
    MissingResponse,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_metrics_message() {
        let err = AggregationError::InvalidMetrics {
            invalid: 2,
            total: 3,
            first: MetricError::new("FailedGetPodsMetric", "no samples"),
        };
        assert_eq!(
            err.to_string(),
            "invalid metrics (2 invalid out of 3), first error is: no samples"
        );
        assert_eq!(err.reason(), "FailedGetPodsMetric");
    }

    #[test]
    fn scaler_error_names_source() {
        let err = ScalerError {
            scaler: "webhook",
            kind: ScalerErrorKind::EmptyBody,
        };
        assert_eq!(err.scaler, "webhook");
        assert_eq!(err.to_string(), "webhook scaler failed: webhook returned an empty body");
    }
}
