//! Error types for Tallyline
//!
//! Provides a unified error type and domain-specific error variants. The
//! top-level variants follow the billing error taxonomy:
//! - `Validation`: malformed request or configuration, never retried
//! - `NotFound`: expected steady-state outcome on the streaming path
//! - `Database` / `Transport`: I/O failures, always propagated and retried

use thiserror::Error;

/// Result type alias using TallyError
pub type Result<T> = std::result::Result<T, TallyError>;

/// Unified error type for Tallyline operations
#[derive(Debug, Error)]
pub enum TallyError {
    // Billing period errors
    #[error("Billing period error: {0}")]
    Period(#[from] PeriodError),

    // Pricing errors
    #[error("Pricing error: {0}")]
    Pricing(#[from] PricingError),

    // Request/config validation
    #[error("Validation error: {0}")]
    Validation(String),

    // Missing entity (customer, subscription, price, ...)
    #[error("Not found: {0}")]
    NotFound(String),

    // Repository I/O
    #[error("Database error: {0}")]
    Database(String),

    // Queue / publish failures
    #[error("Transport error: {0}")]
    Transport(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TallyError {
    /// Build a not-found error for an entity kind and key
    pub fn not_found(entity: &str, key: impl std::fmt::Display) -> Self {
        TallyError::NotFound(format!("{} {}", entity, key))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TallyError::NotFound(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TallyError::Validation(_) | TallyError::Period(_) | TallyError::Pricing(_)
        )
    }

    /// Whether redelivering the same input could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TallyError::Database(_) | TallyError::Transport(_) | TallyError::Internal(_)
        )
    }
}

/// Billing calendar errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeriodError {
    #[error("Billing period count must be positive")]
    ZeroPeriodCount,

    #[error("Unsupported billing period: {0}")]
    UnsupportedPeriod(String),

    #[error("Event at {event_ms} precedes subscription start {start_ms}")]
    BeforeSubscriptionStart { event_ms: i64, start_ms: i64 },

    #[error("Billing period duration must be positive: {start_ms}..{end_ms}")]
    NonPositiveDuration { start_ms: i64, end_ms: i64 },

    #[error("Period walk exceeded {0} iterations")]
    WalkLimit(usize),
}

/// Pricing configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PricingError {
    #[error("Tiered price {price_id} has no tier mode")]
    MissingTierMode { price_id: String },

    #[error("Tiered price {price_id} has no tiers")]
    EmptyTiers { price_id: String },

    #[error("Package price {price_id} has non-positive divisor")]
    InvalidPackageSize { price_id: String },

    #[error("Multiple currencies detected for customer {customer_id}")]
    MixedCurrencies { customer_id: String },
}

// Implement From for common external error types
impl From<serde_json::Error> for TallyError {
    fn from(err: serde_json::Error) -> Self {
        TallyError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for TallyError {
    fn from(err: std::io::Error) -> Self {
        TallyError::Database(err.to_string())
    }
}

impl From<anyhow::Error> for TallyError {
    fn from(err: anyhow::Error) -> Self {
        TallyError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TallyError::not_found("customer", "cust-1");
        assert!(err.to_string().contains("cust-1"));
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retry_classification() {
        assert!(TallyError::Database("timeout".into()).is_retryable());
        assert!(TallyError::Transport("closed".into()).is_retryable());
        assert!(!TallyError::Validation("bad".into()).is_retryable());

        let err: TallyError = PeriodError::ZeroPeriodCount.into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());
    }
}
