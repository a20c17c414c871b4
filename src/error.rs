//! Engine error taxonomy
//!
//! Every failure the engine surfaces carries a stable [`ErrorCode`] so callers
//! (API layer, poll loop) can branch on the kind without string matching.

use rust_decimal::Decimal;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::coord::KvError;
use crate::state::StoreError;

/// Stable error codes exposed to callers of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Validation,
    InsufficientBalance,
    PositionLocked,
    AlreadyInProgress,
    PriceImpactTooHigh,
    ExternalTimeout,
    ExecutionFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::InsufficientBalance => "INSUFFICIENT_BALANCE",
            ErrorCode::PositionLocked => "POSITION_LOCKED",
            ErrorCode::AlreadyInProgress => "ALREADY_IN_PROGRESS",
            ErrorCode::PriceImpactTooHigh => "PRICE_IMPACT_TOO_HIGH",
            ErrorCode::ExternalTimeout => "EXTERNAL_TIMEOUT",
            ErrorCode::ExecutionFailed => "EXECUTION_FAILED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the trade executor and its collaborators
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Position not found: {0}")]
    PositionNotFound(Uuid),

    #[error(
        "Insufficient {token} balance in wallet {wallet}: have {current}, need {required}"
    )]
    InsufficientBalance {
        wallet: String,
        token: String,
        current: Decimal,
        required: Decimal,
    },

    #[error("Position {0} is locked by another operation")]
    PositionLocked(Uuid),

    #[error("Operation already in progress: {0}")]
    AlreadyInProgress(String),

    #[error("Price impact {impact}% exceeds maximum {max}% after exhausting retry sizes")]
    PriceImpactTooHigh { impact: Decimal, max: Decimal },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Execution failed: {context}")]
    ExecutionFailed {
        context: String,
        #[source]
        source: anyhow::Error,
    },
}

impl EngineError {
    /// Stable code for this error kind
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::Validation(_) | EngineError::PositionNotFound(_) => ErrorCode::Validation,
            EngineError::InsufficientBalance { .. } => ErrorCode::InsufficientBalance,
            EngineError::PositionLocked(_) => ErrorCode::PositionLocked,
            EngineError::AlreadyInProgress(_) => ErrorCode::AlreadyInProgress,
            EngineError::PriceImpactTooHigh { .. } => ErrorCode::PriceImpactTooHigh,
            EngineError::Timeout { .. } => ErrorCode::ExternalTimeout,
            EngineError::ExecutionFailed { .. } => ErrorCode::ExecutionFailed,
        }
    }

    /// Concurrency outcomes that the next poll tick re-evaluates on its own
    pub fn is_expected(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::PositionLocked | ErrorCode::AlreadyInProgress
        )
    }

    pub fn execution(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        EngineError::ExecutionFailed {
            context: context.into(),
            source: source.into(),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientBalance {
                wallet,
                token,
                current,
                required,
            } => EngineError::InsufficientBalance {
                wallet,
                token,
                current,
                required,
            },
            other => EngineError::execution("durable store", other),
        }
    }
}

impl From<KvError> for EngineError {
    fn from(err: KvError) -> Self {
        EngineError::execution("distributed kv", err)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Run an outbound call under an explicit timeout.
///
/// A timeout is an unknown outcome: nothing is persisted by the caller, and the
/// lock/claim release on the way out makes the position re-evaluable next tick.
pub async fn with_timeout<T, F>(operation: &'static str, after: Duration, fut: F) -> EngineResult<T>
where
    F: std::future::Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(EngineError::execution(operation, e)),
        Err(_) => Err(EngineError::Timeout { operation, after }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(
            EngineError::PositionLocked(Uuid::nil()).code().as_str(),
            "POSITION_LOCKED"
        );
        assert_eq!(
            EngineError::PriceImpactTooHigh {
                impact: dec!(12),
                max: dec!(10)
            }
            .code(),
            ErrorCode::PriceImpactTooHigh
        );
        assert_eq!(
            EngineError::PositionNotFound(Uuid::nil()).code(),
            ErrorCode::Validation
        );
    }

    #[test]
    fn test_store_balance_error_keeps_payload() {
        let err: EngineError = StoreError::InsufficientBalance {
            wallet: "w".to_string(),
            token: "sol".to_string(),
            current: dec!(1),
            required: dec!(2),
        }
        .into();

        match err {
            EngineError::InsufficientBalance { current, required, .. } => {
                assert_eq!(current, dec!(1));
                assert_eq!(required, dec!(2));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_expected_errors() {
        assert!(EngineError::AlreadyInProgress("k".into()).is_expected());
        assert!(!EngineError::Validation("bad".into()).is_expected());
    }

    #[tokio::test]
    async fn test_with_timeout_elapsed() {
        let result: EngineResult<()> = with_timeout("quote", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;

        assert_eq!(result.unwrap_err().code(), ErrorCode::ExternalTimeout);
    }
}
