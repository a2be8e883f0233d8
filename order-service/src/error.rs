use bigdecimal::BigDecimal;
use shared::OrderStatus;
use thiserror::Error;
use uuid::Uuid;

/// Domain errors are returned to the caller as-is and never retried.
/// Storage errors are retried at the persistence boundary before surfacing.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: Uuid,
        requested: i32,
        available: i32,
    },

    #[error("order total {total} exceeds available credit {available}")]
    CreditExceeded {
        total: BigDecimal,
        available: BigDecimal,
    },

    #[error("illegal transition from {current} to {requested}")]
    StateConflict {
        current: OrderStatus,
        requested: String,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("a request with this idempotency key is already in flight")]
    RequestInFlight,

    #[error(transparent)]
    Storage(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Lock timeouts, serialization failures, deadlocks and dropped connections
/// are worth another attempt; everything else is not.
pub fn is_transient(err: &AppError) -> bool {
    use diesel::result::DatabaseErrorKind;
    use diesel::result::Error as DieselError;
    use diesel::result::DatabaseErrorInformation;

    match err {
        AppError::Pool(_) => true,
        AppError::Storage(DieselError::DatabaseError(kind, info)) => match kind {
            DatabaseErrorKind::SerializationFailure | DatabaseErrorKind::ClosedConnection => true,
            _ => info.message().contains("deadlock detected"),
        },
        AppError::Storage(DieselError::BrokenTransactionManager) => true,
        _ => false,
    }
}

pub fn backoff_delay(attempt: u32) -> std::time::Duration {
    let millis = 50u64.saturating_mul(1u64 << attempt.min(6));
    std::time::Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_are_not_retried() {
        assert!(!is_transient(&AppError::Validation("empty".into())));
        assert!(!is_transient(&AppError::InsufficientStock {
            product_id: Uuid::new_v4(),
            requested: 5,
            available: 2,
        }));
        assert!(!is_transient(&AppError::RequestInFlight));
    }

    #[test]
    fn pool_and_broken_transaction_errors_are_transient() {
        assert!(is_transient(&AppError::Pool("timed out".into())));
        assert!(is_transient(&AppError::Storage(
            diesel::result::Error::BrokenTransactionManager
        )));
    }

    #[test]
    fn not_found_storage_error_is_not_transient() {
        assert!(!is_transient(&AppError::Storage(
            diesel::result::Error::NotFound
        )));
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert!(backoff_delay(1) < backoff_delay(2));
        assert!(backoff_delay(2) < backoff_delay(4));
        assert_eq!(backoff_delay(6), backoff_delay(20));
    }
}
