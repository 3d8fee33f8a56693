//! Classification of operation failures as permanent or transient.
//!
//! The coordinator caches permanent failures and replays them; transient
//! failures release the claim so a later call runs the operation again.
//! Types that implement [`Recoverable`] without overriding
//! [`Recoverable::recovery`] report [`RecoveryKind::Unknown`], which the
//! coordinator treats as transient.

use serde::{Deserialize, Serialize};

/// Kind of recovery that may help after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryKind {
    /// Not classified.
    Unknown,
    /// Temporary; a retry may succeed.
    Retry,
    /// Permanent; a retry yields the same failure.
    Never,
}

/// Capability to classify an error for the coordinator.
///
/// ```
/// use idempotency_engine::idempotency::{Recoverable, RecoveryKind};
///
/// enum ChargeError {
///     CardDeclined,
///     GatewayTimeout,
/// }
///
/// impl Recoverable for ChargeError {
///     fn recovery(&self) -> RecoveryKind {
///         match self {
///             ChargeError::CardDeclined => RecoveryKind::Never,
///             ChargeError::GatewayTimeout => RecoveryKind::Retry,
///         }
///     }
/// }
///
/// assert!(!ChargeError::CardDeclined.is_retryable());
/// assert!(ChargeError::GatewayTimeout.is_retryable());
/// ```
pub trait Recoverable {
    fn recovery(&self) -> RecoveryKind {
        RecoveryKind::Unknown
    }

    /// Unknown classifications count as retryable.
    fn is_retryable(&self) -> bool {
        !matches!(self.recovery(), RecoveryKind::Never)
    }
}

impl Recoverable for crate::error::AppError {
    fn recovery(&self) -> RecoveryKind {
        use crate::error::AppError;
        match self {
            AppError::Validation(_) | AppError::NotFound(_) | AppError::Codec(_) => RecoveryKind::Never,
            AppError::Database(_) | AppError::Http(_) => RecoveryKind::Retry,
            _ => RecoveryKind::Unknown,
        }
    }
}
