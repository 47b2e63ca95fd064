//! Unified error type for access arbitration.
//!
//! Driver-level failures have their own taxonomy in [`crate::driver`] and
//! are wrapped transparently here, so a controller's I/O call surfaces the
//! driver error unchanged.

use thiserror::Error;

use crate::controller::ControllerId;
use crate::driver::DriverError;

/// A specialized `Result` type for arbitration and controller operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by role changes, access calls and delegate registration.
#[derive(Debug, Error)]
pub enum Error {
    /// An access call or transition utility was invoked by a controller that
    /// is not the active controller.
    #[error("{controller} must be active to call {operation}")]
    NotActiveController {
        /// Description of the offending controller.
        controller: String,
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// A controller vetoed a transition from `will_make_inactive` or
    /// `will_remove`. The transition was cancelled and no state changed.
    #[error("{controller} refuses the transition: {reason}")]
    Refused {
        /// Identity of the refusing controller.
        refusing: ControllerId,
        /// Description of the refusing controller.
        controller: String,
        /// Why the controller refused.
        reason: String,
    },

    /// Bad delegate registration or malformed device name.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A programmer error: a transition utility used off the transition
    /// thread, a broken `will_make_inactive` contract, or removing a
    /// delegate that is still referenced by its delegating controller.
    #[error("logic error: {0}")]
    Logic(String),

    /// A failure from the underlying serial driver, propagated unchanged.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl Error {
    /// Create a `NotActiveController` error for the given controller
    /// description and operation name.
    pub(crate) fn not_active(controller: impl Into<String>, operation: &'static str) -> Self {
        Self::NotActiveController {
            controller: controller.into(),
            operation,
        }
    }

    /// Create a `Refused` error naming the refusing controller.
    pub fn refused(
        refusing: ControllerId,
        controller: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Refused {
            refusing,
            controller: controller.into(),
            reason: reason.into(),
        }
    }

    /// Create an `InvalidArgument` error from a message.
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create a `Logic` error from a message.
    pub(crate) fn logic(message: impl Into<String>) -> Self {
        Self::Logic(message.into())
    }

    /// The id of the controller that refused the transition, if this error
    /// is a refusal.
    pub fn refusing_controller(&self) -> Option<ControllerId> {
        match self {
            Self::Refused { refusing, .. } => Some(*refusing),
            _ => None,
        }
    }
}
