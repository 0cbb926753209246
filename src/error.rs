//! Unified error handling for rocm-device
//!
//! Module errors ([`HipError`], [`HipewError`], [`ConfigError`],
//! [`LoggingError`]) convert into [`RocmDeviceError`], which sorts them into
//! an [`ErrorCategory`]:
//! - Loader: the HIP driver library could not be used at all
//! - Device: a device operation failed
//! - User: invalid configuration or arguments
//! - Internal: bugs and system failures

use std::fmt;

use crate::backend::hip_backend::error::HipError;
use crate::backend::hip_backend::ffi;
use crate::backend::hip_backend::hipew::HipewError;
use crate::config::ConfigError;
use crate::logging::LoggingError;

/// Unified error type for rocm-device
#[derive(Debug, thiserror::Error)]
pub enum RocmDeviceError {
    #[error("HIP error: {0}")]
    Hip(#[from] HipError),

    #[error("HIP driver unavailable: {0}")]
    Loader(#[from] HipewError),

    #[error("No HIP device with ordinal {0}")]
    DeviceNotFound(i32),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Logging setup failed: {0}")]
    Logging(#[from] LoggingError),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The driver library is missing, incomplete or too old
    Loader,
    /// A device operation failed
    Device,
    /// Invalid input or configuration
    User,
    /// Indicates a bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Loader => write!(f, "Loader"),
            ErrorCategory::Device => write!(f, "Device"),
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

/// Driver codes after which the device cannot be used again
const DEVICE_LOST_CODES: &[ffi::hipError_t] = &[
    ffi::hipErrorNoDevice,
    ffi::hipErrorInvalidDevice,
    ffi::hipErrorDeinitialized,
    ffi::hipErrorContextIsDestroyed,
    ffi::hipErrorIllegalAddress,
];

impl RocmDeviceError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RocmDeviceError::Loader(_) | RocmDeviceError::Hip(HipError::Loader(_)) => {
                ErrorCategory::Loader
            }

            RocmDeviceError::Hip(HipError::InvalidArgument(_))
            | RocmDeviceError::DeviceNotFound(_)
            | RocmDeviceError::Config(_)
            | RocmDeviceError::Logging(_) => ErrorCategory::User,

            RocmDeviceError::Hip(HipError::LockPoisoned(_))
            | RocmDeviceError::InternalError(_)
            | RocmDeviceError::LockPoisoned(_)
            | RocmDeviceError::IoError(_) => ErrorCategory::Internal,

            RocmDeviceError::Hip(_) => ErrorCategory::Device,
        }
    }

    /// The device (or the whole HIP runtime) is unusable after this error
    pub fn is_fatal(&self) -> bool {
        match self {
            RocmDeviceError::Hip(HipError::DeviceNotSupported(_)) => true,
            RocmDeviceError::Hip(err) => err
                .code()
                .map_or(false, |code| DEVICE_LOST_CODES.contains(&code)),
            _ => matches!(
                self.category(),
                ErrorCategory::Loader | ErrorCategory::Internal
            ),
        }
    }

    /// Check if this error is recoverable (temporary condition)
    ///
    /// Out-of-memory and launch failures may succeed after the device error
    /// is cleared and work is retried.
    pub fn is_recoverable(&self) -> bool {
        match self {
            RocmDeviceError::Hip(err) => err.is_recoverable() && !self.is_fatal(),
            _ => false,
        }
    }

    pub fn is_user_error(&self) -> bool {
        self.category() == ErrorCategory::User
    }
}

impl<T> From<std::sync::PoisonError<T>> for RocmDeviceError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        RocmDeviceError::LockPoisoned(err.to_string())
    }
}

/// Result type using [`RocmDeviceError`]
pub type DeviceResult<T> = std::result::Result<T, RocmDeviceError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn driver_error(code: ffi::hipError_t) -> RocmDeviceError {
        HipError::driver("hipMalloc", code, "test").into()
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            RocmDeviceError::from(HipewError::OpenFailed { tried: vec![] }).category(),
            ErrorCategory::Loader
        );
        assert_eq!(
            RocmDeviceError::from(HipError::Loader(HipewError::InitFailed { code: 100 })).category(),
            ErrorCategory::Loader
        );
        assert_eq!(driver_error(ffi::hipErrorOutOfMemory).category(), ErrorCategory::Device);
        assert_eq!(
            RocmDeviceError::from(HipError::InvalidArgument("x".into())).category(),
            ErrorCategory::User
        );
        assert_eq!(RocmDeviceError::DeviceNotFound(4).category(), ErrorCategory::User);
        assert_eq!(
            RocmDeviceError::InternalError("x".into()).category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_fatal_and_recoverable() {
        assert!(RocmDeviceError::from(HipewError::OpenFailed { tried: vec![] }).is_fatal());
        assert!(driver_error(ffi::hipErrorIllegalAddress).is_fatal());
        assert!(driver_error(ffi::hipErrorNoDevice).is_fatal());
        assert!(RocmDeviceError::from(HipError::DeviceNotSupported("gfx803".into())).is_fatal());

        assert!(!driver_error(ffi::hipErrorOutOfMemory).is_fatal());
        assert!(driver_error(ffi::hipErrorOutOfMemory).is_recoverable());
        assert!(driver_error(ffi::hipErrorLaunchFailure).is_recoverable());
        assert!(!driver_error(ffi::hipErrorInvalidValue).is_recoverable());
        assert!(!RocmDeviceError::DeviceNotFound(1).is_recoverable());
    }

    #[test]
    fn test_conversions() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RocmDeviceError = io_err.into();
        assert!(matches!(err, RocmDeviceError::IoError(_)));

        let err: RocmDeviceError = ConfigError::InvalidBool {
            var: "ROCDEV_BACKGROUND".into(),
            value: "maybe".into(),
        }
        .into();
        assert!(err.is_user_error());
        assert!(err.to_string().contains("ROCDEV_BACKGROUND"));
    }

    #[test]
    fn test_error_category_display() {
        assert_eq!(ErrorCategory::Loader.to_string(), "Loader");
        assert_eq!(ErrorCategory::Device.to_string(), "Device");
        assert_eq!(ErrorCategory::User.to_string(), "User");
        assert_eq!(ErrorCategory::Internal.to_string(), "Internal");
    }
}
