//! HIP error types and the device's sticky error state

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use thiserror::Error;

use crate::backend::hip_backend::ffi::{self, hipError_t};
use crate::backend::hip_backend::hipew::{self, HipewError};

/// HIP error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HipError {
    /// A driver entry point returned a non-success status
    #[error("{call} failed: {name} ({code}) at {location}")]
    Driver {
        call: &'static str,
        code: hipError_t,
        name: String,
        location: &'static str,
    },
    #[error("HIP driver unavailable: {0}")]
    Loader(#[from] HipewError),
    #[error("{0}")]
    DeviceNotSupported(String),
    #[error("{0}")]
    OutOfMemory(String),
    #[error("Kernel compilation failed: {0}")]
    KernelCompileFailed(String),
    #[error("Kernel loading failed: {0}")]
    KernelLoadFailed(String),
    #[error("Kernel not available: {0}")]
    KernelUnavailable(String),
    #[error("Graphics interop misuse: {0}")]
    InteropState(String),
    /// The device already carries an error; work is refused until it is cleared
    #[error("Device has a pending error: {0}")]
    PendingError(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Internal lock poisoned - this indicates a bug: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for HipError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        HipError::LockPoisoned(format!("Lock poisoned: {}", err))
    }
}

/// HIP result type
pub type HipResult<T> = Result<T, HipError>;

impl HipError {
    pub fn driver(call: &'static str, code: hipError_t, location: &'static str) -> Self {
        HipError::Driver {
            call,
            code,
            name: hipew::error_string(code).to_string(),
            location,
        }
    }

    /// Raw driver status, if this error came from the driver
    pub fn code(&self) -> Option<hipError_t> {
        match self {
            HipError::Driver { code, .. } => Some(*code),
            HipError::Loader(HipewError::InitFailed { code }) => Some(*code),
            _ => None,
        }
    }

    /// Check if this error is recoverable (temporary condition)
    ///
    /// Out-of-memory, launch failures and a pending device error (after
    /// `clear_error`) can be retried. Loader failures, lost devices and
    /// invalid handles cannot.
    pub fn is_recoverable(&self) -> bool {
        match self {
            HipError::Driver { code, .. } => matches!(
                *code,
                ffi::hipErrorOutOfMemory
                    | ffi::hipErrorNotReady
                    | ffi::hipErrorLaunchOutOfResources
                    | ffi::hipErrorLaunchTimeOut
                    | ffi::hipErrorLaunchFailure
            ),
            HipError::OutOfMemory(_)
            | HipError::PendingError(_)
            | HipError::InteropState(_)
            | HipError::KernelUnavailable(_) => true,
            _ => false,
        }
    }

    /// Check if this error is permanent (should never retry)
    pub fn is_permanent(&self) -> bool {
        !self.is_recoverable()
    }
}

/// Records an error with location and returns it from the enclosing function.
///
/// `hip_check!(errors, "hipMalloc", driver.mem_alloc(size))` evaluates to the
/// `Ok` value, or converts the raw status into [`HipError::Driver`], records
/// it on `errors` (an [`ErrorState`]) and returns `Err`.
macro_rules! hip_check {
    ($errors:expr, $call:literal, $result:expr) => {
        match $result {
            Ok(value) => value,
            Err(code) => {
                let err = $crate::backend::hip_backend::error::HipError::driver(
                    $call,
                    code,
                    concat!(file!(), ":", line!()),
                );
                $errors.record(&err);
                return Err(err.into());
            }
        }
    };
}
pub(crate) use hip_check;

/// Sticky, first-error-wins error slot of a device
///
/// The first recorded message is kept until [`ErrorState::clear`]; later
/// errors are logged but do not overwrite it.
#[derive(Debug, Default)]
pub struct ErrorState {
    message: Mutex<Option<String>>,
    hint_shown: AtomicBool,
}

impl ErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `message`. Returns true when it became the sticky error.
    pub fn set(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        let mut slot = self.message.lock().unwrap_or_else(|e| e.into_inner());

        if slot.is_some() {
            tracing::error!("{}", message);
            return false;
        }

        tracing::error!("{}", message);
        if !self.hint_shown.swap(true, Ordering::Relaxed) {
            tracing::error!(
                "Refer to the GPU rendering troubleshooting notes for your HIP driver \
                 and graphics card for possible solutions"
            );
        }
        *slot = Some(message);
        true
    }

    pub fn record(&self, err: &HipError) -> bool {
        self.set(err.to_string())
    }

    pub fn have_error(&self) -> bool {
        self.message
            .lock()
            .map(|m| m.is_some())
            .unwrap_or(true)
    }

    pub fn message(&self) -> Option<String> {
        self.message
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        *self.message.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Fail with [`HipError::PendingError`] while an error is recorded
    pub fn ensure_clear(&self) -> HipResult<()> {
        match self.message() {
            Some(message) => Err(HipError::PendingError(message)),
            None => Ok(()),
        }
    }
}
