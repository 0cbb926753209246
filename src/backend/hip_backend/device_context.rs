//! Scoped activation of a device's driver context
//!
//! HIP driver contexts are current PER-THREAD. Every device operation runs
//! between a push of the device context and the matching pop, so the caller's
//! context is restored no matter how the operation ends.

use crate::backend::hip_backend::backend::HipDevice;
use crate::backend::hip_backend::error::{HipError, HipResult};

/// Makes a device's context current for the lifetime of the guard
///
/// A failed push is recorded on the device's error state rather than
/// returned, and the guard then skips the pop in `Drop`, so it never removes
/// a context it did not push. Not `Clone`: one push, one pop.
///
/// # Example
///
/// ```ignore
/// let scope = HipContextScope::new(&device);
/// scope.check()?;
/// // driver calls here run against `device`'s context
/// ```
#[must_use = "the context is popped again as soon as the scope is dropped"]
#[derive(Debug)]
pub struct HipContextScope<'a> {
    device: &'a HipDevice,
    pushed: bool,
}

impl<'a> HipContextScope<'a> {
    pub fn new(device: &'a HipDevice) -> Self {
        let pushed = match device.driver().ctx_push_current(device.context_handle()) {
            Ok(()) => true,
            Err(code) => {
                device.errors().record(&HipError::driver(
                    "hipCtxPushCurrent",
                    code,
                    concat!(file!(), ":", line!()),
                ));
                false
            }
        };
        tracing::trace!("HipContextScope::new: device {} pushed={}", device.ordinal(), pushed);
        HipContextScope { device, pushed }
    }

    /// Whether the device context was made current
    pub fn is_active(&self) -> bool {
        self.pushed
    }

    /// Fail when the push did not happen, carrying the recorded error
    pub fn check(&self) -> HipResult<()> {
        if self.pushed {
            Ok(())
        } else {
            Err(HipError::PendingError(
                self.device
                    .error_message()
                    .unwrap_or_else(|| "device context could not be made current".to_string()),
            ))
        }
    }
}

impl Drop for HipContextScope<'_> {
    fn drop(&mut self) {
        if !self.pushed {
            return;
        }
        if let Err(code) = self.device.driver().ctx_pop_current() {
            self.device.errors().record(&HipError::driver(
                "hipCtxPopCurrent",
                code,
                concat!(file!(), ":", line!()),
            ));
        }
    }
}
