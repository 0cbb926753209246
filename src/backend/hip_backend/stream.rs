//! HIP stream wrapper

use std::sync::Arc;

use crate::backend::hip_backend::driver::HipDriver;
use crate::backend::hip_backend::error::{HipError, HipResult};
use crate::backend::hip_backend::ffi::HipStreamHandle;

/// Owned HIP stream; destroyed on drop
///
/// Create and drop it while its context is current. Not `Clone`: two owners
/// would destroy the stream twice.
#[derive(Debug)]
pub struct HipStream {
    driver: Arc<dyn HipDriver>,
    handle: HipStreamHandle,
}

impl HipStream {
    /// Create a stream with `flags` (`hipStreamDefault`, `hipStreamNonBlocking`)
    pub fn new(driver: Arc<dyn HipDriver>, flags: u32) -> HipResult<Self> {
        let handle = driver.stream_create(flags).map_err(|code| {
            HipError::driver("hipStreamCreateWithFlags", code, concat!(file!(), ":", line!()))
        })?;
        if handle.is_null() {
            return Err(HipError::InvalidArgument(
                "hipStreamCreateWithFlags returned null stream".to_string(),
            ));
        }
        tracing::debug!("HipStream::new: created stream {:?}", handle);
        Ok(HipStream { driver, handle })
    }

    pub fn handle(&self) -> HipStreamHandle {
        self.handle
    }

    /// Block until all work queued on the stream has completed
    pub fn synchronize(&self) -> HipResult<()> {
        self.driver
            .stream_synchronize(self.handle)
            .map_err(|code| HipError::driver("hipStreamSynchronize", code, concat!(file!(), ":", line!())))
    }

    /// True when all queued work has completed
    pub fn is_idle(&self) -> HipResult<bool> {
        self.driver
            .stream_query(self.handle)
            .map_err(|code| HipError::driver("hipStreamQuery", code, concat!(file!(), ":", line!())))
    }
}

impl Drop for HipStream {
    fn drop(&mut self) {
        if let Err(code) = self.driver.stream_destroy(self.handle) {
            tracing::warn!(
                "HipStream::drop: hipStreamDestroy failed: {}",
                self.driver.error_name(code)
            );
        }
    }
}
