//! HIP event wrapper for kernel timing

use std::sync::Arc;

use crate::backend::hip_backend::driver::HipDriver;
use crate::backend::hip_backend::error::{HipError, HipResult};
use crate::backend::hip_backend::ffi::{self, HipEventHandle};
use crate::backend::hip_backend::stream::HipStream;

/// Owned HIP event; destroyed on drop
#[derive(Debug)]
pub struct HipEvent {
    driver: Arc<dyn HipDriver>,
    handle: HipEventHandle,
}

impl HipEvent {
    /// Event with timing enabled
    pub fn new(driver: Arc<dyn HipDriver>) -> HipResult<Self> {
        Self::with_flags(driver, ffi::hipEventDefault)
    }

    /// Use `hipEventDisableTiming` for events that only order work.
    pub fn with_flags(driver: Arc<dyn HipDriver>, flags: u32) -> HipResult<Self> {
        let handle = driver.event_create(flags).map_err(|code| {
            HipError::driver("hipEventCreateWithFlags", code, concat!(file!(), ":", line!()))
        })?;
        Ok(HipEvent { driver, handle })
    }

    pub fn handle(&self) -> HipEventHandle {
        self.handle
    }

    /// Record the event at the current end of `stream`
    pub fn record(&self, stream: &HipStream) -> HipResult<()> {
        self.driver
            .event_record(self.handle, stream.handle())
            .map_err(|code| HipError::driver("hipEventRecord", code, concat!(file!(), ":", line!())))
    }

    pub fn synchronize(&self) -> HipResult<()> {
        self.driver
            .event_synchronize(self.handle)
            .map_err(|code| HipError::driver("hipEventSynchronize", code, concat!(file!(), ":", line!())))
    }

    /// Milliseconds between `start` and this event; both must have completed
    pub fn elapsed_since(&self, start: &HipEvent) -> HipResult<f32> {
        self.driver
            .event_elapsed_time(start.handle, self.handle)
            .map_err(|code| HipError::driver("hipEventElapsedTime", code, concat!(file!(), ":", line!())))
    }
}

impl Drop for HipEvent {
    fn drop(&mut self) {
        if let Err(code) = self.driver.event_destroy(self.handle) {
            tracing::warn!(
                "HipEvent::drop: hipEventDestroy failed: {}",
                self.driver.error_name(code)
            );
        }
    }
}
