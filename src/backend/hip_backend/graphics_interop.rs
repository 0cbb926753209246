//! OpenGL pixel buffer interop for display drivers
//!
//! A display driver owns an OpenGL pixel buffer object; the renderer writes
//! half-float RGBA pixels into it through HIP. The buffer cycles through
//! `unregistered -> registered -> mapped -> registered` for every update.

use crate::backend::hip_backend::backend::HipDevice;
use crate::backend::hip_backend::device_context::HipContextScope;
use crate::backend::hip_backend::error::{hip_check, HipError, HipResult};
use crate::backend::hip_backend::ffi::{self, DevicePtr, HipGraphicsResource};
use crate::backend::hip_backend::queue::HipDeviceQueue;

/// Bytes per pixel of the display buffer (half4)
const DISPLAY_PIXEL_SIZE: usize = 8;

/// Display buffer handed over by the display driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayInterop {
    pub opengl_pbo_id: u32,
    pub buffer_width: u32,
    pub buffer_height: u32,
    /// Zero the buffer on the next map
    pub need_clear: bool,
}

impl DisplayInterop {
    pub fn buffer_area(&self) -> usize {
        self.buffer_width as usize * self.buffer_height as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteropState {
    Unregistered,
    Registered,
    Mapped,
}

/// A display buffer registered with HIP, bound to one queue's stream
///
/// Borrowing the queue keeps the stream alive for as long as the resource
/// can be mapped on it.
#[derive(Debug)]
pub struct HipDeviceGraphicsInterop<'q> {
    queue: &'q HipDeviceQueue,
    resource: Option<HipGraphicsResource>,
    mapped: bool,
    opengl_pbo_id: u32,
    buffer_area: usize,
    need_clear: bool,
}

impl<'q> HipDeviceGraphicsInterop<'q> {
    pub(crate) fn new(queue: &'q HipDeviceQueue) -> Self {
        HipDeviceGraphicsInterop {
            queue,
            resource: None,
            mapped: false,
            opengl_pbo_id: 0,
            buffer_area: 0,
            need_clear: false,
        }
    }

    fn device(&self) -> &'q HipDevice {
        self.queue.device()
    }

    pub fn state(&self) -> InteropState {
        match (self.resource, self.mapped) {
            (None, _) => InteropState::Unregistered,
            (Some(_), false) => InteropState::Registered,
            (Some(_), true) => InteropState::Mapped,
        }
    }

    /// Point the interop at the display driver's current buffer.
    ///
    /// Re-registers only when the buffer object or its area changed. When
    /// the old registration cannot be released it is kept, so a later call
    /// or drop can release it.
    pub fn set_display_interop(&mut self, buffer: &DisplayInterop) -> HipResult<()> {
        if self.mapped {
            return Err(HipError::InteropState(
                "cannot change the display buffer while it is mapped".to_string(),
            ));
        }

        let new_area = buffer.buffer_area();
        self.need_clear = buffer.need_clear;
        if self.resource.is_some()
            && self.opengl_pbo_id == buffer.opengl_pbo_id
            && self.buffer_area == new_area
        {
            return Ok(());
        }

        let device = self.device();
        let scope = HipContextScope::new(device);
        scope.check()?;

        if let Some(resource) = self.resource {
            hip_check!(
                device.errors(),
                "hipGraphicsUnregisterResource",
                device.driver().graphics_unregister_resource(resource)
            );
            self.resource = None;
            self.opengl_pbo_id = 0;
            self.buffer_area = 0;
        }

        let resource = hip_check!(
            device.errors(),
            "hipGraphicsGLRegisterBuffer",
            device
                .driver()
                .graphics_gl_register_buffer(buffer.opengl_pbo_id, ffi::hipGraphicsRegisterFlagsNone)
        );
        let (pbo, width, height) = (buffer.opengl_pbo_id, buffer.buffer_width, buffer.buffer_height);
        tracing::debug!(
            "HipDeviceGraphicsInterop: registered pbo {} ({}x{})",
            pbo,
            width,
            height
        );
        self.resource = Some(resource);
        self.opengl_pbo_id = pbo;
        self.buffer_area = new_area;
        Ok(())
    }

    /// Map the buffer on the queue's stream and return its device address
    pub fn map(&mut self) -> HipResult<DevicePtr> {
        let resource = match (self.resource, self.mapped) {
            (None, _) => {
                return Err(HipError::InteropState(
                    "no display buffer is registered".to_string(),
                ))
            }
            (Some(_), true) => {
                return Err(HipError::InteropState(
                    "display buffer is already mapped".to_string(),
                ))
            }
            (Some(resource), false) => resource,
        };

        let device = self.device();
        let stream = self.queue.stream().handle();
        let scope = HipContextScope::new(device);
        scope.check()?;

        hip_check!(
            device.errors(),
            "hipGraphicsMapResources",
            device.driver().graphics_map_resource(resource, stream)
        );
        self.mapped = true;

        let (ptr, bytes) = hip_check!(
            device.errors(),
            "hipGraphicsResourceGetMappedPointer",
            device.driver().graphics_mapped_pointer(resource)
        );

        if self.need_clear {
            let clear = (self.buffer_area * DISPLAY_PIXEL_SIZE).min(bytes);
            hip_check!(
                device.errors(),
                "hipMemsetD8Async",
                device.driver().memset_d8_async(ptr, 0, clear, stream)
            );
            self.need_clear = false;
        }
        Ok(ptr)
    }

    /// Hand the buffer back to OpenGL
    pub fn unmap(&mut self) -> HipResult<()> {
        let resource = match (self.resource, self.mapped) {
            (Some(resource), true) => resource,
            _ => {
                return Err(HipError::InteropState(
                    "display buffer is not mapped".to_string(),
                ))
            }
        };

        let device = self.device();
        let scope = HipContextScope::new(device);
        scope.check()?;
        hip_check!(
            device.errors(),
            "hipGraphicsUnmapResources",
            device
                .driver()
                .graphics_unmap_resource(resource, self.queue.stream().handle())
        );
        self.mapped = false;
        Ok(())
    }
}

impl Drop for HipDeviceGraphicsInterop<'_> {
    fn drop(&mut self) {
        let resource = match self.resource.take() {
            Some(resource) => resource,
            None => return,
        };
        let device = self.device();
        let _scope = HipContextScope::new(device);
        let driver = device.driver();

        if self.mapped {
            if let Err(code) = driver.graphics_unmap_resource(resource, self.queue.stream().handle()) {
                tracing::warn!(
                    "HipDeviceGraphicsInterop::drop: unmap failed: {}",
                    driver.error_name(code)
                );
            }
        }
        if let Err(code) = driver.graphics_unregister_resource(resource) {
            tracing::warn!(
                "HipDeviceGraphicsInterop::drop: unregister failed: {}",
                driver.error_name(code)
            );
        }
    }
}
