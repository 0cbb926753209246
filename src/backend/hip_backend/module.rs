//! HIP module wrapper

use std::path::Path;
use std::sync::Arc;

use crate::backend::hip_backend::driver::HipDriver;
use crate::backend::hip_backend::error::{HipError, HipResult};
use crate::backend::hip_backend::ffi::{DevicePtr, HipFunctionHandle, HipModuleHandle};

/// Loaded code object; unloaded on drop
///
/// Must be dropped while the owning device's context is current.
#[derive(Debug)]
pub struct HipModule {
    driver: Arc<dyn HipDriver>,
    handle: HipModuleHandle,
}

impl HipModule {
    /// Load HIP module from an in-memory code object
    pub fn load_from_data(driver: Arc<dyn HipDriver>, image: &[u8]) -> HipResult<Self> {
        let handle = driver
            .module_load_data(image)
            .map_err(|code| HipError::driver("hipModuleLoadData", code, concat!(file!(), ":", line!())))?;
        tracing::debug!("HipModule::load_from_data: loaded {} byte image", image.len());
        Ok(HipModule { driver, handle })
    }

    /// Load HIP module from a fatbin file
    pub fn load_from_path(driver: Arc<dyn HipDriver>, path: &Path) -> HipResult<Self> {
        let image = std::fs::read(path).map_err(|e| {
            HipError::KernelLoadFailed(format!("Failed to read '{}': {}", path.display(), e))
        })?;
        Self::load_from_data(driver, &image).map_err(|e| {
            HipError::KernelLoadFailed(format!(
                "Failed to load HIP kernel from '{}' ({})",
                path.display(),
                e
            ))
        })
    }

    pub fn handle(&self) -> HipModuleHandle {
        self.handle
    }

    /// Get kernel function from module
    pub fn function(&self, name: &str) -> HipResult<HipFunctionHandle> {
        self.driver
            .module_get_function(self.handle, name)
            .map_err(|code| HipError::driver("hipModuleGetFunction", code, concat!(file!(), ":", line!())))
    }

    /// Address and size of a module-scope variable
    pub fn global(&self, name: &str) -> HipResult<(DevicePtr, usize)> {
        self.driver
            .module_get_global(self.handle, name)
            .map_err(|code| HipError::driver("hipModuleGetGlobal", code, concat!(file!(), ":", line!())))
    }
}

impl Drop for HipModule {
    fn drop(&mut self) {
        if self.handle.is_null() {
            return;
        }
        if let Err(code) = self.driver.module_unload(self.handle) {
            tracing::warn!("HipModule::drop: hipModuleUnload failed: {}", self.driver.error_name(code));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::hip_backend::ffi::HipDeviceHandle;
    use crate::backend::hip_backend::mock::MockDriver;

    #[test]
    fn test_module_unloaded_on_drop() {
        let mock = Arc::new(MockDriver::new());
        mock.ctx_create(0, HipDeviceHandle(0)).unwrap();
        let driver: Arc<dyn HipDriver> = mock.clone();

        let module = HipModule::load_from_data(driver, b"kernel_gpu_prefix_sum\n").unwrap();
        assert!(module.function("kernel_gpu_prefix_sum").is_ok());
        assert_eq!(mock.loaded_modules(), 1);
        drop(module);
        assert_eq!(mock.loaded_modules(), 0);
    }

    #[test]
    fn test_load_from_path_reports_file() {
        let mock = Arc::new(MockDriver::new());
        mock.ctx_create(0, HipDeviceHandle(0)).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("missing.fatbin");
        let err = HipModule::load_from_path(mock.clone(), &missing).unwrap_err();
        assert!(err.to_string().contains("missing.fatbin"));

        let bad = dir.path().join("bad.fatbin");
        std::fs::write(&bad, b"\xff\xff").unwrap();
        match HipModule::load_from_path(mock.clone(), &bad).unwrap_err() {
            HipError::KernelLoadFailed(msg) => assert!(msg.contains("hipErrorInvalidImage")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(mock.loaded_modules(), 0);
    }
}
