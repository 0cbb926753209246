//! Device configuration
//!
//! [`DeviceConfig`] controls kernel lookup and compilation, memory placement
//! and launch diagnostics. Defaults suit interactive rendering; every field
//! can be overridden from `ROCDEV_*` environment variables with
//! [`DeviceConfig::from_env`].

use std::path::PathBuf;

use thiserror::Error;

/// Minimum free device memory kept for working buffers
pub const DEFAULT_WORKING_HEADROOM: usize = 32 * 1024 * 1024;

/// Minimum free device memory kept when placing textures
pub const DEFAULT_TEXTURE_HEADROOM: usize = 128 * 1024 * 1024;

const ENV_ADAPTIVE_COMPILE: &str = "ROCDEV_HIP_ADAPTIVE_COMPILE";
const ENV_KERNEL_DIR: &str = "ROCDEV_KERNEL_DIR";
const ENV_KERNEL_SOURCE_DIR: &str = "ROCDEV_KERNEL_SOURCE_DIR";
const ENV_CACHE_DIR: &str = "ROCDEV_CACHE_DIR";
const ENV_EXTRA_CFLAGS: &str = "ROCDEV_HIP_EXTRA_CFLAGS";
const ENV_DEBUG_SYNC_LAUNCH: &str = "ROCDEV_DEBUG_SYNC_LAUNCH";
const ENV_PROFILE_KERNELS: &str = "ROCDEV_PROFILE_KERNELS";
const ENV_BACKGROUND: &str = "ROCDEV_BACKGROUND";
const ENV_MAP_HOST_LIMIT: &str = "ROCDEV_MAP_HOST_LIMIT";
const ENV_CONCURRENT_STATES_FACTOR: &str = "ROCDEV_CONCURRENT_STATES_FACTOR";

/// Errors from reading configuration
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a valid boolean (expected 1/0, true/false, yes/no, on/off)")]
    InvalidBool { var: String, value: String },
    #[error("{var}={value:?} is not a valid number: {reason}")]
    InvalidNumber {
        var: String,
        value: String,
        reason: String,
    },
}

/// Configuration for a HIP device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    /// Compile kernels at runtime for the requested feature set instead of
    /// using precompiled binaries
    pub adaptive_compile: bool,

    /// Directory with precompiled `<name>_<arch>.fatbin` files
    pub kernel_dir: PathBuf,

    /// Kernel source tree used for runtime compilation
    pub kernel_source_dir: PathBuf,

    /// Root of the compiled-kernel cache (`<cache_dir>/kernels`)
    pub cache_dir: PathBuf,

    /// Appended to the hipcc command line
    pub extra_cflags: Option<String>,

    /// Compile kernels with `-D__KERNEL_DEBUG__`
    pub debug: bool,

    /// Synchronize after every kernel launch to pinpoint failures
    pub debug_sync_launch: bool,

    /// Time every kernel launch with events
    pub profile_kernels: bool,

    /// Headless render; disables graphics interop
    pub background: bool,

    pub working_headroom: usize,
    pub texture_headroom: usize,

    /// Allow falling back to mapped host memory when the device is full
    pub map_host_memory: bool,

    /// Override for the mapped host memory limit (bytes)
    pub map_host_limit: Option<usize>,

    /// Scales the number of concurrent integrator states
    pub concurrent_states_factor: f32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            adaptive_compile: false,
            kernel_dir: PathBuf::from("lib"),
            kernel_source_dir: PathBuf::from("source").join("kernel"),
            cache_dir: default_cache_dir(),
            extra_cflags: None,
            debug: cfg!(debug_assertions),
            debug_sync_launch: false,
            profile_kernels: false,
            background: false,
            working_headroom: DEFAULT_WORKING_HEADROOM,
            texture_headroom: DEFAULT_TEXTURE_HEADROOM,
            map_host_memory: true,
            map_host_limit: None,
            concurrent_states_factor: 1.0,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CACHE_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg).join("rocm-device");
    }
    if let Some(home) = std::env::var_os("HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home).join(".cache").join("rocm-device");
    }
    std::env::temp_dir().join("rocm-device")
}

impl DeviceConfig {
    /// Create a new device config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `ROCDEV_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (variable name -> value)
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(v) = lookup(ENV_ADAPTIVE_COMPILE) {
            self.adaptive_compile = parse_bool(ENV_ADAPTIVE_COMPILE, &v)?;
        }
        if let Some(v) = lookup(ENV_KERNEL_DIR).filter(|v| !v.is_empty()) {
            self.kernel_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_KERNEL_SOURCE_DIR).filter(|v| !v.is_empty()) {
            self.kernel_source_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_CACHE_DIR).filter(|v| !v.is_empty()) {
            self.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_EXTRA_CFLAGS) {
            self.extra_cflags = Some(v).filter(|v| !v.trim().is_empty());
        }
        if let Some(v) = lookup(ENV_DEBUG_SYNC_LAUNCH) {
            self.debug_sync_launch = parse_bool(ENV_DEBUG_SYNC_LAUNCH, &v)?;
        }
        if let Some(v) = lookup(ENV_PROFILE_KERNELS) {
            self.profile_kernels = parse_bool(ENV_PROFILE_KERNELS, &v)?;
        }
        if let Some(v) = lookup(ENV_BACKGROUND) {
            self.background = parse_bool(ENV_BACKGROUND, &v)?;
        }
        if let Some(v) = lookup(ENV_MAP_HOST_LIMIT) {
            let limit = v.trim().parse::<usize>().map_err(|e| ConfigError::InvalidNumber {
                var: ENV_MAP_HOST_LIMIT.to_string(),
                value: v.clone(),
                reason: e.to_string(),
            })?;
            self.map_host_limit = Some(limit);
        }
        if let Some(v) = lookup(ENV_CONCURRENT_STATES_FACTOR) {
            let invalid = |reason: String| ConfigError::InvalidNumber {
                var: ENV_CONCURRENT_STATES_FACTOR.to_string(),
                value: v.clone(),
                reason,
            };
            let factor = v.trim().parse::<f32>().map_err(|e| invalid(e.to_string()))?;
            if !factor.is_finite() || factor <= 0.0 {
                return Err(invalid("must be a positive number".to_string()));
            }
            self.concurrent_states_factor = factor;
        }
        Ok(self)
    }

    pub fn with_adaptive_compile(mut self, adaptive_compile: bool) -> Self {
        self.adaptive_compile = adaptive_compile;
        self
    }

    pub fn with_kernel_dir(mut self, kernel_dir: impl Into<PathBuf>) -> Self {
        self.kernel_dir = kernel_dir.into();
        self
    }

    pub fn with_kernel_source_dir(mut self, kernel_source_dir: impl Into<PathBuf>) -> Self {
        self.kernel_source_dir = kernel_source_dir.into();
        self
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    pub fn with_extra_cflags(mut self, cflags: impl Into<String>) -> Self {
        self.extra_cflags = Some(cflags.into());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_debug_sync_launch(mut self, debug_sync_launch: bool) -> Self {
        self.debug_sync_launch = debug_sync_launch;
        self
    }

    pub fn with_profile_kernels(mut self, profile_kernels: bool) -> Self {
        self.profile_kernels = profile_kernels;
        self
    }

    pub fn with_background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    pub fn with_headroom(mut self, working: usize, texture: usize) -> Self {
        self.working_headroom = working;
        self.texture_headroom = texture;
        self
    }

    pub fn with_map_host_memory(mut self, map_host_memory: bool) -> Self {
        self.map_host_memory = map_host_memory;
        self
    }

    pub fn with_map_host_limit(mut self, limit: usize) -> Self {
        self.map_host_limit = Some(limit);
        self
    }

    pub fn with_concurrent_states_factor(mut self, factor: f32) -> Self {
        self.concurrent_states_factor = factor;
        self
    }
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            var: var.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_device_config_default() {
        let config = DeviceConfig::default();
        assert!(!config.adaptive_compile);
        assert_eq!(config.working_headroom, 32 * 1024 * 1024);
        assert_eq!(config.texture_headroom, 128 * 1024 * 1024);
        assert!(config.map_host_memory);
        assert!(config.map_host_limit.is_none());
        assert_eq!(config.concurrent_states_factor, 1.0);
    }

    #[test]
    fn test_env_overrides() {
        let config = DeviceConfig::default()
            .with_overrides(lookup(&[
                ("ROCDEV_HIP_ADAPTIVE_COMPILE", "1"),
                ("ROCDEV_KERNEL_DIR", "/opt/kernels"),
                ("ROCDEV_CACHE_DIR", "/tmp/kcache"),
                ("ROCDEV_HIP_EXTRA_CFLAGS", "-DWITH_NANOVDB"),
                ("ROCDEV_DEBUG_SYNC_LAUNCH", "yes"),
                ("ROCDEV_BACKGROUND", "off"),
                ("ROCDEV_CONCURRENT_STATES_FACTOR", "0.5"),
            ]))
            .unwrap();

        assert!(config.adaptive_compile);
        assert_eq!(config.kernel_dir, PathBuf::from("/opt/kernels"));
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/kcache"));
        assert_eq!(config.extra_cflags.as_deref(), Some("-DWITH_NANOVDB"));
        assert!(config.debug_sync_launch);
        assert!(!config.background);
        assert_eq!(config.concurrent_states_factor, 0.5);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = DeviceConfig::default()
            .with_overrides(lookup(&[("ROCDEV_PROFILE_KERNELS", "sometimes")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBool { .. }));

        let err = DeviceConfig::default()
            .with_overrides(lookup(&[("ROCDEV_CONCURRENT_STATES_FACTOR", "-2")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { .. }));

        let err = DeviceConfig::default()
            .with_overrides(lookup(&[("ROCDEV_MAP_HOST_LIMIT", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("ROCDEV_MAP_HOST_LIMIT"));
    }

    #[test]
    fn test_device_config_builder() {
        let config = DeviceConfig::new()
            .with_headroom(1024, 4096)
            .with_map_host_memory(false)
            .with_profile_kernels(true)
            .with_kernel_dir("/k");
        assert_eq!(config.working_headroom, 1024);
        assert_eq!(config.texture_headroom, 4096);
        assert!(!config.map_host_memory);
        assert!(config.profile_kernels);
        assert_eq!(config.kernel_dir, PathBuf::from("/k"));
    }
}
