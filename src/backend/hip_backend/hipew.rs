//! hipew: runtime wrangler for the HIP driver library
//!
//! The driver is never linked. [`Hipew::init`] opens `libamdhip64`, binds the
//! entry points into a [`DynamicHipDriver`], initializes the runtime and checks
//! the driver version. The resulting table is shared as `Arc<dyn HipDriver>`.
//!
//! A process-wide instance is available through [`global`] and the free
//! functions in this module. Tests construct their own [`Hipew`] around a
//! custom [`DriverLoader`].

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use thiserror::Error;

use crate::backend::hip_backend::driver::{DynamicHipDriver, HipDriver};
use crate::backend::hip_backend::ffi::hipError_t;

/// Oldest supported driver: ROCm 6.0 (`hipDeviceProp_tR0600` ABI)
pub const MIN_DRIVER_VERSION: i32 = 60_000_000;

/// Oldest `hipcc` accepted for runtime kernel compilation (HIP 4.0)
pub const MIN_COMPILER_VERSION: i32 = 40;

/// Outcome of a shim initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HipewStatus {
    Success,
    OpenFailed,
    SymbolLookupFailed,
    DriverTooOld,
}

/// Why the driver could not be brought up
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HipewError {
    #[error("failed to open HIP driver library (tried: {})", tried.join(", "))]
    OpenFailed { tried: Vec<String> },
    #[error("HIP driver does not export {symbol}: {reason}")]
    SymbolLookupFailed { symbol: String, reason: String },
    #[error("HIP driver version {found} is older than required {required}")]
    DriverTooOld { found: i32, required: i32 },
    #[error("hipInit failed: {} ({code})", error_string(*code))]
    InitFailed { code: hipError_t },
}

impl HipewError {
    pub fn status(&self) -> HipewStatus {
        match self {
            HipewError::OpenFailed { .. } => HipewStatus::OpenFailed,
            HipewError::SymbolLookupFailed { .. } => HipewStatus::SymbolLookupFailed,
            HipewError::DriverTooOld { .. } => HipewStatus::DriverTooOld,
            // The library loaded but the runtime refused to start; callers
            // treat this the same as a library that could not be opened.
            HipewError::InitFailed { .. } => HipewStatus::OpenFailed,
        }
    }
}

/// Source of driver tables
pub trait DriverLoader: Send + Sync {
    fn load(&self) -> Result<Arc<dyn HipDriver>, HipewError>;
}

/// Loads `libamdhip64` from the platform's usual locations
#[derive(Debug, Clone)]
pub struct DynamicLoader {
    candidates: Vec<PathBuf>,
}

impl DynamicLoader {
    pub fn new() -> Self {
        DynamicLoader {
            candidates: Self::default_candidates(),
        }
    }

    /// Loader that only tries the given paths
    pub fn with_candidates(candidates: Vec<PathBuf>) -> Self {
        DynamicLoader { candidates }
    }

    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    #[cfg(not(windows))]
    fn default_candidates() -> Vec<PathBuf> {
        let mut candidates = vec![
            PathBuf::from("libamdhip64.so.6"),
            PathBuf::from("libamdhip64.so"),
        ];
        if let Ok(root) = env::var("ROCM_PATH") {
            candidates.push(Path::new(&root).join("lib").join("libamdhip64.so"));
        }
        candidates.push(PathBuf::from("/opt/rocm/lib/libamdhip64.so"));
        candidates
    }

    #[cfg(windows)]
    fn default_candidates() -> Vec<PathBuf> {
        vec![PathBuf::from("amdhip64_6.dll"), PathBuf::from("amdhip64.dll")]
    }
}

impl Default for DynamicLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverLoader for DynamicLoader {
    fn load(&self) -> Result<Arc<dyn HipDriver>, HipewError> {
        let driver = DynamicHipDriver::open(&self.candidates)?;
        Ok(Arc::new(driver))
    }
}

#[derive(Default)]
struct HipewState {
    driver: Option<Arc<dyn HipDriver>>,
    last_error: Option<HipewError>,
}

/// Driver table holder
///
/// At most one table is live per `Hipew`: a successful `init` replaces the
/// previous table, and a failed one clears it.
pub struct Hipew {
    loader: Box<dyn DriverLoader>,
    state: RwLock<HipewState>,
}

impl std::fmt::Debug for Hipew {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hipew")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl Hipew {
    pub fn new(loader: Box<dyn DriverLoader>) -> Self {
        Hipew {
            loader,
            state: RwLock::new(HipewState::default()),
        }
    }

    /// Initialize, reporting only the status
    pub fn init(&self, flags: u32) -> HipewStatus {
        match self.try_init(flags) {
            Ok(_) => HipewStatus::Success,
            Err(e) => e.status(),
        }
    }

    /// Load the driver, run `hipInit(flags)` and check the version.
    pub fn try_init(&self, flags: u32) -> Result<Arc<dyn HipDriver>, HipewError> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

        match Self::bring_up(self.loader.as_ref(), flags) {
            Ok(driver) => {
                // Dropping the previous table closes its library handle.
                state.driver = Some(driver.clone());
                state.last_error = None;
                Ok(driver)
            }
            Err(e) => {
                tracing::warn!("hipew: {}", e);
                state.driver = None;
                state.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    fn bring_up(loader: &dyn DriverLoader, flags: u32) -> Result<Arc<dyn HipDriver>, HipewError> {
        let driver = loader.load()?;
        driver
            .init(flags)
            .map_err(|code| HipewError::InitFailed { code })?;

        let version = driver
            .driver_version()
            .map_err(|code| HipewError::InitFailed { code })?;
        if version < MIN_DRIVER_VERSION {
            return Err(HipewError::DriverTooOld {
                found: version,
                required: MIN_DRIVER_VERSION,
            });
        }

        tracing::debug!("hipew: driver version {}", version);
        Ok(driver)
    }

    pub fn is_initialized(&self) -> bool {
        self.state
            .read()
            .map(|s| s.driver.is_some())
            .unwrap_or(false)
    }

    pub fn driver(&self) -> Option<Arc<dyn HipDriver>> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .driver
            .clone()
    }

    pub fn last_error(&self) -> Option<HipewError> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .last_error
            .clone()
    }
}

static GLOBAL: Lazy<Hipew> = Lazy::new(|| Hipew::new(Box::new(DynamicLoader::new())));

/// Process-wide shim backed by [`DynamicLoader`]
pub fn global() -> &'static Hipew {
    &GLOBAL
}

pub fn init(flags: u32) -> HipewStatus {
    global().init(flags)
}

pub fn is_initialized() -> bool {
    global().is_initialized()
}

/// Driver table of the global shim, initializing it on first use
pub fn driver() -> Result<Arc<dyn HipDriver>, HipewError> {
    match global().driver() {
        Some(driver) => Ok(driver),
        None => global().try_init(0),
    }
}

/// Symbolic name for a HIP status code
///
/// Static table, usable before (or without) loading the driver.
pub fn error_string(code: hipError_t) -> &'static str {
    match code {
        0 => "hipSuccess",
        1 => "hipErrorInvalidValue",
        2 => "hipErrorOutOfMemory",
        3 => "hipErrorNotInitialized",
        4 => "hipErrorDeinitialized",
        9 => "hipErrorInvalidConfiguration",
        13 => "hipErrorInvalidSymbol",
        17 => "hipErrorInvalidDevicePointer",
        21 => "hipErrorInvalidMemcpyDirection",
        35 => "hipErrorInsufficientDriver",
        52 => "hipErrorMissingConfiguration",
        53 => "hipErrorPriorLaunchFailure",
        98 => "hipErrorInvalidDeviceFunction",
        100 => "hipErrorNoDevice",
        101 => "hipErrorInvalidDevice",
        200 => "hipErrorInvalidImage",
        201 => "hipErrorInvalidContext",
        202 => "hipErrorContextAlreadyCurrent",
        205 => "hipErrorMapFailed",
        206 => "hipErrorUnmapFailed",
        207 => "hipErrorArrayIsMapped",
        208 => "hipErrorAlreadyMapped",
        209 => "hipErrorNoBinaryForGpu",
        210 => "hipErrorAlreadyAcquired",
        211 => "hipErrorNotMapped",
        212 => "hipErrorNotMappedAsArray",
        213 => "hipErrorNotMappedAsPointer",
        214 => "hipErrorECCNotCorrectable",
        215 => "hipErrorUnsupportedLimit",
        216 => "hipErrorContextAlreadyInUse",
        217 => "hipErrorPeerAccessUnsupported",
        218 => "hipErrorInvalidKernelFile",
        219 => "hipErrorInvalidGraphicsContext",
        300 => "hipErrorInvalidSource",
        301 => "hipErrorFileNotFound",
        302 => "hipErrorSharedObjectSymbolNotFound",
        303 => "hipErrorSharedObjectInitFailed",
        304 => "hipErrorOperatingSystem",
        400 => "hipErrorInvalidHandle",
        401 => "hipErrorIllegalState",
        500 => "hipErrorNotFound",
        600 => "hipErrorNotReady",
        700 => "hipErrorIllegalAddress",
        701 => "hipErrorLaunchOutOfResources",
        702 => "hipErrorLaunchTimeOut",
        704 => "hipErrorPeerAccessAlreadyEnabled",
        705 => "hipErrorPeerAccessNotEnabled",
        708 => "hipErrorSetOnActiveProcess",
        709 => "hipErrorContextIsDestroyed",
        710 => "hipErrorAssert",
        711 => "hipErrorHostMemoryAlreadyRegistered",
        712 => "hipErrorHostMemoryNotRegistered",
        719 => "hipErrorLaunchFailure",
        720 => "hipErrorCooperativeLaunchTooLarge",
        801 => "hipErrorNotSupported",
        999 => "hipErrorUnknown",
        _ => "Unknown HIP error",
    }
}

#[cfg(windows)]
const HIPCC_NAMES: &[&str] = &["hipcc.bat", "hipcc.exe", "hipcc"];
#[cfg(not(windows))]
const HIPCC_NAMES: &[&str] = &["hipcc"];

/// Locate `hipcc`
///
/// Order: `HIPCC`, `$ROCM_PATH/bin`, the compiler and ROCm root seen at
/// build time, `/opt/rocm/bin`, then `PATH`.
pub fn compiler_path() -> Option<PathBuf> {
    find_compiler(|key| env::var(key).ok(), &install_candidates())
}

fn root_candidates(root: &Path) -> Vec<PathBuf> {
    HIPCC_NAMES.iter().map(|name| root.join("bin").join(name)).collect()
}

/// Compiler locations known without consulting the environment
fn install_candidates() -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = option_env!("ROCDEV_BUILD_HIPCC")
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .into_iter()
        .collect();
    if let Some(root) = option_env!("ROCDEV_BUILD_ROCM_PATH").filter(|s| !s.is_empty()) {
        candidates.extend(root_candidates(Path::new(root)));
    }
    candidates.extend(root_candidates(Path::new("/opt/rocm")));
    candidates
}

pub(crate) fn find_compiler(
    lookup: impl Fn(&str) -> Option<String>,
    installs: &[PathBuf],
) -> Option<PathBuf> {
    if let Some(explicit) = lookup("HIPCC").filter(|s| !s.is_empty()) {
        return Some(PathBuf::from(explicit));
    }

    let from_env = lookup("ROCM_PATH")
        .filter(|s| !s.is_empty())
        .map(|root| root_candidates(Path::new(&root)))
        .unwrap_or_default();
    if let Some(found) = from_env.into_iter().chain(installs.iter().cloned()).find(|p| p.is_file()) {
        return Some(found);
    }

    let path = lookup("PATH")?;
    env::split_paths(&path)
        .flat_map(|dir| HIPCC_NAMES.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

/// `hipcc` version as `major * 10 + minor`, or `None` when unavailable
pub fn compiler_version() -> Option<i32> {
    let hipcc = compiler_path()?;
    let output = Command::new(&hipcc).arg("--version").output().ok()?;
    if !output.status.success() {
        tracing::debug!("hipew: {} --version exited with {}", hipcc.display(), output.status);
        return None;
    }
    parse_compiler_version(&String::from_utf8_lossy(&output.stdout))
}

/// Parse the `HIP version: X.Y...` line printed by `hipcc --version`
pub fn parse_compiler_version(output: &str) -> Option<i32> {
    let line = output.lines().find(|l| l.contains("HIP version:"))?;
    let version = line.split("HIP version:").nth(1)?.trim();
    let mut parts = version.split('.');
    let major: i32 = parts.next()?.trim().parse().ok()?;
    let minor: i32 = parts
        .next()?
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .ok()?;
    Some(major * 10 + minor)
}
