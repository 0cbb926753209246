//! Kernel identities and the per-module kernel cache

use std::fmt;

use crate::backend::hip_backend::driver::HipDriver;
use crate::backend::hip_backend::ffi::{hipFuncCachePreferL1, HipFunctionHandle, HipModuleHandle};

macro_rules! device_kernels {
    ($($variant:ident => $name:literal,)+) => {
        /// Renderer kernels the device can dispatch
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum DeviceKernel {
            $($variant,)+
        }

        impl DeviceKernel {
            /// Every kernel identity, in declaration order
            pub const ALL: &'static [DeviceKernel] = &[$(DeviceKernel::$variant,)+];

            /// Logical kernel name, e.g. "integrator_shade_surface"
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(DeviceKernel::$variant => $name,)+
                }
            }
        }
    };
}

device_kernels! {
    IntegratorInitFromCamera => "integrator_init_from_camera",
    IntegratorInitFromBake => "integrator_init_from_bake",
    IntegratorIntersectClosest => "integrator_intersect_closest",
    IntegratorIntersectShadow => "integrator_intersect_shadow",
    IntegratorIntersectSubsurface => "integrator_intersect_subsurface",
    IntegratorIntersectVolumeStack => "integrator_intersect_volume_stack",
    IntegratorShadeBackground => "integrator_shade_background",
    IntegratorShadeLight => "integrator_shade_light",
    IntegratorShadeShadow => "integrator_shade_shadow",
    IntegratorShadeSurface => "integrator_shade_surface",
    IntegratorShadeSurfaceRaytrace => "integrator_shade_surface_raytrace",
    IntegratorShadeVolume => "integrator_shade_volume",
    IntegratorMegakernel => "integrator_megakernel",
    IntegratorQueuedPathsArray => "integrator_queued_paths_array",
    IntegratorQueuedShadowPathsArray => "integrator_queued_shadow_paths_array",
    IntegratorActivePathsArray => "integrator_active_paths_array",
    IntegratorTerminatedPathsArray => "integrator_terminated_paths_array",
    IntegratorSortedPathsArray => "integrator_sorted_paths_array",
    IntegratorCompactPathsArray => "integrator_compact_paths_array",
    IntegratorCompactStates => "integrator_compact_states",
    IntegratorTerminatedShadowPathsArray => "integrator_terminated_shadow_paths_array",
    IntegratorCompactShadowPathsArray => "integrator_compact_shadow_paths_array",
    IntegratorCompactShadowStates => "integrator_compact_shadow_states",
    IntegratorReset => "integrator_reset",
    IntegratorShadowCatcherCountPossibleSplits => "integrator_shadow_catcher_count_possible_splits",
    ShaderEvalDisplace => "shader_eval_displace",
    ShaderEvalBackground => "shader_eval_background",
    ShaderEvalCurveShadowTransparency => "shader_eval_curve_shadow_transparency",
    AdaptiveSamplingConvergenceCheck => "adaptive_sampling_convergence_check",
    AdaptiveSamplingConvergenceFilterX => "adaptive_sampling_convergence_filter_x",
    AdaptiveSamplingConvergenceFilterY => "adaptive_sampling_convergence_filter_y",
    FilmConvertDepth => "film_convert_depth",
    FilmConvertMist => "film_convert_mist",
    FilmConvertSampleCount => "film_convert_sample_count",
    FilmConvertFloat => "film_convert_float",
    FilmConvertLightPath => "film_convert_light_path",
    FilmConvertFloat3 => "film_convert_float3",
    FilmConvertMotion => "film_convert_motion",
    FilmConvertCryptomatte => "film_convert_cryptomatte",
    FilmConvertShadowCatcher => "film_convert_shadow_catcher",
    FilmConvertShadowCatcherMatteWithShadow => "film_convert_shadow_catcher_matte_with_shadow",
    FilmConvertCombined => "film_convert_combined",
    FilmConvertFloat4 => "film_convert_float4",
    FilmConvertDepthHalfRgba => "film_convert_depth_half_rgba",
    FilmConvertMistHalfRgba => "film_convert_mist_half_rgba",
    FilmConvertSampleCountHalfRgba => "film_convert_sample_count_half_rgba",
    FilmConvertFloatHalfRgba => "film_convert_float_half_rgba",
    FilmConvertLightPathHalfRgba => "film_convert_light_path_half_rgba",
    FilmConvertFloat3HalfRgba => "film_convert_float3_half_rgba",
    FilmConvertMotionHalfRgba => "film_convert_motion_half_rgba",
    FilmConvertCryptomatteHalfRgba => "film_convert_cryptomatte_half_rgba",
    FilmConvertShadowCatcherHalfRgba => "film_convert_shadow_catcher_half_rgba",
    FilmConvertShadowCatcherMatteWithShadowHalfRgba => "film_convert_shadow_catcher_matte_with_shadow_half_rgba",
    FilmConvertCombinedHalfRgba => "film_convert_combined_half_rgba",
    FilmConvertFloat4HalfRgba => "film_convert_float4_half_rgba",
    CryptomattePostprocess => "cryptomatte_postprocess",
    FilterGuidingPreprocess => "filter_guiding_preprocess",
    FilterGuidingSetFakeAlbedo => "filter_guiding_set_fake_albedo",
    FilterColorPreprocess => "filter_color_preprocess",
    FilterColorPostprocess => "filter_color_postprocess",
    PrefixSum => "prefix_sum",
}

impl DeviceKernel {
    /// Symbol exported by the kernel module
    pub fn symbol(&self) -> String {
        format!("kernel_gpu_{}", self.as_str())
    }

    /// Path-array kernels need one int of shared memory per thread, plus one
    pub fn uses_path_array_shared_memory(&self) -> bool {
        matches!(
            self,
            DeviceKernel::IntegratorQueuedPathsArray
                | DeviceKernel::IntegratorQueuedShadowPathsArray
                | DeviceKernel::IntegratorActivePathsArray
                | DeviceKernel::IntegratorTerminatedPathsArray
                | DeviceKernel::IntegratorSortedPathsArray
                | DeviceKernel::IntegratorCompactPathsArray
                | DeviceKernel::IntegratorTerminatedShadowPathsArray
                | DeviceKernel::IntegratorCompactShadowPathsArray
        )
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for DeviceKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved kernel entry point and its launch limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HipDeviceKernel {
    pub function: HipFunctionHandle,
    pub num_threads_per_block: i32,
    pub min_blocks: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelCacheState {
    Unloaded,
    Loading,
    Loaded,
}

/// Kernel lookup table for one loaded module
///
/// Filled once by [`HipDeviceKernels::load`] and read-only afterwards.
#[derive(Debug)]
pub struct HipDeviceKernels {
    kernels: Vec<Option<HipDeviceKernel>>,
    state: KernelCacheState,
}

impl Default for HipDeviceKernels {
    fn default() -> Self {
        Self::new()
    }
}

impl HipDeviceKernels {
    pub fn new() -> Self {
        HipDeviceKernels {
            kernels: vec![None; DeviceKernel::ALL.len()],
            state: KernelCacheState::Unloaded,
        }
    }

    pub fn state(&self) -> KernelCacheState {
        self.state
    }

    pub fn is_loaded(&self) -> bool {
        self.state == KernelCacheState::Loaded
    }

    /// Resolve every kernel the module defines. Returns how many were found.
    ///
    /// The megakernel is never used on HIP and is skipped. A kernel missing
    /// from the module is logged and stays unavailable.
    pub fn load(&mut self, driver: &dyn HipDriver, module: HipModuleHandle) -> usize {
        self.state = KernelCacheState::Loading;
        let mut loaded = 0;

        for &kernel in DeviceKernel::ALL {
            if kernel == DeviceKernel::IntegratorMegakernel {
                continue;
            }
            self.kernels[kernel.index()] = Self::resolve(driver, module, kernel);
            if self.kernels[kernel.index()].is_some() {
                loaded += 1;
            }
        }

        self.state = KernelCacheState::Loaded;
        tracing::debug!(
            "HipDeviceKernels::load: {} of {} kernels available",
            loaded,
            DeviceKernel::ALL.len()
        );
        loaded
    }

    fn resolve(
        driver: &dyn HipDriver,
        module: HipModuleHandle,
        kernel: DeviceKernel,
    ) -> Option<HipDeviceKernel> {
        let symbol = kernel.symbol();
        let function = match driver.module_get_function(module, &symbol) {
            Ok(function) if !function.is_null() => function,
            Ok(_) | Err(_) => {
                tracing::debug!("HipDeviceKernels::load: kernel {} not found in module", symbol);
                return None;
            }
        };

        if let Err(code) = driver.func_set_cache_config(function, hipFuncCachePreferL1) {
            tracing::warn!(
                "HipDeviceKernels::load: hipFuncSetCacheConfig failed for {}: {}",
                symbol,
                driver.error_name(code)
            );
            return None;
        }

        match driver.occupancy_max_potential_block_size(function, 0, 0) {
            Ok((min_blocks, num_threads_per_block)) if num_threads_per_block > 0 => {
                Some(HipDeviceKernel {
                    function,
                    num_threads_per_block,
                    min_blocks,
                })
            }
            Ok(_) => {
                tracing::warn!("HipDeviceKernels::load: zero block size reported for {}", symbol);
                None
            }
            Err(code) => {
                tracing::warn!(
                    "HipDeviceKernels::load: occupancy query failed for {}: {}",
                    symbol,
                    driver.error_name(code)
                );
                None
            }
        }
    }

    /// Entry for `kernel`, `None` if the module does not define it.
    ///
    /// # Panics
    /// When called before [`HipDeviceKernels::load`] completed.
    pub fn get(&self, kernel: DeviceKernel) -> Option<&HipDeviceKernel> {
        assert!(
            self.is_loaded(),
            "HipDeviceKernels::get({}) called before kernels were loaded",
            kernel
        );
        self.kernels[kernel.index()].as_ref()
    }

    /// False for every kernel until loaded
    pub fn available(&self, kernel: DeviceKernel) -> bool {
        self.is_loaded() && self.kernels[kernel.index()].is_some()
    }

    pub fn num_available(&self) -> usize {
        self.kernels.iter().filter(|k| k.is_some()).count()
    }
}
