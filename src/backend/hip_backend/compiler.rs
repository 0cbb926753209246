//! Kernel binary lookup and runtime compilation
//!
//! Resolution order for a kernel binary:
//!
//! 1. precompiled `<kernel_dir>/<name>_<arch>.fatbin` (skipped with adaptive
//!    compilation)
//! 2. cached `<cache_dir>/kernels/cycles_<name>_<arch>_<sha256>.fatbin`, keyed
//!    on the kernel sources and the compile flags
//! 3. compile with `hipcc` into the cache location

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use sha2::{Digest, Sha256};

use crate::backend::hip_backend::error::{HipError, HipResult};
use crate::backend::hip_backend::hipew::{self, MIN_COMPILER_VERSION};
use crate::config::DeviceConfig;

/// Bitmask of renderer features a kernel build must support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KernelFeatures(pub u32);

impl KernelFeatures {
    pub const NODE_BSDF: KernelFeatures = KernelFeatures(1 << 0);
    pub const NODE_EMISSION: KernelFeatures = KernelFeatures(1 << 1);
    pub const NODE_VOLUME: KernelFeatures = KernelFeatures(1 << 2);
    pub const NODE_BUMP: KernelFeatures = KernelFeatures(1 << 3);
    pub const NODE_BUMP_STATE: KernelFeatures = KernelFeatures(1 << 4);
    pub const NODE_VORONOI_EXTRA: KernelFeatures = KernelFeatures(1 << 5);
    pub const NODE_RAYTRACE: KernelFeatures = KernelFeatures(1 << 6);
    pub const NODE_AOV: KernelFeatures = KernelFeatures(1 << 7);
    pub const NODE_LIGHT_PATH: KernelFeatures = KernelFeatures(1 << 8);
    pub const PATH_TRACING: KernelFeatures = KernelFeatures(1 << 9);
    pub const HAIR: KernelFeatures = KernelFeatures(1 << 10);
    pub const HAIR_THICK: KernelFeatures = KernelFeatures(1 << 11);
    pub const POINTCLOUD: KernelFeatures = KernelFeatures(1 << 12);
    pub const OBJECT_MOTION: KernelFeatures = KernelFeatures(1 << 13);
    pub const CAMERA_MOTION: KernelFeatures = KernelFeatures(1 << 14);
    pub const BAKING: KernelFeatures = KernelFeatures(1 << 15);
    pub const SUBSURFACE: KernelFeatures = KernelFeatures(1 << 16);
    pub const VOLUME: KernelFeatures = KernelFeatures(1 << 17);
    pub const PATCH_EVALUATION: KernelFeatures = KernelFeatures(1 << 18);
    pub const TRANSPARENT: KernelFeatures = KernelFeatures(1 << 19);
    pub const SHADOW_CATCHER: KernelFeatures = KernelFeatures(1 << 20);
    pub const DENOISING: KernelFeatures = KernelFeatures(1 << 21);
    pub const MNEE: KernelFeatures = KernelFeatures(1 << 22);

    pub const NONE: KernelFeatures = KernelFeatures(0);
    pub const ALL: KernelFeatures = KernelFeatures((1 << 23) - 1);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: KernelFeatures) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: KernelFeatures) -> KernelFeatures {
        KernelFeatures(self.0 | other.0)
    }
}

impl std::ops::BitOr for KernelFeatures {
    type Output = KernelFeatures;

    fn bitor(self, rhs: KernelFeatures) -> KernelFeatures {
        self.union(rhs)
    }
}

/// Locates or builds kernel binaries for one device configuration
#[derive(Debug, Clone)]
pub struct KernelCompiler {
    kernel_dir: PathBuf,
    source_dir: PathBuf,
    cache_dir: PathBuf,
    adaptive: bool,
    debug: bool,
    extra_cflags: Option<String>,
    hipcc: Option<PathBuf>,
    hipcc_version: Option<i32>,
}

impl KernelCompiler {
    pub fn from_config(config: &DeviceConfig) -> Self {
        KernelCompiler {
            kernel_dir: config.kernel_dir.clone(),
            source_dir: config.kernel_source_dir.clone(),
            cache_dir: config.cache_dir.clone(),
            adaptive: config.adaptive_compile,
            debug: config.debug,
            extra_cflags: config.extra_cflags.clone(),
            hipcc: None,
            hipcc_version: None,
        }
    }

    /// Use this compiler instead of looking one up through hipew
    pub fn with_compiler(mut self, hipcc: impl Into<PathBuf>, version: i32) -> Self {
        self.hipcc = Some(hipcc.into());
        self.hipcc_version = Some(version);
        self
    }

    /// Flags shared by every kernel build; part of the cache key
    pub fn common_cflags(&self, features: &KernelFeatures) -> Vec<String> {
        let include_root = self.source_dir.parent().unwrap_or(&self.source_dir);
        let mut cflags = vec![
            format!("-m{}", usize::BITS),
            "-ffast-math".to_string(),
            "-D__HIP__".to_string(),
            format!("-I{}", include_root.display()),
        ];
        if self.adaptive {
            cflags.push(format!("-D__KERNEL_FEATURES__={}", features.bits()));
        }
        if let Some(extra) = &self.extra_cflags {
            cflags.extend(extra.split_whitespace().map(str::to_string));
        }
        if self.debug {
            cflags.push("-D__KERNEL_DEBUG__".to_string());
        }
        cflags
    }

    pub fn precompiled_path(&self, name: &str, arch: &str) -> PathBuf {
        self.kernel_dir.join(format!("{}_{}.fatbin", name, arch))
    }

    /// Cache location for a build of `name` with the current sources and flags
    pub fn cache_path(&self, name: &str, arch: &str, features: &KernelFeatures) -> PathBuf {
        let source_hash = hash_source_tree(&self.source_dir).unwrap_or_else(|e| {
            tracing::debug!(
                "KernelCompiler: cannot hash {}: {}",
                self.source_dir.display(),
                e
            );
            String::new()
        });

        let mut hasher = Sha256::new();
        hasher.update(source_hash.as_bytes());
        hasher.update(self.common_cflags(features).join(" ").as_bytes());
        let key = hex::encode(hasher.finalize());

        self.cache_dir
            .join("kernels")
            .join(format!("cycles_{}_{}_{}.fatbin", name, arch, key))
    }

    /// Path of a kernel binary for `arch`, compiling it when necessary
    pub fn compile(&self, name: &str, arch: &str, features: &KernelFeatures) -> HipResult<PathBuf> {
        if !self.adaptive {
            let precompiled = self.precompiled_path(name, arch);
            tracing::debug!("KernelCompiler: testing for pre-compiled kernel {}", precompiled.display());
            if precompiled.is_file() {
                tracing::debug!("KernelCompiler: using precompiled kernel {}", precompiled.display());
                return Ok(precompiled);
            }
        }

        let fatbin = self.cache_path(name, arch, features);
        tracing::debug!("KernelCompiler: testing for locally compiled kernel {}", fatbin.display());
        if fatbin.is_file() {
            tracing::debug!("KernelCompiler: using locally compiled kernel {}", fatbin.display());
            return Ok(fatbin);
        }

        let hipcc = self
            .hipcc
            .clone()
            .or_else(hipew::compiler_path)
            .ok_or_else(|| {
                HipError::KernelCompileFailed(
                    "HIP hipcc compiler not found. Install HIP toolkit in default location.".to_string(),
                )
            })?;

        let version = self.hipcc_version.or_else(hipew::compiler_version).unwrap_or(0);
        if version < MIN_COMPILER_VERSION {
            return Err(HipError::KernelCompileFailed(format!(
                "Unsupported HIP version {}.{} detected, you need HIP {}.{} or newer.",
                version / 10,
                version % 10,
                MIN_COMPILER_VERSION / 10,
                MIN_COMPILER_VERSION % 10
            )));
        }

        if let Some(parent) = fatbin.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                HipError::KernelCompileFailed(format!(
                    "Failed to create kernel cache directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let source = self
            .source_dir
            .join("device")
            .join("hip")
            .join(format!("{}.cpp", name));

        let mut command = Command::new(&hipcc);
        command
            .arg(format!("--offload-arch={}", arch))
            .arg("-O3")
            .arg("--genco")
            .arg(&source)
            .arg("-o")
            .arg(&fatbin)
            .args(self.common_cflags(features));

        tracing::info!(
            "Compiling {} and caching to {}",
            source.display(),
            fatbin.display()
        );
        tracing::debug!("KernelCompiler: {:?}", command);

        let started = Instant::now();
        let output = command.output().map_err(|e| {
            HipError::KernelCompileFailed(format!(
                "Failed to execute compilation command {}: {}",
                hipcc.display(),
                e
            ))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!("hipcc failed ({}):\n{}", output.status, stderr);
            return Err(HipError::KernelCompileFailed(format!(
                "Failed to execute compilation command ({}): {}",
                output.status,
                stderr.lines().last().unwrap_or("see log for details")
            )));
        }

        if !fatbin.is_file() {
            return Err(HipError::KernelCompileFailed(format!(
                "HIP kernel compilation failed, {} was not produced",
                fatbin.display()
            )));
        }

        tracing::info!(
            "Kernel compilation finished in {:.2}s",
            started.elapsed().as_secs_f64()
        );
        Ok(fatbin)
    }
}

/// SHA-256 over every file below `dir`: relative paths and contents, in
/// sorted order
pub fn hash_source_tree(dir: &Path) -> io::Result<String> {
    let mut files = Vec::new();
    collect_files(dir, &mut files)?;
    files.sort();

    let mut hasher = Sha256::new();
    for file in &files {
        let relative = file.strip_prefix(dir).unwrap_or(file);
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(fs::read(file)?);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiler(root: &Path) -> KernelCompiler {
        let config = DeviceConfig::default()
            .with_kernel_dir(root.join("lib"))
            .with_kernel_source_dir(root.join("source").join("kernel"))
            .with_cache_dir(root.join("cache"))
            .with_debug(false);
        KernelCompiler::from_config(&config)
    }

    fn write_source(root: &Path, contents: &str) {
        let dir = root.join("source").join("kernel").join("device").join("hip");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("kernel.cpp"), contents).unwrap();
    }

    #[test]
    fn test_common_cflags() {
        let dir = tempfile::tempdir().unwrap();
        let plain = compiler(dir.path());
        let flags = plain.common_cflags(&KernelFeatures::HAIR);
        assert!(flags.contains(&"-ffast-math".to_string()));
        assert!(flags.contains(&"-D__HIP__".to_string()));
        assert!(!flags.iter().any(|f| f.starts_with("-D__KERNEL_FEATURES__")));

        let config = DeviceConfig::default()
            .with_adaptive_compile(true)
            .with_extra_cflags("-DWITH_NANOVDB -g")
            .with_debug(true);
        let adaptive = KernelCompiler::from_config(&config);
        let flags = adaptive.common_cflags(&(KernelFeatures::HAIR | KernelFeatures::VOLUME));
        assert!(flags.contains(&format!("-D__KERNEL_FEATURES__={}", (1 << 10) | (1 << 17))));
        assert!(flags.contains(&"-DWITH_NANOVDB".to_string()));
        assert!(flags.contains(&"-g".to_string()));
        assert_eq!(flags.last().map(String::as_str), Some("-D__KERNEL_DEBUG__"));
    }

    #[test]
    fn test_precompiled_kernel_preferred() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = compiler(dir.path());
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib").join("kernel_gfx1100.fatbin"), b"bin").unwrap();

        let path = compiler.compile("kernel", "gfx1100", &KernelFeatures::NONE).unwrap();
        assert_eq!(path, dir.path().join("lib").join("kernel_gfx1100.fatbin"));
    }

    #[test]
    fn test_cache_key_tracks_sources_and_flags() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = compiler(dir.path());
        write_source(dir.path(), "void a() {}");

        let first = compiler.cache_path("kernel", "gfx1030", &KernelFeatures::NONE);
        assert_eq!(first, compiler.cache_path("kernel", "gfx1030", &KernelFeatures::NONE));
        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("cycles_kernel_gfx1030_"));
        assert!(name.ends_with(".fatbin"));
        assert!(first.starts_with(dir.path().join("cache").join("kernels")));

        write_source(dir.path(), "void b() {}");
        assert_ne!(first, compiler.cache_path("kernel", "gfx1030", &KernelFeatures::NONE));
    }

    #[test]
    fn test_cached_kernel_used_without_compiler() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = compiler(dir.path()).with_compiler("/nonexistent/hipcc", 60);
        write_source(dir.path(), "void a() {}");

        let cached = compiler.cache_path("kernel", "gfx1100", &KernelFeatures::NONE);
        fs::create_dir_all(cached.parent().unwrap()).unwrap();
        fs::write(&cached, b"bin").unwrap();
        assert_eq!(
            compiler.compile("kernel", "gfx1100", &KernelFeatures::NONE).unwrap(),
            cached
        );
    }

    #[test]
    fn test_old_compiler_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = compiler(dir.path()).with_compiler("/usr/bin/true", 39);
        let err = compiler.compile("kernel", "gfx1100", &KernelFeatures::NONE).unwrap_err();
        assert!(err.to_string().contains("Unsupported HIP version 3.9"));
    }

    #[cfg(unix)]
    #[test]
    fn test_compiles_with_hipcc_into_cache() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        write_source(dir.path(), "extern \"C\" __global__ void kernel_gpu_prefix_sum() {}");

        // Stand-in for hipcc: writes a module image to the -o argument.
        let hipcc = dir.path().join("hipcc");
        fs::write(
            &hipcc,
            "#!/bin/sh\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = \"-o\" ]; then shift; printf 'kernel_gpu_prefix_sum\\n' > \"$1\"; fi\n  shift\ndone\n",
        )
        .unwrap();
        fs::set_permissions(&hipcc, fs::Permissions::from_mode(0o755)).unwrap();

        let compiler = compiler(dir.path()).with_compiler(&hipcc, 60);
        let path = compiler.compile("kernel", "gfx1100", &KernelFeatures::NONE).unwrap();
        assert_eq!(path, compiler.cache_path("kernel", "gfx1100", &KernelFeatures::NONE));
        assert_eq!(fs::read_to_string(&path).unwrap(), "kernel_gpu_prefix_sum\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_hipcc_reported() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let hipcc = dir.path().join("hipcc");
        fs::write(&hipcc, "#!/bin/sh\necho 'error: no such file' >&2\nexit 1\n").unwrap();
        fs::set_permissions(&hipcc, fs::Permissions::from_mode(0o755)).unwrap();

        let compiler = compiler(dir.path()).with_compiler(&hipcc, 60);
        match compiler.compile("kernel", "gfx1100", &KernelFeatures::NONE) {
            Err(HipError::KernelCompileFailed(msg)) => assert!(msg.contains("no such file")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
