use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=ROCM_PATH");
    println!("cargo:rerun-if-env-changed=HIPCC");

    // libamdhip64 is opened at runtime by the hipew shim, nothing is linked here.
    // Record the ROCm root seen at build time so compiler lookup has a fallback
    // when the runtime environment does not set ROCM_PATH.
    let rocm_root = env::var("ROCM_PATH").unwrap_or_else(|_| "/opt/rocm".to_string());
    println!("cargo:rustc-env=ROCDEV_BUILD_ROCM_PATH={}", rocm_root);

    if let Ok(hipcc) = env::var("HIPCC") {
        println!("cargo:rustc-env=ROCDEV_BUILD_HIPCC={}", hipcc);
    } else {
        println!("cargo:rustc-env=ROCDEV_BUILD_HIPCC=");
    }
}
