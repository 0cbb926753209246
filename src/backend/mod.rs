//! ROCm/HIP backend module

pub mod hip_backend;

pub use hip_backend::*;
