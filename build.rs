//! Build script: pre-flight checks for GPU feature flags.
//!
//! Verifies that the required toolkit is present before whisper-rs-sys
//! starts compiling, so a missing SDK fails fast with a clear message
//! instead of deep inside a C++ build.

use std::process::Command;

fn main() {
    if cfg!(feature = "cuda") {
        require_tool(
            "nvcc",
            "CUDA toolkit not found. Install it from \
             https://developer.nvidia.com/cuda-downloads or build without \
             the `cuda` feature.",
        );
    }
    if cfg!(feature = "vulkan") {
        require_tool(
            "vulkaninfo",
            "Vulkan SDK not found. Install it from https://vulkan.lunarg.com/ \
             or build without the `vulkan` feature.",
        );
    }
    if cfg!(feature = "hipblas") {
        require_tool(
            "rocminfo",
            "ROCm not found. Install it from https://rocm.docs.amd.com/ or \
             build without the `hipblas` feature.",
        );
    }
}

fn require_tool(tool: &str, message: &str) {
    if Command::new(tool).arg("--version").output().is_err() {
        panic!("\n\n{}\n", message);
    }
}
