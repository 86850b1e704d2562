// Build script to compile the ray tracing GLSL shaders to SPIR-V

use std::path::Path;
use std::process::Command;

const SHADERS: &[&str] = &[
    "shaders/raygen.rgen",
    "shaders/miss.rmiss",
    "shaders/closesthit.rchit",
];

fn main() {
    for shader in SHADERS {
        // Per source file: the .spv outputs land in the same directory
        println!("cargo:rerun-if-changed={}", shader);
        compile_shader(shader, &format!("{}.spv", shader));
    }
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    let output_path = Path::new(output);

    // Ray tracing stages need at least the Vulkan 1.2 / SPIR-V 1.4 target
    let result = Command::new("glslc")
        .arg("--target-env=vulkan1.2")
        .arg(input_path)
        .arg("-o")
        .arg(output_path)
        .status();

    match result {
        Ok(status) if status.success() => {
            println!("Compiled {} -> {}", input, output);
        }
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}), {} was not compiled", e, input);
            println!("cargo:warning=Install the Vulkan SDK or run: glslc --target-env=vulkan1.2 {} -o {}", input, output);
        }
    }
}
