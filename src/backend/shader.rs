// Shader module loading
//
// Ray tracing stages are loaded from compiled SPIR-V on disk so they can be
// rebuilt and hot-reloaded without recompiling the renderer.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CStr;
use std::path::Path;
use super::VulkanDevice;
use crate::files;

pub const ENTRY_POINT: &CStr = c"main";

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder()
        .code(code);

    unsafe {
        device.device.create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

/// Load a compiled shader from disk and create a module
pub fn load_shader_module<P: AsRef<Path>>(device: &VulkanDevice, path: P) -> Result<vk::ShaderModule> {
    let path = path.as_ref();
    let code = files::read_spirv(path)?;
    let module = create_shader_module(device, &code)
        .with_context(|| format!("Shader {:?}", path))?;
    log::debug!("Loaded shader {:?} ({} words)", path, code.len());
    Ok(module)
}

pub fn stage_create_info(
    module: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
) -> vk::PipelineShaderStageCreateInfo {
    vk::PipelineShaderStageCreateInfo::builder()
        .stage(stage)
        .module(module)
        .name(ENTRY_POINT)
        .build()
}
