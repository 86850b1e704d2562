// Ray tracing pipeline creation and management
//
// Three stages (raygen, miss, closest hit) in three shader groups:
// group 0 = raygen, group 1 = miss, group 2 = triangle hit group.
// The pipeline cache is persisted to disk between runs.

use anyhow::{Context, Result};
use ash::vk;
use std::path::{Path, PathBuf};
use super::shader::{load_shader_module, stage_create_info};
use super::VulkanDevice;
use crate::config::ShaderConfig;
use crate::files;

pub const RAYGEN_GROUP: u32 = 0;
pub const MISS_GROUP: u32 = 1;
pub const HIT_GROUP: u32 = 2;
pub const GROUP_COUNT: u32 = 3;

/// Camera matrices pushed to the ray generation stage (two 4x4 matrices)
pub const PUSH_CONSTANT_SIZE: u32 = 128;

const RAYGEN_STAGE: u32 = 0;
const MISS_STAGE: u32 = 1;
const CLOSEST_HIT_STAGE: u32 = 2;

/// Recursion depth the pipeline asks for, capped by what the device allows
pub fn recursion_depth(requested: u32, device_limit: u32) -> u32 {
    requested.min(device_limit).max(1)
}

/// Shader groups referencing stage indices; unused slots are SHADER_UNUSED_KHR
pub fn shader_groups() -> [vk::RayTracingShaderGroupCreateInfoKHR; GROUP_COUNT as usize] {
    let general = |stage: u32| {
        vk::RayTracingShaderGroupCreateInfoKHR::builder()
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(stage)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
            .build()
    };

    let hit_group = vk::RayTracingShaderGroupCreateInfoKHR::builder()
        .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
        .general_shader(vk::SHADER_UNUSED_KHR)
        .closest_hit_shader(CLOSEST_HIT_STAGE)
        .any_hit_shader(vk::SHADER_UNUSED_KHR)
        .intersection_shader(vk::SHADER_UNUSED_KHR)
        .build();

    let mut groups = [vk::RayTracingShaderGroupCreateInfoKHR::default(); GROUP_COUNT as usize];
    groups[RAYGEN_GROUP as usize] = general(RAYGEN_STAGE);
    groups[MISS_GROUP as usize] = general(MISS_STAGE);
    groups[HIT_GROUP as usize] = hit_group;
    groups
}

/// Pipeline layout: one descriptor set plus camera push constants for raygen
pub fn create_pipeline_layout(
    device: &VulkanDevice,
    set_layout: vk::DescriptorSetLayout,
) -> Result<vk::PipelineLayout> {
    let max_push_constants = device.properties.limits.max_push_constants_size;
    if PUSH_CONSTANT_SIZE > max_push_constants {
        anyhow::bail!(
            "Camera push constants need {} bytes, device allows {}",
            PUSH_CONSTANT_SIZE,
            max_push_constants
        );
    }

    let push_constant_range = vk::PushConstantRange::builder()
        .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR)
        .offset(0)
        .size(PUSH_CONSTANT_SIZE)
        .build();

    let set_layouts = [set_layout];
    let push_constant_ranges = [push_constant_range];
    let layout_info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(&set_layouts)
        .push_constant_ranges(&push_constant_ranges);

    unsafe {
        device.device.create_pipeline_layout(&layout_info, None)
            .context("Failed to create pipeline layout")
    }
}

/// Pipeline cache backed by a file
pub struct PipelineCache {
    pub cache: vk::PipelineCache,
    path: PathBuf,
}

impl PipelineCache {
    /// Create the cache, seeded from `path` when a previous run saved one
    pub fn load<P: AsRef<Path>>(device: &VulkanDevice, path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let initial_data = if path.exists() {
            match files::read_file(&path) {
                Ok(data) => data,
                Err(e) => {
                    log::warn!("Ignoring unreadable pipeline cache: {:#}", e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let cache_info = vk::PipelineCacheCreateInfo::builder().initial_data(&initial_data);
        let cache = match unsafe { device.device.create_pipeline_cache(&cache_info, None) } {
            Ok(cache) => cache,
            // Stale data from another driver can be rejected, start empty
            Err(e) if !initial_data.is_empty() => {
                log::warn!("Pipeline cache {:?} rejected ({}), starting empty", path, e);
                let empty_info = vk::PipelineCacheCreateInfo::builder();
                unsafe { device.device.create_pipeline_cache(&empty_info, None) }
                    .context("Failed to create pipeline cache")?
            }
            Err(e) => return Err(e).context("Failed to create pipeline cache"),
        };

        log::debug!("Pipeline cache ready ({} bytes loaded)", initial_data.len());
        Ok(Self { cache, path })
    }

    /// Write the cache contents back to its file
    pub fn save(&self, device: &VulkanDevice) -> Result<()> {
        let data = unsafe { device.device.get_pipeline_cache_data(self.cache) }
            .context("Failed to read pipeline cache data")?;
        files::write_file(&self.path, &data)?;
        log::debug!("Saved pipeline cache to {:?} ({} bytes)", self.path, data.len());
        Ok(())
    }

    pub fn destroy(&self, device: &VulkanDevice) {
        unsafe { device.device.destroy_pipeline_cache(self.cache, None) };
    }
}

/// Ray tracing pipeline built from the configured shader files
pub struct RayTracingPipeline {
    pub pipeline: vk::Pipeline,
    pub group_count: u32,
}

impl RayTracingPipeline {
    pub fn new(
        device: &VulkanDevice,
        layout: vk::PipelineLayout,
        cache: &PipelineCache,
        shaders: &ShaderConfig,
    ) -> Result<Self> {
        let paths = [
            (shaders.raygen_path(), vk::ShaderStageFlags::RAYGEN_KHR),
            (shaders.miss_path(), vk::ShaderStageFlags::MISS_KHR),
            (shaders.closest_hit_path(), vk::ShaderStageFlags::CLOSEST_HIT_KHR),
        ];

        let mut modules = Vec::with_capacity(paths.len());
        for (path, _) in &paths {
            match load_shader_module(device, path) {
                Ok(module) => modules.push(module),
                Err(e) => {
                    destroy_modules(device, &modules);
                    return Err(e);
                }
            }
        }

        let stages: Vec<_> = modules
            .iter()
            .zip(&paths)
            .map(|(&module, (_, stage))| stage_create_info(module, *stage))
            .collect();
        let groups = shader_groups();

        let depth = recursion_depth(1, device.ray_tracing_limits.max_ray_recursion_depth);
        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(depth)
            .layout(layout)
            .build();

        let pipelines = unsafe {
            device.ray_tracing_pipeline.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                cache.cache,
                &[pipeline_info],
                None,
            )
        };

        // Modules are not needed after creation, successful or not
        destroy_modules(device, &modules);

        let pipeline = pipelines
            .context("Failed to create ray tracing pipeline")?
            .into_iter()
            .next()
            .context("Driver returned no ray tracing pipeline")?;

        log::info!("Ray tracing pipeline created ({} groups, recursion depth {})", GROUP_COUNT, depth);

        Ok(Self {
            pipeline,
            group_count: GROUP_COUNT,
        })
    }

    pub fn destroy(&self, device: &VulkanDevice) {
        unsafe { device.device.destroy_pipeline(self.pipeline, None) };
    }
}

fn destroy_modules(device: &VulkanDevice, modules: &[vk::ShaderModule]) {
    for &module in modules {
        unsafe { device.device.destroy_shader_module(module, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recursion_depth_respects_device_limit() {
        assert_eq!(recursion_depth(1, 31), 1);
        assert_eq!(recursion_depth(4, 2), 2);
        assert_eq!(recursion_depth(0, 31), 1);
    }

    #[test]
    fn groups_reference_their_stages() {
        let groups = shader_groups();

        let raygen = groups[RAYGEN_GROUP as usize];
        assert_eq!(raygen.ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
        assert_eq!(raygen.general_shader, RAYGEN_STAGE);
        assert_eq!(raygen.closest_hit_shader, vk::SHADER_UNUSED_KHR);

        let miss = groups[MISS_GROUP as usize];
        assert_eq!(miss.ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
        assert_eq!(miss.general_shader, MISS_STAGE);

        let hit = groups[HIT_GROUP as usize];
        assert_eq!(hit.ty, vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP);
        assert_eq!(hit.general_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(hit.closest_hit_shader, CLOSEST_HIT_STAGE);
        assert_eq!(hit.any_hit_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(hit.intersection_shader, vk::SHADER_UNUSED_KHR);
    }
}
