// Ray tracing renderer
//
// Per frame in flight: one command buffer, one storage image and one
// descriptor set. Each frame traces into the storage image and blits it onto
// the acquired swapchain image.
//
// Scene acceleration structures live until the renderer is dropped and are
// torn down through a deletion queue. Pipeline and shader binding table are
// owned separately so shaders can be reloaded while running.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use crate::backend::acceleration::{AccelerationStructure, InstanceDesc};
use crate::backend::buffer::StorageImage;
use crate::backend::commands::{allocate_command_buffers, create_command_pool, transition_image_layout};
use crate::backend::deletion_queue::DeletionQueue;
use crate::backend::descriptor;
use crate::backend::pipeline::{create_pipeline_layout, PipelineCache, RayTracingPipeline};
use crate::backend::sbt::ShaderBindingTable;
use crate::backend::VulkanDevice;
use crate::camera::Camera;
use crate::config::{Config, ShaderConfig};
use crate::scene::Scene;

pub struct RayTracer {
    device: Arc<VulkanDevice>,
    shaders: ShaderConfig,
    camera: Camera,
    extent: vk::Extent2D,

    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,

    /// Scene BLAS/TLAS, destroyed last-built first
    scene_resources: DeletionQueue<VulkanDevice>,
    tlas: vk::AccelerationStructureKHR,

    set_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,

    pipeline_layout: vk::PipelineLayout,
    pipeline_cache: Option<PipelineCache>,
    pipeline: Option<RayTracingPipeline>,
    sbt: Option<ShaderBindingTable>,

    storage_images: Vec<StorageImage>,
}

impl RayTracer {
    pub fn new(
        device: Arc<VulkanDevice>,
        config: &Config,
        scene: &Scene,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let frames_in_flight = config.graphics.max_frames_in_flight;

        // Null handles are valid to destroy, so a partially built renderer
        // is cleaned up by Drop if any step below fails
        let mut renderer = Self {
            device,
            shaders: config.shaders.clone(),
            camera: Camera::from_config(&config.camera),
            extent,
            command_pool: vk::CommandPool::null(),
            command_buffers: Vec::new(),
            scene_resources: DeletionQueue::new(),
            tlas: vk::AccelerationStructureKHR::null(),
            set_layout: vk::DescriptorSetLayout::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_sets: Vec::new(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline_cache: None,
            pipeline: None,
            sbt: None,
            storage_images: Vec::new(),
        };

        renderer.init(scene, frames_in_flight)?;
        Ok(renderer)
    }

    fn init(&mut self, scene: &Scene, frames_in_flight: usize) -> Result<()> {
        let device = self.device.clone();

        self.command_pool = create_command_pool(&device)?;
        self.command_buffers = allocate_command_buffers(&device, self.command_pool, frames_in_flight as u32)?;

        self.build_scene(scene)?;

        self.set_layout = descriptor::create_set_layout(&device)?;
        self.descriptor_pool = descriptor::create_pool(&device, frames_in_flight as u32)?;
        self.descriptor_sets =
            descriptor::allocate_sets(&device, self.descriptor_pool, self.set_layout, frames_in_flight)?;

        self.pipeline_layout = create_pipeline_layout(&device, self.set_layout)?;
        self.pipeline_cache = Some(PipelineCache::load(&device, &self.shaders.pipeline_cache)?);
        let (pipeline, sbt) = self.build_pipeline()?;
        self.pipeline = Some(pipeline);
        self.sbt = Some(sbt);

        self.create_storage_images(frames_in_flight)?;

        log::info!(
            "Ray tracer ready ({}x{}, {} frames in flight)",
            self.extent.width,
            self.extent.height,
            frames_in_flight
        );
        Ok(())
    }

    /// One BLAS per mesh, one TLAS over all instances
    fn build_scene(&mut self, scene: &Scene) -> Result<()> {
        let device = self.device.clone();

        let mut blas_addresses = Vec::with_capacity(scene.meshes.len());
        for mesh in &scene.meshes {
            let blas = AccelerationStructure::build_bottom_level(
                &device,
                self.command_pool,
                &mesh.vertices,
                &mesh.indices,
            )?;
            blas_addresses.push(blas.address);
            self.scene_resources.push(move |device| blas.destroy(device));
        }

        let instances = scene
            .instances
            .iter()
            .enumerate()
            .map(|(i, instance)| {
                let blas_address = *blas_addresses
                    .get(instance.mesh)
                    .with_context(|| format!("Instance {} references missing mesh {}", i, instance.mesh))?;
                Ok(InstanceDesc {
                    blas_address,
                    transform: instance.transform,
                    custom_index: i as u32,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let tlas = AccelerationStructure::build_top_level(&device, self.command_pool, &instances)?;
        self.tlas = tlas.handle;
        self.scene_resources.push(move |device| tlas.destroy(device));

        log::debug!("Scene holds {} acceleration structures", self.scene_resources.len());
        Ok(())
    }

    fn build_pipeline(&self) -> Result<(RayTracingPipeline, ShaderBindingTable)> {
        let cache = self.pipeline_cache.as_ref().context("Pipeline cache not initialized")?;
        let pipeline = RayTracingPipeline::new(&self.device, self.pipeline_layout, cache, &self.shaders)?;

        match ShaderBindingTable::new(&self.device, &pipeline) {
            Ok(sbt) => Ok((pipeline, sbt)),
            Err(e) => {
                pipeline.destroy(&self.device);
                Err(e)
            }
        }
    }

    fn create_storage_images(&mut self, count: usize) -> Result<()> {
        for &set in &self.descriptor_sets[..count] {
            let image = StorageImage::new(&self.device, self.extent)?;
            descriptor::write_set(&self.device, set, self.tlas, image.view);
            self.storage_images.push(image);
        }
        Ok(())
    }

    fn destroy_storage_images(&mut self) {
        for image in self.storage_images.drain(..) {
            image.destroy(&self.device);
        }
    }

    /// Record frame `frame` targeting `swapchain_image`, returns the buffer to submit
    pub fn record(
        &self,
        frame: usize,
        swapchain_image: vk::Image,
        swapchain_extent: vk::Extent2D,
    ) -> Result<vk::CommandBuffer> {
        let device = &self.device.device;
        let cmd = *self.command_buffers.get(frame).context("Frame index out of range")?;
        let storage = self.storage_images.get(frame).context("No storage image for frame")?;
        let set = self.descriptor_sets[frame];
        let pipeline = self.pipeline.as_ref().context("Pipeline not initialized")?;
        let sbt = self.sbt.as_ref().context("Shader binding table not initialized")?;

        let aspect = self.extent.width as f32 / self.extent.height.max(1) as f32;
        let camera = self.camera.push_constants(aspect);

        unsafe {
            device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(cmd, &begin_info)?;
        }

        // Previous contents are overwritten by every launch
        transition_image_layout(
            device,
            cmd,
            storage.image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        );

        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, pipeline.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.pipeline_layout,
                0,
                &[set],
                &[],
            );
            device.cmd_push_constants(
                cmd,
                self.pipeline_layout,
                vk::ShaderStageFlags::RAYGEN_KHR,
                0,
                bytemuck::bytes_of(&camera),
            );
            self.device.ray_tracing_pipeline.cmd_trace_rays(
                cmd,
                &sbt.raygen_region,
                &sbt.miss_region,
                &sbt.hit_region,
                &sbt.callable_region,
                self.extent.width,
                self.extent.height,
                1,
            );
        }

        transition_image_layout(
            device,
            cmd,
            storage.image,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::AccessFlags::SHADER_WRITE,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            vk::PipelineStageFlags::TRANSFER,
        );

        // Waits on image_available at TRANSFER, so the transition can't start early
        transition_image_layout(
            device,
            cmd,
            swapchain_image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
        );

        let region = blit_region(storage.extent, swapchain_extent);
        unsafe {
            // Blit instead of copy: swapchain format usually differs (BGRA vs RGBA)
            device.cmd_blit_image(
                cmd,
                storage.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                swapchain_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                vk::Filter::NEAREST,
            );
        }

        transition_image_layout(
            device,
            cmd,
            swapchain_image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        );

        unsafe { device.end_command_buffer(cmd)? };
        Ok(cmd)
    }

    /// Recreate storage images for a new swapchain extent
    pub fn resize(&mut self, extent: vk::Extent2D) -> Result<()> {
        if extent == self.extent && !self.storage_images.is_empty() {
            return Ok(());
        }

        self.device.wait_idle()?;
        let count = self.storage_images.len().max(self.descriptor_sets.len());
        self.destroy_storage_images();
        self.extent = extent;
        self.create_storage_images(count)?;

        log::debug!(
            "Storage images resized to {}x{} ({:?})",
            extent.width,
            extent.height,
            StorageImage::FORMAT
        );
        Ok(())
    }

    /// Rebuild pipeline and shader binding table from the shader files on disk.
    /// On failure the current pipeline stays in use.
    pub fn reload_shaders(&mut self) -> Result<()> {
        self.device.wait_idle()?;

        let (pipeline, sbt) = self.build_pipeline().context("Shader reload failed")?;

        if let Some(old) = self.sbt.replace(sbt) {
            old.destroy(&self.device);
        }
        if let Some(old) = self.pipeline.replace(pipeline) {
            old.destroy(&self.device);
        }

        log::info!("Shaders reloaded");
        Ok(())
    }
}

/// Whole-image blit from the storage image onto the swapchain image
fn blit_region(src: vk::Extent2D, dst: vk::Extent2D) -> vk::ImageBlit {
    let layers = vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    };
    let corner = |extent: vk::Extent2D| vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    };

    vk::ImageBlit {
        src_subresource: layers,
        src_offsets: [vk::Offset3D::default(), corner(src)],
        dst_subresource: layers,
        dst_offsets: [vk::Offset3D::default(), corner(dst)],
    }
}

impl Drop for RayTracer {
    fn drop(&mut self) {
        log::info!("Destroying ray tracer...");
        let _ = self.device.wait_idle();

        let device = self.device.clone();

        if let Some(cache) = self.pipeline_cache.as_ref() {
            if let Err(e) = cache.save(&device) {
                log::warn!("Failed to save pipeline cache: {:#}", e);
            }
        }

        self.destroy_storage_images();
        if let Some(sbt) = self.sbt.take() {
            sbt.destroy(&device);
        }
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.destroy(&device);
        }
        if let Some(cache) = self.pipeline_cache.take() {
            cache.destroy(&device);
        }

        unsafe {
            device.device.destroy_pipeline_layout(self.pipeline_layout, None);
            // Frees the sets as well
            device.device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.device.destroy_descriptor_set_layout(self.set_layout, None);
        }

        self.scene_resources.flush(&device);

        // Frees the command buffers as well
        unsafe { device.device.destroy_command_pool(self.command_pool, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blit_covers_both_images() {
        let region = blit_region(
            vk::Extent2D { width: 800, height: 600 },
            vk::Extent2D { width: 1024, height: 768 },
        );

        assert_eq!(region.src_offsets[0], vk::Offset3D::default());
        assert_eq!(region.src_offsets[1], vk::Offset3D { x: 800, y: 600, z: 1 });
        assert_eq!(region.dst_offsets[1], vk::Offset3D { x: 1024, y: 768, z: 1 });
        assert_eq!(region.src_subresource.aspect_mask, vk::ImageAspectFlags::COLOR);
        assert_eq!(region.dst_subresource.layer_count, 1);
    }
}
