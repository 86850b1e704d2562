// Shader binding table
//
// Layout in memory (each region starts on shader_group_base_alignment):
//   [raygen][miss...][hit...]
// Entries inside a region are spaced by the aligned handle size. The raygen
// region holds exactly one entry, so its stride must equal its size.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use super::buffer::{align_up, Buffer};
use super::device::RayTracingLimits;
use super::pipeline::RayTracingPipeline;
use super::VulkanDevice;

/// Offset, stride and size of one region relative to the table start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtRegion {
    pub offset: u64,
    pub stride: u64,
    pub size: u64,
}

impl SbtRegion {
    fn strided(&self, base_address: vk::DeviceAddress) -> vk::StridedDeviceAddressRegionKHR {
        vk::StridedDeviceAddressRegionKHR {
            device_address: base_address + self.offset,
            stride: self.stride,
            size: self.size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u64,
    pub handle_stride: u64,
    pub base_alignment: u64,
    pub miss_count: u32,
    pub hit_count: u32,
    pub raygen: SbtRegion,
    pub miss: SbtRegion,
    pub hit: SbtRegion,
    pub total_size: u64,
}

impl SbtLayout {
    pub fn new(limits: &RayTracingLimits, miss_count: u32, hit_count: u32) -> Self {
        let handle_size = limits.shader_group_handle_size as u64;
        let base_alignment = limits.shader_group_base_alignment as u64;
        let handle_stride = align_up(handle_size, limits.shader_group_handle_alignment as u64);

        let raygen_size = align_up(handle_stride, base_alignment);
        let raygen = SbtRegion {
            offset: 0,
            stride: raygen_size,
            size: raygen_size,
        };

        let miss = SbtRegion {
            offset: raygen.offset + raygen.size,
            stride: handle_stride,
            size: align_up(miss_count as u64 * handle_stride, base_alignment),
        };

        let hit = SbtRegion {
            offset: miss.offset + miss.size,
            stride: handle_stride,
            size: align_up(hit_count as u64 * handle_stride, base_alignment),
        };

        Self {
            handle_size,
            handle_stride,
            base_alignment,
            miss_count,
            hit_count,
            raygen,
            miss,
            hit,
            total_size: hit.offset + hit.size,
        }
    }

    pub fn group_count(&self) -> u32 {
        1 + self.miss_count + self.hit_count
    }

    /// Table offset of every group handle, in pipeline group order
    pub fn group_offsets(&self) -> Vec<u64> {
        let mut offsets = vec![self.raygen.offset];
        offsets.extend((0..self.miss_count as u64).map(|i| self.miss.offset + i * self.miss.stride));
        offsets.extend((0..self.hit_count as u64).map(|i| self.hit.offset + i * self.hit.stride));
        offsets
    }

    /// Scatter tightly packed group handles into table layout
    pub fn fill(&self, handles: &[u8]) -> Result<Vec<u8>> {
        let handle_size = self.handle_size as usize;
        let expected = handle_size * self.group_count() as usize;
        if handles.len() != expected {
            anyhow::bail!("Expected {} bytes of shader group handles, got {}", expected, handles.len());
        }

        let mut table = vec![0u8; self.total_size as usize];
        for (handle, offset) in handles.chunks_exact(handle_size).zip(self.group_offsets()) {
            let offset = offset as usize;
            table[offset..offset + handle_size].copy_from_slice(handle);
        }
        Ok(table)
    }
}

/// Shader binding table buffer plus the regions `cmd_trace_rays` takes
pub struct ShaderBindingTable {
    buffer: Buffer,
    pub raygen_region: vk::StridedDeviceAddressRegionKHR,
    pub miss_region: vk::StridedDeviceAddressRegionKHR,
    pub hit_region: vk::StridedDeviceAddressRegionKHR,
    pub callable_region: vk::StridedDeviceAddressRegionKHR,
}

impl ShaderBindingTable {
    /// One raygen, one miss and one hit group, as the pipeline defines them
    pub fn new(device: &VulkanDevice, pipeline: &RayTracingPipeline) -> Result<Self> {
        let layout = SbtLayout::new(&device.ray_tracing_limits, 1, 1);
        if layout.group_count() != pipeline.group_count {
            anyhow::bail!(
                "Shader binding table expects {} groups, pipeline has {}",
                layout.group_count(),
                pipeline.group_count
            );
        }

        let data_size = layout.handle_size as usize * layout.group_count() as usize;
        let handles = unsafe {
            device.ray_tracing_pipeline.get_ray_tracing_shader_group_handles(
                pipeline.pipeline,
                0,
                layout.group_count(),
                data_size,
            )
        }
        .context("Failed to get shader group handles")?;
        let table = layout.fill(&handles)?;

        // Over-allocate so the table start can be moved onto the base alignment
        let mut buffer = Buffer::new(
            device,
            "shader binding table",
            layout.total_size + layout.base_alignment,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
        )?;

        let base_address = align_up(buffer.address, layout.base_alignment);
        if let Err(e) = buffer.write((base_address - buffer.address) as usize, &table) {
            buffer.destroy(device);
            return Err(e);
        }

        log::debug!(
            "Shader binding table: {} bytes, raygen {:?}, miss {:?}, hit {:?}",
            layout.total_size,
            layout.raygen,
            layout.miss,
            layout.hit
        );

        Ok(Self {
            buffer,
            raygen_region: layout.raygen.strided(base_address),
            miss_region: layout.miss.strided(base_address),
            hit_region: layout.hit.strided(base_address),
            callable_region: vk::StridedDeviceAddressRegionKHR::default(),
        })
    }

    pub fn destroy(self, device: &VulkanDevice) {
        self.buffer.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(handle_size: u32, handle_alignment: u32, base_alignment: u32) -> RayTracingLimits {
        RayTracingLimits {
            shader_group_handle_size: handle_size,
            shader_group_handle_alignment: handle_alignment,
            shader_group_base_alignment: base_alignment,
            max_ray_recursion_depth: 31,
            min_scratch_offset_alignment: 128,
        }
    }

    #[test]
    fn common_desktop_layout() {
        let layout = SbtLayout::new(&limits(32, 32, 64), 1, 1);

        assert_eq!(layout.raygen, SbtRegion { offset: 0, stride: 64, size: 64 });
        assert_eq!(layout.miss, SbtRegion { offset: 64, stride: 32, size: 64 });
        assert_eq!(layout.hit, SbtRegion { offset: 128, stride: 32, size: 64 });
        assert_eq!(layout.total_size, 192);
        assert_eq!(layout.group_offsets(), vec![0, 64, 128]);
    }

    #[test]
    fn handle_alignment_pads_stride() {
        let layout = SbtLayout::new(&limits(20, 32, 64), 3, 2);

        assert_eq!(layout.handle_stride, 32);
        assert_eq!(layout.miss.size, 128);
        assert_eq!(layout.hit.offset, 64 + 128);
        assert_eq!(layout.hit.size, 64);
        assert_eq!(layout.group_offsets(), vec![0, 64, 96, 128, 192, 224]);
    }

    #[test]
    fn regions_start_on_base_alignment() {
        let layout = SbtLayout::new(&limits(32, 32, 128), 2, 3);
        for region in [layout.raygen, layout.miss, layout.hit] {
            assert_eq!(region.offset % 128, 0);
            assert_eq!(region.size % 128, 0);
        }
        assert_eq!(layout.raygen.stride, layout.raygen.size);
    }

    #[test]
    fn fill_places_handles_at_group_offsets() {
        let layout = SbtLayout::new(&limits(4, 4, 16), 1, 1);
        let handles = [1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3];

        let table = layout.fill(&handles).unwrap();
        assert_eq!(table.len(), 48);
        assert_eq!(&table[0..4], &[1, 1, 1, 1]);
        assert_eq!(&table[16..20], &[2, 2, 2, 2]);
        assert_eq!(&table[32..36], &[3, 3, 3, 3]);
        assert!(table[4..16].iter().all(|&b| b == 0));
    }

    #[test]
    fn fill_rejects_wrong_handle_count() {
        let layout = SbtLayout::new(&limits(32, 32, 64), 1, 1);
        assert!(layout.fill(&[0u8; 64]).is_err());
    }

    #[test]
    fn strided_region_adds_base_address() {
        let layout = SbtLayout::new(&limits(32, 32, 64), 1, 1);
        let region = layout.hit.strided(0x1000);
        assert_eq!(region.device_address, 0x1000 + 128);
        assert_eq!(region.stride, 32);
        assert_eq!(region.size, 64);
    }
}
