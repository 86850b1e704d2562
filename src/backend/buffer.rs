// GPU buffers and images
//
// Every handle is bundled with its gpu-allocator allocation. Buffers used by
// the ray tracing pipeline also carry their device address.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::NoUninit;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use super::VulkanDevice;

/// Round `value` up to a multiple of `alignment` (power of two or zero)
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        value
    } else {
        (value + alignment - 1) & !(alignment - 1)
    }
}

/// Buffer handle plus memory, size and (optional) device address
pub struct Buffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    pub address: vk::DeviceAddress,
    allocation: Option<Allocation>,
}

impl Buffer {
    pub fn new(
        device: &VulkanDevice,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device.device.create_buffer(&buffer_info, None)
                .with_context(|| format!("Failed to create buffer '{}'", name))?
        };

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device
            .allocator()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| format!("Failed to allocate memory for buffer '{}'", name));
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            device.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .with_context(|| format!("Failed to bind memory for buffer '{}'", name))
        };
        if let Err(e) = bound {
            unsafe { device.device.destroy_buffer(buffer, None) };
            free_allocation(device, allocation);
            return Err(e);
        }

        let address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            device.buffer_address(buffer)
        } else {
            0
        };

        log::trace!("Created buffer '{}' ({} bytes)", name, size);

        Ok(Self {
            buffer,
            size,
            address,
            allocation: Some(allocation),
        })
    }

    /// Create a host visible buffer and fill it with `data`
    pub fn with_data<T: NoUninit>(
        device: &VulkanDevice,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        Self::with_bytes(device, name, usage, bytemuck::cast_slice(data))
    }

    /// Create a host visible buffer holding `bytes`
    pub fn with_bytes(
        device: &VulkanDevice,
        name: &str,
        usage: vk::BufferUsageFlags,
        bytes: &[u8],
    ) -> Result<Self> {
        let mut buffer = Self::new(device, name, bytes.len() as vk::DeviceSize, usage, MemoryLocation::CpuToGpu)?;
        if let Err(e) = buffer.write(0, bytes) {
            buffer.destroy(device);
            return Err(e);
        }
        Ok(buffer)
    }

    /// Copy `data` into the mapped memory at byte `offset`
    pub fn write<T: NoUninit>(&mut self, offset: usize, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);

        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .context("Buffer is not host visible")?;

        let end = offset + bytes.len();
        if end > mapped.len() {
            anyhow::bail!("Write of {} bytes at {} overflows buffer of {}", bytes.len(), offset, mapped.len());
        }
        mapped[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn destroy(mut self, device: &VulkanDevice) {
        log::trace!("Destroying buffer ({} bytes)", self.size);
        unsafe { device.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            free_allocation(device, allocation);
        }
    }
}

/// Image the ray generation shader writes into, one per frame in flight
pub struct StorageImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    allocation: Option<Allocation>,
}

impl StorageImage {
    pub const FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

    pub fn new(device: &VulkanDevice, extent: vk::Extent2D) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(Self::FORMAT)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe {
            device.device.create_image(&image_info, None)
                .context("Failed to create storage image")?
        };

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let allocation = device
            .allocator()
            .allocate(&AllocationCreateDesc {
                name: "storage image",
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .context("Failed to allocate storage image memory");
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            device.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .context("Failed to bind storage image memory")
        };
        if let Err(e) = bound {
            unsafe { device.device.destroy_image(image, None) };
            free_allocation(device, allocation);
            return Err(e);
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(Self::FORMAT)
            .subresource_range(color_subresource_range());

        let view = match unsafe { device.device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                free_allocation(device, allocation);
                return Err(e).context("Failed to create storage image view");
            }
        };

        Ok(Self {
            image,
            view,
            extent,
            allocation: Some(allocation),
        })
    }

    pub fn destroy(mut self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_image_view(self.view, None);
            device.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            free_allocation(device, allocation);
        }
    }
}

fn free_allocation(device: &VulkanDevice, allocation: Allocation) {
    if let Err(e) = device.allocator().free(allocation) {
        log::error!("Failed to free GPU memory: {}", e);
    }
}

/// Whole single-mip, single-layer color image
pub fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiples() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(33, 32), 64);
        assert_eq!(align_up(17, 0), 17);
    }
}
