// Descriptors for the ray tracing pass
//
// Binding 0: top level acceleration structure
// Binding 1: storage image the ray generation shader writes into

use anyhow::{Context, Result};
use ash::vk;
use super::VulkanDevice;

pub const TLAS_BINDING: u32 = 0;
pub const IMAGE_BINDING: u32 = 1;

/// Bindings of the ray tracing set, all visible to ray generation only
pub fn layout_bindings() -> [vk::DescriptorSetLayoutBinding; 2] {
    [
        vk::DescriptorSetLayoutBinding::builder()
            .binding(TLAS_BINDING)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR)
            .build(),
        vk::DescriptorSetLayoutBinding::builder()
            .binding(IMAGE_BINDING)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR)
            .build(),
    ]
}

/// One pool entry per binding type, sized for `max_sets` sets
pub fn pool_sizes(bindings: &[vk::DescriptorSetLayoutBinding], max_sets: u32) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for binding in bindings {
        let count = binding.descriptor_count * max_sets;
        match sizes.iter_mut().find(|size| size.ty == binding.descriptor_type) {
            Some(size) => size.descriptor_count += count,
            None => sizes.push(vk::DescriptorPoolSize {
                ty: binding.descriptor_type,
                descriptor_count: count,
            }),
        }
    }
    sizes
}

pub fn create_set_layout(device: &VulkanDevice) -> Result<vk::DescriptorSetLayout> {
    let bindings = layout_bindings();
    let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

    unsafe {
        device.device.create_descriptor_set_layout(&layout_info, None)
            .context("Failed to create descriptor set layout")
    }
}

pub fn create_pool(device: &VulkanDevice, max_sets: u32) -> Result<vk::DescriptorPool> {
    let sizes = pool_sizes(&layout_bindings(), max_sets);
    let pool_info = vk::DescriptorPoolCreateInfo::builder()
        .pool_sizes(&sizes)
        .max_sets(max_sets);

    unsafe {
        device.device.create_descriptor_pool(&pool_info, None)
            .context("Failed to create descriptor pool")
    }
}

pub fn allocate_sets(
    device: &VulkanDevice,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    count: usize,
) -> Result<Vec<vk::DescriptorSet>> {
    let layouts = vec![layout; count];
    let alloc_info = vk::DescriptorSetAllocateInfo::builder()
        .descriptor_pool(pool)
        .set_layouts(&layouts);

    unsafe {
        device.device.allocate_descriptor_sets(&alloc_info)
            .context("Failed to allocate descriptor sets")
    }
}

/// Point `set` at the scene TLAS and a storage image view (GENERAL layout)
pub fn write_set(
    device: &VulkanDevice,
    set: vk::DescriptorSet,
    tlas: vk::AccelerationStructureKHR,
    image_view: vk::ImageView,
) {
    let structures = [tlas];
    let mut tlas_info = vk::WriteDescriptorSetAccelerationStructureKHR::builder()
        .acceleration_structures(&structures);

    let mut tlas_write = vk::WriteDescriptorSet::builder()
        .dst_set(set)
        .dst_binding(TLAS_BINDING)
        .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
        .push_next(&mut tlas_info)
        .build();
    // Count comes from the chained struct, the builder can't infer it
    tlas_write.descriptor_count = 1;

    let image_info = [vk::DescriptorImageInfo::builder()
        .image_view(image_view)
        .image_layout(vk::ImageLayout::GENERAL)
        .build()];

    let image_write = vk::WriteDescriptorSet::builder()
        .dst_set(set)
        .dst_binding(IMAGE_BINDING)
        .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
        .image_info(&image_info)
        .build();

    unsafe {
        device.device.update_descriptor_sets(&[tlas_write, image_write], &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindings_are_raygen_only() {
        for binding in layout_bindings() {
            assert_eq!(binding.stage_flags, vk::ShaderStageFlags::RAYGEN_KHR);
            assert_eq!(binding.descriptor_count, 1);
        }
    }

    #[test]
    fn pool_covers_every_set() {
        let sizes = pool_sizes(&layout_bindings(), 3);
        assert_eq!(sizes.len(), 2);
        assert!(sizes.iter().all(|size| size.descriptor_count == 3));
    }

    #[test]
    fn pool_merges_repeated_types() {
        let mut bindings = layout_bindings().to_vec();
        bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(2)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(2)
                .build(),
        );
        let sizes = pool_sizes(&bindings, 2);
        let images = sizes
            .iter()
            .find(|size| size.ty == vk::DescriptorType::STORAGE_IMAGE)
            .map(|size| size.descriptor_count);
        assert_eq!(images, Some(6));
    }
}
