// Acceleration structures
//
// Bottom level: triangle geometry from vertex/index buffers.
// Top level: instances of bottom level structures with a transform each.
// Both are built once on the GPU with a one-time command buffer.

use anyhow::{Context, Result};
use ash::vk;
use glam::{Affine3A, Mat4};
use gpu_allocator::MemoryLocation;
use super::buffer::{align_up, Buffer};
use super::commands::one_time_submit;
use super::VulkanDevice;

/// Row-major 3x4 transform as the instance buffer expects it
pub fn transform_matrix(transform: &Affine3A) -> vk::TransformMatrixKHR {
    // Columns of the transpose are the rows of `transform`
    let rows = Mat4::from(*transform).transpose().to_cols_array();
    let mut matrix = [0.0; 12];
    matrix.copy_from_slice(&rows[..12]);
    vk::TransformMatrixKHR { matrix }
}

/// One placement of a bottom level structure in the scene
#[derive(Debug, Clone, Copy)]
pub struct InstanceDesc {
    pub blas_address: vk::DeviceAddress,
    pub transform: Affine3A,
    pub custom_index: u32,
}

impl InstanceDesc {
    fn to_vk(self) -> vk::AccelerationStructureInstanceKHR {
        vk::AccelerationStructureInstanceKHR {
            transform: transform_matrix(&self.transform),
            instance_custom_index_and_mask: vk::Packed24_8::new(self.custom_index, 0xFF),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                0,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: self.blas_address,
            },
        }
    }
}

pub struct AccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub address: vk::DeviceAddress,
    buffer: Buffer,
    /// Build inputs kept alive with the structure (vertex/index or instance data)
    inputs: Vec<Buffer>,
}

impl AccelerationStructure {
    pub fn build_bottom_level(
        device: &VulkanDevice,
        pool: vk::CommandPool,
        vertices: &[[f32; 3]],
        indices: &[u32],
    ) -> Result<Self> {
        if vertices.is_empty() || indices.is_empty() || indices.len() % 3 != 0 {
            anyhow::bail!(
                "Bottom level geometry needs vertices and a multiple of 3 indices (got {} / {})",
                vertices.len(),
                indices.len()
            );
        }

        let input_usage = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::STORAGE_BUFFER;
        let vertex_buffer = Buffer::with_data(device, "blas vertices", input_usage, vertices)?;
        let index_buffer = match Buffer::with_data(device, "blas indices", input_usage, indices) {
            Ok(buffer) => buffer,
            Err(e) => {
                vertex_buffer.destroy(device);
                return Err(e);
            }
        };

        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: vertex_buffer.address,
            })
            .vertex_stride(std::mem::size_of::<[f32; 3]>() as vk::DeviceSize)
            .max_vertex(vertices.len() as u32 - 1)
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: index_buffer.address,
            })
            .build();

        let geometry = vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .build();

        let primitive_count = (indices.len() / 3) as u32;
        let blas = Self::build(
            device,
            pool,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            geometry,
            primitive_count,
            vec![vertex_buffer, index_buffer],
        )?;

        log::info!("Built bottom level acceleration structure ({} triangles)", primitive_count);
        Ok(blas)
    }

    pub fn build_top_level(
        device: &VulkanDevice,
        pool: vk::CommandPool,
        instances: &[InstanceDesc],
    ) -> Result<Self> {
        if instances.is_empty() {
            anyhow::bail!("Top level acceleration structure needs at least one instance");
        }

        let vk_instances: Vec<_> = instances.iter().map(|instance| instance.to_vk()).collect();
        let instance_buffer = Buffer::with_bytes(
            device,
            "tlas instances",
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
            instance_bytes(&vk_instances),
        )?;

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: instance_buffer.address,
            })
            .build();

        let geometry = vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: instances_data,
            })
            .build();

        let tlas = Self::build(
            device,
            pool,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            geometry,
            instances.len() as u32,
            vec![instance_buffer],
        )?;

        log::info!("Built top level acceleration structure ({} instances)", instances.len());
        Ok(tlas)
    }

    fn build(
        device: &VulkanDevice,
        pool: vk::CommandPool,
        ty: vk::AccelerationStructureTypeKHR,
        geometry: vk::AccelerationStructureGeometryKHR,
        primitive_count: u32,
        inputs: Vec<Buffer>,
    ) -> Result<Self> {
        let loader = &device.acceleration_structure;
        let geometries = [geometry];

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(ty)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries)
            .build();

        // Query how much memory the structure and its build need
        let sizes = unsafe {
            loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[primitive_count],
            )
        };
        log::debug!(
            "{:?} sizes: structure {} bytes, scratch {} bytes",
            ty,
            sizes.acceleration_structure_size,
            sizes.build_scratch_size
        );

        let buffer = Buffer::new(
            device,
            "acceleration structure",
            sizes.acceleration_structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
        );
        let buffer = match buffer {
            Ok(buffer) => buffer,
            Err(e) => {
                destroy_buffers(device, inputs);
                return Err(e);
            }
        };

        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(buffer.buffer)
            .size(sizes.acceleration_structure_size)
            .ty(ty);

        let handle = match unsafe { loader.create_acceleration_structure(&create_info, None) } {
            Ok(handle) => handle,
            Err(e) => {
                buffer.destroy(device);
                destroy_buffers(device, inputs);
                return Err(e).context("Failed to create acceleration structure");
            }
        };

        // Over-allocate scratch so its address can be aligned
        let scratch_alignment = device.ray_tracing_limits.min_scratch_offset_alignment as u64;
        let scratch = Buffer::new(
            device,
            "acceleration structure scratch",
            sizes.build_scratch_size + scratch_alignment,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
        );
        let scratch = match scratch {
            Ok(scratch) => scratch,
            Err(e) => {
                unsafe { loader.destroy_acceleration_structure(handle, None) };
                buffer.destroy(device);
                destroy_buffers(device, inputs);
                return Err(e);
            }
        };

        build_info.dst_acceleration_structure = handle;
        build_info.scratch_data = vk::DeviceOrHostAddressKHR {
            device_address: align_up(scratch.address, scratch_alignment),
        };

        let range = vk::AccelerationStructureBuildRangeInfoKHR::builder()
            .primitive_count(primitive_count)
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0)
            .build();

        let built = one_time_submit(device, pool, |cmd| unsafe {
            loader.cmd_build_acceleration_structures(cmd, &[build_info], &[&[range]]);
        });
        scratch.destroy(device);

        if let Err(e) = built {
            unsafe { loader.destroy_acceleration_structure(handle, None) };
            buffer.destroy(device);
            destroy_buffers(device, inputs);
            return Err(e).context("Failed to build acceleration structure");
        }

        let address_info = vk::AccelerationStructureDeviceAddressInfoKHR::builder()
            .acceleration_structure(handle);
        let address = unsafe { loader.get_acceleration_structure_device_address(&address_info) };

        Ok(Self {
            handle,
            address,
            buffer,
            inputs,
        })
    }

    pub fn destroy(self, device: &VulkanDevice) {
        unsafe {
            device.acceleration_structure.destroy_acceleration_structure(self.handle, None);
        }
        self.buffer.destroy(device);
        destroy_buffers(device, self.inputs);
    }
}

/// Raw bytes of the instance array as the device reads it.
///
/// `AccelerationStructureInstanceKHR` holds a union and so cannot be `Pod`;
/// it is `repr(C)`, 64 bytes, with no padding between its fields.
fn instance_bytes(instances: &[vk::AccelerationStructureInstanceKHR]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(instances.as_ptr() as *const u8, std::mem::size_of_val(instances))
    }
}

fn destroy_buffers(device: &VulkanDevice, buffers: Vec<Buffer>) {
    for buffer in buffers {
        buffer.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    #[test]
    fn identity_transform() {
        let matrix = transform_matrix(&Affine3A::IDENTITY).matrix;
        assert_eq!(
            matrix,
            [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]
        );
    }

    #[test]
    fn translation_lands_in_last_column() {
        let matrix = transform_matrix(&Affine3A::from_translation(Vec3::new(1.0, 2.0, 3.0))).matrix;
        assert_eq!(matrix[3], 1.0);
        assert_eq!(matrix[7], 2.0);
        assert_eq!(matrix[11], 3.0);
    }

    #[test]
    fn rows_transform_points_like_glam() {
        let transform = Affine3A::from_scale_rotation_translation(
            Vec3::new(2.0, 1.0, 0.5),
            Quat::from_rotation_z(0.7),
            Vec3::new(-1.0, 4.0, 2.0),
        );
        let m = transform_matrix(&transform).matrix;
        let p = Vec3::new(0.3, -1.2, 5.0);

        let by_rows = Vec3::new(
            m[0] * p.x + m[1] * p.y + m[2] * p.z + m[3],
            m[4] * p.x + m[5] * p.y + m[6] * p.z + m[7],
            m[8] * p.x + m[9] * p.y + m[10] * p.z + m[11],
        );
        assert!(by_rows.abs_diff_eq(transform.transform_point3(p), 1e-5));
    }

    #[test]
    fn instance_bytes_cover_whole_records() {
        let desc = InstanceDesc {
            blas_address: 0xdead_0000,
            transform: Affine3A::IDENTITY,
            custom_index: 3,
        };
        let instances = [desc.to_vk(), desc.to_vk()];
        let bytes = instance_bytes(&instances);

        assert_eq!(bytes.len(), 2 * 64);
        assert_eq!(&bytes[0..4], &1.0f32.to_ne_bytes());
        assert_eq!(&bytes[56..64], &0xdead_0000u64.to_ne_bytes());
        assert_eq!(&bytes[64..68], &1.0f32.to_ne_bytes());
    }
}
