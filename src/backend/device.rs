// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Window surface creation
// - Physical device selection (ray tracing capable, prefer discrete GPU)
// - Logical device + queue creation with the ray tracing feature chain
// - Ray tracing extension loaders and limits
// - Memory allocator setup

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;
use winit::window::Window;
use super::deletion_queue::unwind_on_error;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Core device features for our renderer (1.2 and extension features are chained separately)
const REQUIRED_DEVICE_FEATURES: vk::PhysicalDeviceFeatures = vk::PhysicalDeviceFeatures {
    sampler_anisotropy: vk::TRUE,
    ..unsafe { std::mem::zeroed() }
};

/// Device extensions needed to present and to trace rays. All must be present.
pub fn required_device_extensions() -> [&'static CStr; 4] {
    [
        khr::Swapchain::name(),
        khr::AccelerationStructure::name(),
        khr::RayTracingPipeline::name(),
        khr::DeferredHostOperations::name(),
    ]
}

/// Return the required extensions missing from `available`
pub fn missing_extensions<'a>(
    available: &[vk::ExtensionProperties],
    required: &[&'a CStr],
) -> Vec<&'a CStr> {
    let available: Vec<&CStr> = available
        .iter()
        .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) })
        .collect();

    required
        .iter()
        .copied()
        .filter(|name| !available.contains(name))
        .collect()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// (graphics, present) once both have been found
    pub fn families(&self) -> Option<(u32, u32)> {
        self.graphics.zip(self.present)
    }
}

/// Pick graphics and present queue families, preferring one family that does both
pub fn find_queue_families(
    families: &[vk::QueueFamilyProperties],
    supports_present: impl Fn(u32) -> bool,
) -> QueueFamilyIndices {
    let mut indices = QueueFamilyIndices::default();

    for (i, family) in families.iter().enumerate() {
        if family.queue_count == 0 {
            continue;
        }
        let index = i as u32;
        let graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let present = supports_present(index);

        if graphics && present {
            return QueueFamilyIndices {
                graphics: Some(index),
                present: Some(index),
            };
        }
        if graphics && indices.graphics.is_none() {
            indices.graphics = Some(index);
        }
        if present && indices.present.is_none() {
            indices.present = Some(index);
        }
    }

    indices
}

/// Limits that shape the shader binding table and acceleration structure builds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayTracingLimits {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
    pub min_scratch_offset_alignment: u32,
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Vulkan handles (destroyed explicitly in Drop, allocator first)
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub surface: vk::SurfaceKHR,
    pub surface_loader: khr::Surface,
    pub instance: ash::Instance,
    _entry: Entry,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub present_queue: vk::Queue,
    pub present_queue_family: u32,

    // Debug utils (if validation enabled)
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Ray tracing extension entry points
    pub acceleration_structure: khr::AccelerationStructure,
    pub ray_tracing_pipeline: khr::RayTracingPipeline,
    pub ray_tracing_limits: RayTracingLimits,

    // Device properties (cached for performance)
    pub properties: vk::PhysicalDeviceProperties,
}

impl VulkanDevice {
    /// Create Vulkan device presenting to `window`
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `window` - Window the surface is created for
    /// * `enable_validation` - Enable Vulkan validation layers (debug only)
    pub fn new(app_name: &str, window: &Window, enable_validation: bool) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let enable_validation = enable_validation && Self::validation_layer_available(&entry)?;

        // Everything created below is destroyed again if a later step fails
        unwind_on_error(&(), move |created| {
            // Step 2: Create instance
            let instance = Self::create_instance(&entry, app_name, window, enable_validation)?;
            let handle = instance.clone();
            created.push(move |_| unsafe { handle.destroy_instance(None) });
            log::debug!("Created instance");

            // Step 3: Setup debug messenger if validation enabled
            let debug_utils = if enable_validation {
                let (loader, messenger) = Self::setup_debug_messenger(&entry, &instance)?;
                let handle = loader.clone();
                created.push(move |_| unsafe { handle.destroy_debug_utils_messenger(messenger, None) });
                Some((loader, messenger))
            } else {
                None
            };

            // Step 4: Create surface (platform-specific window connection)
            let surface = unsafe {
                ash_window::create_surface(
                    &entry,
                    &instance,
                    window.raw_display_handle(),
                    window.raw_window_handle(),
                    None,
                )
            }
            .context("Failed to create window surface")?;
            let surface_loader = khr::Surface::new(&entry, &instance);
            let handle = surface_loader.clone();
            created.push(move |_| unsafe { handle.destroy_surface(surface, None) });
            log::debug!("Created surface");

            // Step 5: Pick physical device (GPU)
            let (physical_device, graphics_queue_family, present_queue_family) =
                Self::pick_physical_device(&instance, &surface_loader, surface)?;

            // Step 6: Create logical device
            let device = Self::create_logical_device(
                &instance,
                physical_device,
                graphics_queue_family,
                present_queue_family,
            )?;
            let handle = device.clone();
            created.push(move |_| unsafe { handle.destroy_device(None) });
            let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };
            let present_queue = unsafe { device.get_device_queue(present_queue_family, 0) };

            // Step 7: Cache device properties and ray tracing limits
            let (properties, ray_tracing_limits) =
                Self::query_properties(&instance, physical_device);

            log::info!("Selected GPU: {}",
                unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
                    .to_string_lossy());
            log::info!("API Version: {}.{}.{}",
                vk::api_version_major(properties.api_version),
                vk::api_version_minor(properties.api_version),
                vk::api_version_patch(properties.api_version));
            log::debug!("Ray tracing limits: {:?}", ray_tracing_limits);

            // Step 8: Ray tracing loaders
            let acceleration_structure = khr::AccelerationStructure::new(&instance, &device);
            let ray_tracing_pipeline = khr::RayTracingPipeline::new(&instance, &device);

            // Step 9: Create memory allocator
            let allocator = Self::create_allocator(&instance, physical_device, &device)?;

            Ok(Arc::new(Self {
                allocator: ManuallyDrop::new(Mutex::new(allocator)),
                device,
                physical_device,
                surface,
                surface_loader,
                instance,
                _entry: entry,
                graphics_queue,
                graphics_queue_family,
                present_queue,
                present_queue_family,
                debug_utils,
                acceleration_structure,
                ray_tracing_pipeline,
                ray_tracing_limits,
                properties,
            }))
        })
    }

    fn validation_layer_available(entry: &Entry) -> Result<bool> {
        let layers = entry.enumerate_instance_layer_properties()?;
        let found = layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);

        if !found {
            log::warn!("Validation layer {:?} not installed, continuing without it", VALIDATION_LAYER);
        }
        Ok(found)
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        window: &Window,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("No Engine")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);

        // Surface extensions for whatever platform the window lives on
        let mut extensions =
            ash_window::enumerate_required_extensions(window.raw_display_handle())
                .context("Window system is not supported by Vulkan")?
                .to_vec();

        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        // Validation layers
        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe {
            debug_utils.create_debug_utils_messenger(&create_info, None)
        }
        .context("Failed to create debug messenger")?;
        log::debug!("Created debug messenger");

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, u32, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let required = required_device_extensions();

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy();

            // Check required extensions
            let available = unsafe { instance.enumerate_device_extension_properties(device) }?;
            let missing = missing_extensions(&available, &required);
            if !missing.is_empty() {
                log::info!("Skipping {}: missing extensions {:?}", name, missing);
                continue;
            }

            // Check required features
            if !Self::check_device_features(instance, device) {
                log::info!("Skipping {}: ray tracing features not supported", name);
                continue;
            }

            // The surface must be presentable with at least one format and mode
            let formats = unsafe {
                surface_loader.get_physical_device_surface_formats(device, surface)
            }?;
            let present_modes = unsafe {
                surface_loader.get_physical_device_surface_present_modes(device, surface)
            }?;
            if formats.is_empty() || present_modes.is_empty() {
                log::info!("Skipping {}: surface has no formats or present modes", name);
                continue;
            }

            // Find graphics and present queue families
            let queue_families = unsafe {
                instance.get_physical_device_queue_family_properties(device)
            };
            let indices = find_queue_families(&queue_families, |index| unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, index, surface)
                    .unwrap_or(false)
            });

            if let Some((graphics, present)) = indices.families() {
                // Score device (prefer discrete GPU)
                let score = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                    _ => 1,
                };

                if score > best_score {
                    best_score = score;
                    best_device = Some((device, graphics, present));
                }
            } else {
                log::info!("Skipping {}: no graphics/present queue", name);
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("No GPU with hardware ray tracing support found"))
    }

    fn check_device_features(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::builder()
            .push_next(&mut features12)
            .push_next(&mut as_features)
            .push_next(&mut rt_features);

        unsafe { instance.get_physical_device_features2(device, &mut features2) };
        let sampler_anisotropy = features2.features.sampler_anisotropy;

        sampler_anisotropy == vk::TRUE
            && features12.buffer_device_address == vk::TRUE
            && features12.descriptor_indexing == vk::TRUE
            && as_features.acceleration_structure == vk::TRUE
            && rt_features.ray_tracing_pipeline == vk::TRUE
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
        present_queue_family: u32,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let mut unique_families = vec![graphics_queue_family];
        if present_queue_family != graphics_queue_family {
            unique_families.push(present_queue_family);
        }

        let queue_create_infos: Vec<_> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        // Required device extensions
        let extensions: Vec<*const c_char> = required_device_extensions()
            .iter()
            .map(|name| name.as_ptr())
            .collect();

        // Feature chain: device addresses for AS/SBT, descriptor indexing, ray tracing
        let mut features12 = vk::PhysicalDeviceVulkan12Features::builder()
            .buffer_device_address(true)
            .descriptor_indexing(true);
        let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder()
            .acceleration_structure(true);
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder()
            .ray_tracing_pipeline(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&REQUIRED_DEVICE_FEATURES)
            .push_next(&mut features12)
            .push_next(&mut as_features)
            .push_next(&mut rt_features);

        let device = unsafe {
            instance.create_device(physical_device, &create_info, None)
        }
        .context("Failed to create logical device")?;
        log::debug!("Created logical device");

        Ok(device)
    }

    fn query_properties(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> (vk::PhysicalDeviceProperties, RayTracingLimits) {
        let mut rt_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut as_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::builder()
            .push_next(&mut rt_properties)
            .push_next(&mut as_properties);

        unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };
        let properties = properties2.properties;

        let limits = RayTracingLimits {
            shader_group_handle_size: rt_properties.shader_group_handle_size,
            shader_group_handle_alignment: rt_properties.shader_group_handle_alignment,
            shader_group_base_alignment: rt_properties.shader_group_base_alignment,
            max_ray_recursion_depth: rt_properties.max_ray_recursion_depth,
            min_scratch_offset_alignment: as_properties
                .min_acceleration_structure_scratch_offset_alignment,
        };

        (properties, limits)
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true, // Acceleration structures and SBT need device addresses
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU allocator")?;

        Ok(allocator)
    }

    /// Lock the GPU memory allocator
    pub fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock()
    }

    /// Device address of a buffer created with SHADER_DEVICE_ADDRESS usage
    pub fn buffer_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
        unsafe { self.device.get_buffer_device_address(&info) }
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
            // Allocator frees its memory blocks through the device
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Log level for a validation message; verbose and info go to debug
fn validation_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> log::Level {
    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::Level::Error,
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::Level::Warn,
        _ => log::Level::Debug,
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);
    log::log!(validation_level(message_severity), "[validation] {}", message.to_string_lossy());

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extension(name: &CStr) -> vk::ExtensionProperties {
        let mut props = vk::ExtensionProperties::default();
        for (dst, &src) in props.extension_name.iter_mut().zip(name.to_bytes()) {
            *dst = src as c_char;
        }
        props
    }

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn all_required_extensions_must_be_present() {
        let required = required_device_extensions();
        let all: Vec<_> = required.iter().map(|name| extension(name)).collect();
        assert!(missing_extensions(&all, &required).is_empty());

        // Only the swapchain: every ray tracing extension is reported
        let partial = vec![extension(khr::Swapchain::name())];
        let missing = missing_extensions(&partial, &required);
        assert_eq!(missing.len(), 3);
        assert!(!missing.contains(&khr::Swapchain::name()));
        assert!(missing.contains(&khr::RayTracingPipeline::name()));
    }

    #[test]
    fn prefers_family_with_graphics_and_present() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, 1),
            family(vk::QueueFlags::COMPUTE, 1),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1),
        ];
        let indices = find_queue_families(&families, |i| i != 0);
        assert_eq!(indices.graphics, Some(2));
        assert_eq!(indices.present, Some(2));
    }

    #[test]
    fn separate_graphics_and_present_families() {
        let families = [
            family(vk::QueueFlags::TRANSFER, 1),
            family(vk::QueueFlags::GRAPHICS, 1),
        ];
        let indices = find_queue_families(&families, |i| i == 0);
        assert_eq!(indices.families(), Some((1, 0)));
        assert_eq!(indices.graphics, Some(1));
        assert_eq!(indices.present, Some(0));
    }

    #[test]
    fn empty_families_are_ignored() {
        let families = [family(vk::QueueFlags::GRAPHICS, 0)];
        let indices = find_queue_families(&families, |_| true);
        assert_eq!(indices.families(), None);
        assert_eq!(indices, QueueFamilyIndices::default());
    }

    #[test]
    fn validation_severity_maps_to_log_level() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;

        assert_eq!(validation_level(Severity::ERROR), log::Level::Error);
        assert_eq!(validation_level(Severity::WARNING), log::Level::Warn);
        assert_eq!(validation_level(Severity::INFO), log::Level::Debug);
        assert_eq!(validation_level(Severity::VERBOSE), log::Level::Debug);
    }
}
