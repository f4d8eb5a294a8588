// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Physical device selection (prefer discrete GPU, accept software fallback)
// - Logical device + single graphics queue
// - Command pool with the one reusable primary command buffer
// - Timeline fence and the submit/flush contract built on it

use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use super::sync::TimelineFence;
use crate::error::{RenderError, Result, VkResultExt};

/// Required Vulkan 1.0 device features
const REQUIRED_DEVICE_FEATURES: vk::PhysicalDeviceFeatures = vk::PhysicalDeviceFeatures {
    sampler_anisotropy: vk::TRUE,
    ..unsafe { std::mem::zeroed() }
};

/// Owns the device, the sole graphics queue, the command allocator/list pair
/// and the fence. Every other component borrows this through an `Arc`.
pub struct RenderDevice {
    // Handle order matters for teardown; the allocator must be flushed before
    // the logical device goes away, hence ManuallyDrop.
    allocator: Mutex<ManuallyDrop<Allocator>>,
    fence: Mutex<TimelineFence>,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    entry: Entry,

    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,

    debug_utils: Mutex<Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>>,

    pub properties: vk::PhysicalDeviceProperties,
}

impl RenderDevice {
    /// Create the device. `display` carries the surface extensions the target
    /// window system needs; pass `None` for headless use (tests, readback).
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        display: Option<RawDisplayHandle>,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry =
            unsafe { Entry::load() }.map_err(|e| RenderError::Loader(e.to_string()))?;

        let instance = Self::create_instance(&entry, app_name, enable_validation, display)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let (physical_device, graphics_queue_family) = Self::pick_physical_device(&instance)?;
        let (device, graphics_queue) =
            Self::create_logical_device(&instance, physical_device, graphics_queue_family)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        log::info!(
            "Selected GPU: {} ({:?})",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
            properties.device_type
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        // The single command allocator/list pair, reused every frame. Safe only
        // because flush() runs before each reset (single frame in flight).
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool =
            unsafe { device.create_command_pool(&pool_info, None) }.api("vkCreateCommandPool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { device.allocate_command_buffers(&alloc_info) }
            .api("vkAllocateCommandBuffers")?[0];

        let fence = TimelineFence::new(&device)?;

        Ok(Arc::new(Self {
            allocator: Mutex::new(ManuallyDrop::new(allocator)),
            fence: Mutex::new(fence),
            command_pool,
            command_buffer,
            device,
            physical_device,
            instance,
            entry,
            graphics_queue,
            graphics_queue_family,
            debug_utils: Mutex::new(debug_utils),
            properties,
        }))
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display: Option<RawDisplayHandle>,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name).unwrap_or_default();

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions: Vec<*const i8> = match display {
            Some(display) => ash_window::enumerate_required_extensions(display)
                .api("vkEnumerateInstanceExtensionProperties")?
                .to_vec(),
            None => Vec::new(),
        };
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        unsafe { entry.create_instance(&create_info, None) }.api("vkCreateInstance")
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .api("vkCreateDebugUtilsMessengerEXT")?;

        Ok((debug_utils, messenger))
    }

    /// Pick the best adapter. Discrete GPUs win, integrated next; a software
    /// rasterizer (lavapipe and friends) is the last-resort fallback. Only a
    /// completely empty adapter list is fatal.
    fn pick_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .api("vkEnumeratePhysicalDevices")?;

        if devices.is_empty() {
            return Err(RenderError::NoAdapter);
        }

        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let features = unsafe { instance.get_physical_device_features(device) };

            // Timeline semaphores require 1.2+
            if props.api_version < vk::API_VERSION_1_2 {
                continue;
            }
            if features.sampler_anisotropy != vk::TRUE {
                continue;
            }

            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };
            let graphics_family = queue_families
                .iter()
                .enumerate()
                .find(|(_, props)| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .map(|(i, _)| i as u32);

            if let Some(graphics_family) = graphics_family {
                let score = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                    vk::PhysicalDeviceType::CPU => 10,
                    _ => 1,
                };

                if score > best_score {
                    best_score = score;
                    best_device = Some((device, graphics_family));
                }
            }
        }

        best_device.ok_or(RenderError::NoAdapter)
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extensions = vec![ash::extensions::khr::Swapchain::name().as_ptr()];

        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::builder().timeline_semaphore(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .enabled_features(&REQUIRED_DEVICE_FEATURES)
            .push_next(&mut vulkan12);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .api("vkCreateDevice")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        Ok((device, graphics_queue))
    }

    // ------------------------------------------------------------------
    // Command recording and submission
    // ------------------------------------------------------------------

    /// Reset the command allocator/list pair and open it for recording.
    /// Valid only once all previously submitted work has been flushed.
    pub fn begin_commands(&self) -> Result<vk::CommandBuffer> {
        debug_assert!(
            self.fence.lock().ledger().idle(),
            "command buffer reset while prior submission still in flight"
        );

        unsafe {
            self.device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
        }
        .api("vkResetCommandBuffer")?;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(self.command_buffer, &begin_info) }
            .api("vkBeginCommandBuffer")?;

        Ok(self.command_buffer)
    }

    /// Close the command list. It must be closed before submission.
    pub fn end_commands(&self) -> Result<()> {
        unsafe { self.device.end_command_buffer(self.command_buffer) }.api("vkEndCommandBuffer")
    }

    /// Append the recorded command buffer to the queue's execution order.
    /// Ordering between two submits from this (sole) producer is preserved.
    pub fn submit(
        &self,
        wait_semaphores: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semaphores: &[vk::Semaphore],
    ) -> Result<()> {
        let command_buffers = [self.command_buffer];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(signal_semaphores);

        unsafe {
            self.device.queue_submit(
                self.graphics_queue,
                &[submit_info.build()],
                vk::Fence::null(),
            )
        }
        .api("vkQueueSubmit")
    }

    /// Signal the next fence value on the queue and block until the GPU
    /// reaches it. The only sanctioned way to guarantee prior submissions
    /// are complete before the CPU reuses their resources. Blocks for an
    /// unbounded (in practice sub-frame) duration.
    pub fn flush(&self) -> Result<()> {
        let mut fence = self.fence.lock();
        let value = fence.begin_signal();

        // An empty batch: its signal covers all earlier commands in
        // submission order, exactly the queue-signal fence contract.
        let signal_values = [value];
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
            .signal_semaphore_values(&signal_values);
        let signal_semaphores = [fence.semaphore()];
        let submit_info = vk::SubmitInfo::builder()
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        unsafe {
            self.device.queue_submit(
                self.graphics_queue,
                &[submit_info.build()],
                vk::Fence::null(),
            )
        }
        .api("vkQueueSubmit(flush)")?;

        fence.wait(&self.device, value)
    }

    /// Last value the fence has been asked to signal.
    pub fn signaled_fence_value(&self) -> u64 {
        self.fence.lock().ledger().signaled()
    }

    /// Highest fence value observed complete by the CPU.
    pub fn completed_fence_value(&self) -> u64 {
        self.fence.lock().ledger().completed()
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    pub fn allocate(&self, desc: &AllocationCreateDesc) -> Result<Allocation> {
        Ok(self.allocator.lock().allocate(desc)?)
    }

    pub fn free(&self, allocation: Allocation) {
        if let Err(e) = self.allocator.lock().free(allocation) {
            log::error!("Failed to free GPU allocation: {}", e);
        }
    }

    /// Wait for the device to go fully idle (teardown only).
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.api("vkDeviceWaitIdle")
    }
}

impl Drop for RenderDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            self.fence.lock().destroy(&self.device);
            self.device.destroy_command_pool(self.command_pool, None);

            // The allocator logs leaks on drop and must go before the device.
            ManuallyDrop::drop(&mut *self.allocator.lock());

            if let Some((debug_utils, messenger)) = self.debug_utils.lock().take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time guard: the display handle passed to instance creation and
    // the handles ash-window consumes must come from the same
    // raw-window-handle release.
    #[test]
    fn surface_extensions_enumerate_for_raw_display_handle() {
        let handle =
            RawDisplayHandle::Xlib(raw_window_handle::XlibDisplayHandle::empty());
        let extensions = ash_window::enumerate_required_extensions(handle).unwrap();
        assert!(!extensions.is_empty());
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn flush_retires_all_outstanding_work() {
        let device = RenderDevice::new("device-test", false, None).unwrap();
        assert_eq!(device.signaled_fence_value(), 0);

        device.begin_commands().unwrap();
        device.end_commands().unwrap();
        device.submit(&[], &[], &[]).unwrap();
        device.flush().unwrap();

        assert_eq!(device.signaled_fence_value(), 1);
        assert_eq!(device.completed_fence_value(), 1);

        // The command buffer may be reset again immediately after a flush.
        device.begin_commands().unwrap();
        device.end_commands().unwrap();
        device.submit(&[], &[], &[]).unwrap();
        device.flush().unwrap();
        assert_eq!(device.completed_fence_value(), 2);
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

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
