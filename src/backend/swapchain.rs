// Swap chain and render-target rotation
//
// Owns the two presentable back buffers, their views, the depth-stencil image
// and the framebuffers tying them to the render pass. Tracks which back buffer
// is current and rotates after each present. Resize recreates everything, and
// is always preceded by a full queue flush.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::RenderDevice;
use crate::error::{Result, VkResultExt};

/// Requested number of presentable surfaces. The surface may force more.
pub const BACK_BUFFER_COUNT: u32 = 2;

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Rotation state for the back-buffer ring: which buffer is current, advanced
/// once per present. A full cycle of `count` presents returns to the start.
#[derive(Debug, Clone, Copy)]
pub struct BackBufferRing {
    count: usize,
    current: usize,
}

impl BackBufferRing {
    pub fn new(count: usize) -> Self {
        assert!(count > 0);
        Self { count, current: 0 }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn advance(&mut self) -> usize {
        self.current = (self.current + 1) % self.count;
        self.current
    }
}

/// A resize to a zero dimension (minimized window) must be ignored.
pub fn resize_dimensions_valid(width: u32, height: u32) -> bool {
    width > 0 && height > 0
}

pub struct SwapchainTargets {
    swapchain: vk::SwapchainKHR,
    loader: ash::extensions::khr::Swapchain,
    surface: vk::SurfaceKHR,
    surface_loader: ash::extensions::khr::Surface,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    depth_image: vk::Image,
    depth_allocation: Option<Allocation>,
    depth_view: vk::ImageView,
    framebuffers: Vec<vk::Framebuffer>,
    render_pass: vk::RenderPass,
    ring: BackBufferRing,
    present_mode: vk::PresentModeKHR,
    device: Arc<RenderDevice>,
}

impl SwapchainTargets {
    pub fn new(
        device: Arc<RenderDevice>,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        let surface_loader =
            ash::extensions::khr::Surface::new(device.entry(), &device.instance);
        let loader = ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let mut targets = Self {
            swapchain: vk::SwapchainKHR::null(),
            loader,
            surface,
            surface_loader,
            images: Vec::new(),
            image_views: Vec::new(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D::default(),
            depth_image: vk::Image::null(),
            depth_allocation: None,
            depth_view: vk::ImageView::null(),
            framebuffers: Vec::new(),
            render_pass: vk::RenderPass::null(),
            ring: BackBufferRing::new(BACK_BUFFER_COUNT as usize),
            present_mode: preferred_present_mode,
            device,
        };
        targets.create_targets(width, height)?;
        Ok(targets)
    }

    /// Build framebuffers once the render pass exists. Called once at startup.
    pub fn attach_render_pass(&mut self, render_pass: vk::RenderPass) -> Result<()> {
        self.render_pass = render_pass;
        self.create_framebuffers()
    }

    pub fn current_index(&self) -> usize {
        self.ring.current()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.framebuffers[image_index as usize]
    }

    /// Acquire the next presentable image, signalling `semaphore` when the
    /// presentation engine releases it.
    pub fn acquire(&self, semaphore: vk::Semaphore) -> Result<(u32, bool)> {
        unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
        }
        .api("vkAcquireNextImageKHR")
    }

    /// Present the rendered image and rotate the current-buffer index.
    /// The caller guarantees GPU writes to the buffer are complete (the
    /// render pass transitions it to the present state; CPU/GPU sync is the
    /// frame loop's flush).
    pub fn present(
        &mut self,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.loader
                .queue_present(self.device.graphics_queue, &present_info)
        };

        self.ring.advance();

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(result) => Err(crate::error::RenderError::Api {
                call: "vkQueuePresentKHR",
                result,
            }),
        }
    }

    /// Recreate the back buffers, depth image and views at the new size.
    /// A zero dimension is a no-op (minimized window). Flushes the queue
    /// first so no in-flight work still references the old buffers.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<bool> {
        if !resize_dimensions_valid(width, height) {
            return Ok(false);
        }

        log::info!("Resizing swap chain: {}x{}", width, height);
        self.device.flush()?;
        self.destroy_targets();
        self.create_targets(width, height)?;
        if self.render_pass != vk::RenderPass::null() {
            self.create_framebuffers()?;
        }
        Ok(true)
    }

    fn create_targets(&mut self, width: u32, height: u32) -> Result<()> {
        let device = self.device.clone();

        let surface_caps = unsafe {
            self.surface_loader.get_physical_device_surface_capabilities(
                device.physical_device,
                self.surface,
            )
        }
        .api("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;

        let formats = unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(device.physical_device, self.surface)
        }
        .api("vkGetPhysicalDeviceSurfaceFormatsKHR")?;

        let present_modes = unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(device.physical_device, self.surface)
        }
        .api("vkGetPhysicalDeviceSurfacePresentModesKHR")?;

        let surface_format = formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_UNORM
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first())
            .copied()
            .ok_or(crate::error::RenderError::Api {
                call: "vkGetPhysicalDeviceSurfaceFormatsKHR",
                result: vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
            })?;

        // FIFO is always available; anything else only if the surface agrees.
        let present_mode = present_modes
            .iter()
            .copied()
            .find(|&mode| mode == self.present_mode)
            .unwrap_or(vk::PresentModeKHR::FIFO);

        let extent = if surface_caps.current_extent.width != u32::MAX {
            surface_caps.current_extent
        } else {
            vk::Extent2D {
                width: width.clamp(
                    surface_caps.min_image_extent.width,
                    surface_caps.max_image_extent.width,
                ),
                height: height.clamp(
                    surface_caps.min_image_extent.height,
                    surface_caps.max_image_extent.height,
                ),
            }
        };

        // Double buffering; the surface may insist on more.
        let max_count = if surface_caps.max_image_count == 0 {
            u32::MAX
        } else {
            surface_caps.max_image_count
        };
        let image_count = BACK_BUFFER_COUNT.clamp(surface_caps.min_image_count, max_count);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe { self.loader.create_swapchain(&create_info, None) }
            .api("vkCreateSwapchainKHR")?;

        let images = unsafe { self.loader.get_swapchain_images(swapchain) }
            .api("vkGetSwapchainImagesKHR")?;

        log::info!(
            "Created swap chain with {} back buffers ({:?}, {:?})",
            images.len(),
            surface_format.format,
            present_mode
        );

        let image_views = images
            .iter()
            .map(|&image| {
                let view_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(surface_format.format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });
                unsafe { device.device.create_image_view(&view_info, None) }
                    .api("vkCreateImageView")
            })
            .collect::<Result<Vec<_>>>()?;

        let (depth_image, depth_allocation, depth_view) =
            Self::create_depth_buffer(&device, extent)?;

        self.swapchain = swapchain;
        self.images = images;
        self.image_views = image_views;
        self.format = surface_format.format;
        self.extent = extent;
        self.depth_image = depth_image;
        self.depth_allocation = Some(depth_allocation);
        self.depth_view = depth_view;
        self.ring = BackBufferRing::new(self.images.len());

        // The depth image starts in the common (undefined) state and moves to
        // depth-write exactly once per creation.
        self.transition_depth_now()?;

        Ok(())
    }

    fn create_depth_buffer(
        device: &RenderDevice,
        extent: vk::Extent2D,
    ) -> Result<(vk::Image, Allocation, vk::ImageView)> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(DEPTH_FORMAT)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image =
            unsafe { device.device.create_image(&image_info, None) }.api("vkCreateImage")?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let allocation = device.allocate(&AllocationCreateDesc {
            name: "depth buffer",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        }
        .api("vkBindImageMemory")?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(DEPTH_FORMAT)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::DEPTH,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe { device.device.create_image_view(&view_info, None) }
            .api("vkCreateImageView")?;

        Ok((image, allocation, view))
    }

    /// One-time common -> depth-write transition, submitted immediately.
    fn transition_depth_now(&self) -> Result<()> {
        let cmd = self.device.begin_commands()?;

        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.depth_image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::DEPTH,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();

        unsafe {
            self.device.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }

        self.device.end_commands()?;
        self.device.submit(&[], &[], &[])?;
        self.device.flush()
    }

    fn create_framebuffers(&mut self) -> Result<()> {
        self.framebuffers = self
            .image_views
            .iter()
            .map(|&view| {
                let attachments = [view, self.depth_view];
                let framebuffer_info = vk::FramebufferCreateInfo::builder()
                    .render_pass(self.render_pass)
                    .attachments(&attachments)
                    .width(self.extent.width)
                    .height(self.extent.height)
                    .layers(1);
                unsafe { self.device.device.create_framebuffer(&framebuffer_info, None) }
                    .api("vkCreateFramebuffer")
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    fn destroy_targets(&mut self) {
        unsafe {
            for &framebuffer in &self.framebuffers {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
            self.framebuffers.clear();

            if self.depth_view != vk::ImageView::null() {
                self.device.device.destroy_image_view(self.depth_view, None);
                self.depth_view = vk::ImageView::null();
            }
            if self.depth_image != vk::Image::null() {
                self.device.device.destroy_image(self.depth_image, None);
                self.depth_image = vk::Image::null();
            }
            if let Some(allocation) = self.depth_allocation.take() {
                self.device.free(allocation);
            }

            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.image_views.clear();

            if self.swapchain != vk::SwapchainKHR::null() {
                self.loader.destroy_swapchain(self.swapchain, None);
                self.swapchain = vk::SwapchainKHR::null();
            }
        }
    }
}

impl Drop for SwapchainTargets {
    fn drop(&mut self) {
        self.destroy_targets();
        unsafe {
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_returns_to_start_after_full_cycle() {
        let mut ring = BackBufferRing::new(2);
        let initial = ring.current();
        ring.advance();
        assert_ne!(ring.current(), initial);
        ring.advance();
        assert_eq!(ring.current(), initial);
    }

    #[test]
    fn rotation_alternates_between_two_buffers() {
        let mut ring = BackBufferRing::new(2);
        assert_eq!(ring.current(), 0);
        assert_eq!(ring.advance(), 1);
        assert_eq!(ring.advance(), 0);
        assert_eq!(ring.advance(), 1);
    }

    #[test]
    fn zero_dimension_resize_is_rejected() {
        assert!(!resize_dimensions_valid(0, 720));
        assert!(!resize_dimensions_valid(1280, 0));
        assert!(!resize_dimensions_valid(0, 0));
        assert!(resize_dimensions_valid(1, 1));
    }
}
