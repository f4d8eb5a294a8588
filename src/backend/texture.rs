// Texture upload and the shared texture slot table
//
// Each texture is a GPU-only 2D image populated through a transient staging
// buffer recorded into the one-time setup batch. Slot 0 of the table is
// always the fallback 1x1 opaque-white texture; materials with a missing or
// unknown texture reference resolve there, never to an empty slot.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::buffer::create_buffer;
use super::RenderDevice;
use crate::error::{Result, VkResultExt};

/// The image container extension the texture directory is scanned for.
pub const TEXTURE_EXTENSION: &str = "png";

pub struct Texture2D {
    pub name: String,
    image: vk::Image,
    allocation: Option<Allocation>,
    pub view: vk::ImageView,
    staging: Option<(vk::Buffer, Allocation)>,
    device: Arc<RenderDevice>,
}

impl Texture2D {
    /// Decode an image file and record its upload into `cmd`.
    pub fn from_file(
        device: &Arc<RenderDevice>,
        cmd: vk::CommandBuffer,
        path: &Path,
    ) -> Result<Self> {
        let name = texture_key(&path.to_string_lossy()).to_string();
        let image = image::open(path)?.into_rgba8();
        let (width, height) = image.dimensions();
        log::info!("Loaded texture '{}' ({}x{})", name, width, height);
        Self::from_pixels(device, cmd, name, width, height, &image.into_raw())
    }

    /// The 1x1 opaque-white fallback bound wherever no real texture resolves.
    pub fn fallback_white(device: &Arc<RenderDevice>, cmd: vk::CommandBuffer) -> Result<Self> {
        Self::from_pixels(device, cmd, "fallback-white".to_string(), 1, 1, &[255u8; 4])
    }

    fn from_pixels(
        device: &Arc<RenderDevice>,
        cmd: vk::CommandBuffer,
        name: String,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<Self> {
        debug_assert_eq!(pixels.len(), (width * height * 4) as usize);

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(vk::Format::R8G8B8A8_UNORM)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image =
            unsafe { device.device.create_image(&image_info, None) }.api("vkCreateImage")?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let allocation = device.allocate(&AllocationCreateDesc {
            name: "texture",
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

        let (staging, staging_allocation) = create_buffer(
            device,
            "texture staging",
            pixels.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        let mapped = staging_allocation
            .mapped_ptr()
            .expect("texture staging memory must be host-visible");
        unsafe {
            std::ptr::copy_nonoverlapping(
                pixels.as_ptr(),
                mapped.as_ptr() as *mut u8,
                pixels.len(),
            );
        }

        let subresource_range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };

        // common -> copy-destination
        let to_transfer = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(subresource_range)
            .build();

        let copy = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
        };

        // copy-destination -> shader-read
        let to_sampled = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ)
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(subresource_range)
            .build();

        unsafe {
            device.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );
            device.device.cmd_copy_buffer_to_image(
                cmd,
                staging,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy],
            );
            device.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_sampled],
            );
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .subresource_range(subresource_range);
        let view = unsafe { device.device.create_image_view(&view_info, None) }
            .api("vkCreateImageView")?;

        Ok(Self {
            name,
            image,
            allocation: Some(allocation),
            view,
            staging: Some((staging, staging_allocation)),
            device: device.clone(),
        })
    }

    /// Discard the transient upload heap after the setup batch has flushed.
    pub fn release_staging(&mut self) {
        if let Some((staging, allocation)) = self.staging.take() {
            unsafe {
                self.device.device.destroy_buffer(staging, None);
            }
            self.device.free(allocation);
        }
    }
}

impl Drop for Texture2D {
    fn drop(&mut self) {
        self.release_staging();
        unsafe {
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            self.device.free(allocation);
        }
    }
}

pub fn is_texture_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case(TEXTURE_EXTENSION))
        .unwrap_or(false)
}

/// Scan a directory for texture files, sorted for a stable load order.
/// A missing directory is treated as an empty set, not an error.
pub fn scan_texture_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        log::warn!("Texture directory {:?} not found, using fallback only", dir);
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_texture_file(path))
        .collect();
    paths.sort();
    Ok(paths)
}

/// Normalize a material's texture reference or a file path to a bare stem:
/// directories and the extension are stripped. Matching is case-sensitive.
pub fn texture_key(reference: &str) -> &str {
    let trimmed = reference
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(reference);
    trimmed.split('.').next().unwrap_or(trimmed)
}

/// Maps material texture references to descriptor slots. Slot 0 is the
/// fallback texture; loaded scene textures occupy 1..len in first-seen order.
#[derive(Debug, Default)]
pub struct SlotMap {
    names: Vec<String>,
}

impl SlotMap {
    /// `referenced` is the scene's unique texture references in first-seen
    /// order; only those actually loaded get a slot.
    pub fn new<I, S>(referenced: I, loaded: &[String]) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = referenced
            .into_iter()
            .map(|r| texture_key(r.as_ref()).to_string())
            .filter(|key| loaded.iter().any(|l| l == key))
            .collect();
        Self { names }
    }

    /// Slot count including the fallback at 0.
    pub fn len(&self) -> usize {
        self.names.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false // the fallback slot always exists
    }

    /// Resolve a material's texture reference to a slot. Empty, missing and
    /// unknown references all land on the fallback slot 0.
    pub fn resolve(&self, reference: Option<&str>) -> usize {
        match reference {
            Some(r) if !r.is_empty() => {
                let key = texture_key(r);
                self.names
                    .iter()
                    .position(|n| n == key)
                    .map(|i| i + 1)
                    .unwrap_or(0)
            }
            _ => 0,
        }
    }

    /// Slot index of a loaded texture by its key name.
    pub fn slot_of(&self, key: &str) -> Option<usize> {
        self.names.iter().position(|n| n == key).map(|i| i + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_strips_directories_and_extension() {
        assert_eq!(texture_key("textures/sponza_thorn_diff.png"), "sponza_thorn_diff");
        assert_eq!(texture_key("brick.png"), "brick");
        assert_eq!(texture_key(r"tex\sub\wood.PNG"), "wood");
        assert_eq!(texture_key("plain"), "plain");
    }

    #[test]
    fn empty_reference_resolves_to_fallback() {
        let slots = SlotMap::new(["brick.png"], &["brick".to_string()]);
        assert_eq!(slots.resolve(None), 0);
        assert_eq!(slots.resolve(Some("")), 0);
    }

    #[test]
    fn unknown_reference_resolves_to_fallback() {
        let slots = SlotMap::new(["brick.png"], &["brick".to_string()]);
        assert_eq!(slots.resolve(Some("marble.png")), 0);
    }

    #[test]
    fn loaded_references_get_slots_in_first_seen_order() {
        let loaded = vec!["brick".to_string(), "wood".to_string()];
        let slots = SlotMap::new(["wood.png", "brick.png"], &loaded);
        assert_eq!(slots.len(), 3);
        assert_eq!(slots.resolve(Some("wood.png")), 1);
        assert_eq!(slots.resolve(Some("brick.png")), 2);
    }

    #[test]
    fn referenced_but_unloaded_texture_falls_back() {
        let loaded = vec!["brick".to_string()];
        let slots = SlotMap::new(["wood.png", "brick.png"], &loaded);
        assert_eq!(slots.len(), 2);
        assert_eq!(slots.resolve(Some("wood.png")), 0);
        assert_eq!(slots.resolve(Some("brick.png")), 1);
    }

    #[test]
    fn texture_file_filter_matches_extension_only() {
        assert!(is_texture_file(Path::new("a/b.png")));
        assert!(is_texture_file(Path::new("a/b.PNG")));
        assert!(!is_texture_file(Path::new("a/b.dds")));
        assert!(!is_texture_file(Path::new("a/png")));
    }
}
