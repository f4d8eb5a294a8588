// Resource staging: default (GPU-only) buffers and upload (CPU-writable) rings
//
// Immutable mesh data travels CPU -> staging buffer -> GPU-only buffer via a
// recorded copy. The staging buffer must stay alive until the enclosing
// submission has been flushed; `DefaultBuffer` owns it until `release_staging`.

use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::marker::PhantomData;
use std::sync::Arc;

use super::RenderDevice;
use crate::error::{RenderError, Result, VkResultExt};

/// Minimum constant-buffer slot alignment. Device limits may demand more but
/// are usually at or below this.
pub const CONSTANT_ALIGNMENT: u64 = 256;

/// Round an element size up to a whole number of `align`-byte units.
pub fn aligned_slot_stride(elem_size: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (elem_size + align - 1) & !(align - 1)
}

pub(crate) fn create_buffer(
    device: &RenderDevice,
    name: &str,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
) -> Result<(vk::Buffer, Allocation)> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer =
        unsafe { device.device.create_buffer(&buffer_info, None) }.api("vkCreateBuffer")?;

    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

    let allocation = device.allocate(&AllocationCreateDesc {
        name,
        requirements,
        location,
        linear: true,
        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    })?;

    unsafe {
        device
            .device
            .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
    }
    .api("vkBindBufferMemory")?;

    Ok((buffer, allocation))
}

/// GPU-only buffer, immutable once the setup submission has been flushed.
pub struct DefaultBuffer {
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    staging: Option<(vk::Buffer, Allocation)>,
    size: vk::DeviceSize,
    device: Arc<RenderDevice>,
}

impl DefaultBuffer {
    /// Stage `bytes` into a new GPU-only buffer. The copy is recorded into
    /// `cmd`; the content is defined only after that command list has been
    /// submitted and flushed. Empty input is rejected.
    pub fn upload_immutable(
        device: &Arc<RenderDevice>,
        cmd: vk::CommandBuffer,
        bytes: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        if bytes.is_empty() {
            return Err(RenderError::EmptyUpload);
        }
        let size = bytes.len() as vk::DeviceSize;

        let (buffer, allocation) = create_buffer(
            device,
            "default buffer",
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::GpuOnly,
        )?;

        let (staging, staging_allocation) = create_buffer(
            device,
            "default buffer staging",
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;

        // CpuToGpu memory is persistently mapped by the allocator.
        let mapped = staging_allocation
            .mapped_ptr()
            .expect("staging memory must be host-visible");
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), mapped.as_ptr() as *mut u8, bytes.len());
        }

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe {
            device
                .device
                .cmd_copy_buffer(cmd, staging, buffer, &[region]);
        }

        // Copy-destination -> generic-read transition for the new buffer.
        let barrier = vk::BufferMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer)
            .size(size)
            .build();
        unsafe {
            device.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }

        Ok(Self {
            buffer,
            allocation: Some(allocation),
            staging: Some((staging, staging_allocation)),
            size,
            device: device.clone(),
        })
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Discard the staging buffer. Only valid after the submission carrying
    /// the upload copy has been flushed.
    pub fn release_staging(&mut self) {
        if let Some((staging, allocation)) = self.staging.take() {
            unsafe {
                self.device.device.destroy_buffer(staging, None);
            }
            self.device.free(allocation);
        }
    }

    /// Debug copy-back path: read the GPU-resident content back to the CPU.
    /// Issues its own submission and flush, so it must not be called while a
    /// frame is being recorded.
    pub fn read_back(&self) -> Result<Vec<u8>> {
        let (readback, readback_allocation) = create_buffer(
            &self.device,
            "readback buffer",
            self.size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
        )?;

        let cmd = self.device.begin_commands()?;
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: self.size,
        };
        unsafe {
            self.device
                .device
                .cmd_copy_buffer(cmd, self.buffer, readback, &[region]);
        }
        self.device.end_commands()?;
        self.device.submit(&[], &[], &[])?;
        self.device.flush()?;

        let mapped = readback_allocation
            .mapped_ptr()
            .expect("readback memory must be host-visible");
        let mut out = vec![0u8; self.size as usize];
        unsafe {
            std::ptr::copy_nonoverlapping(mapped.as_ptr() as *const u8, out.as_mut_ptr(), out.len());
        }

        unsafe {
            self.device.device.destroy_buffer(readback, None);
        }
        self.device.free(readback_allocation);

        Ok(out)
    }
}

impl Drop for DefaultBuffer {
    fn drop(&mut self) {
        self.release_staging();
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
        }
        if let Some(allocation) = self.allocation.take() {
            self.device.free(allocation);
        }
    }
}

/// Persistently mapped constant-buffer ring with alignment-padded slots.
/// Writing a slot is a plain memcpy, safe at any time because the frame loop
/// never reuses a slot the GPU might still be reading.
pub struct UploadRing<T: Pod> {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    mapped: *mut u8,
    stride: u64,
    slot_count: usize,
    device: Arc<RenderDevice>,
    _marker: PhantomData<T>,
}

impl<T: Pod> UploadRing<T> {
    pub fn new(device: &Arc<RenderDevice>, slot_count: usize) -> Result<Self> {
        assert!(slot_count > 0);

        let min_align = device
            .properties
            .limits
            .min_uniform_buffer_offset_alignment
            .max(CONSTANT_ALIGNMENT);
        let stride = aligned_slot_stride(std::mem::size_of::<T>() as u64, min_align);

        let (buffer, allocation) = create_buffer(
            device,
            "constant ring",
            stride * slot_count as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
        )?;

        let mapped = allocation
            .mapped_ptr()
            .expect("constant ring memory must be host-visible")
            .as_ptr() as *mut u8;

        Ok(Self {
            buffer,
            allocation: Some(allocation),
            mapped,
            stride,
            slot_count,
            device: device.clone(),
            _marker: PhantomData,
        })
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Byte offset of a slot, for descriptor binding.
    pub fn slot_offset(&self, slot: usize) -> vk::DeviceSize {
        assert!(slot < self.slot_count);
        self.stride * slot as u64
    }

    /// Padded slot size, the range a constant-buffer view covers.
    pub fn slot_stride(&self) -> vk::DeviceSize {
        self.stride
    }

    /// Synchronous copy of `value` into `slot`.
    pub fn write(&self, slot: usize, value: &T) {
        assert!(slot < self.slot_count);
        let bytes = bytemuck::bytes_of(value);
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.mapped.add((self.stride * slot as u64) as usize),
                bytes.len(),
            );
        }
    }
}

impl<T: Pod> Drop for UploadRing<T> {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
        }
        if let Some(allocation) = self.allocation.take() {
            self.device.free(allocation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_stride_pads_to_alignment() {
        assert_eq!(aligned_slot_stride(1, 256), 256);
        assert_eq!(aligned_slot_stride(256, 256), 256);
        assert_eq!(aligned_slot_stride(257, 256), 512);
        assert_eq!(aligned_slot_stride(144, 256), 256);
    }

    #[test]
    fn slot_stride_zero_stays_zero() {
        assert_eq!(aligned_slot_stride(0, 256), 0);
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn upload_then_read_back_round_trips() {
        let device = RenderDevice::new("buffer-test", false, None).unwrap();

        let bytes: Vec<u8> = (0u32..4096).map(|i| (i % 251) as u8).collect();
        let cmd = device.begin_commands().unwrap();
        let mut buffer = DefaultBuffer::upload_immutable(
            &device,
            cmd,
            &bytes,
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )
        .unwrap();
        let empty = DefaultBuffer::upload_immutable(
            &device,
            cmd,
            &[],
            vk::BufferUsageFlags::VERTEX_BUFFER,
        );
        assert!(matches!(empty, Err(RenderError::EmptyUpload)));
        device.end_commands().unwrap();
        device.submit(&[], &[], &[]).unwrap();
        device.flush().unwrap();
        buffer.release_staging();

        assert_eq!(buffer.read_back().unwrap(), bytes);
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn constant_ring_slots_never_overlap() {
        let device = RenderDevice::new("ring-test", false, None).unwrap();
        let ring = UploadRing::<[f32; 32]>::new(&device, 2).unwrap();
        assert!(ring.slot_stride() >= CONSTANT_ALIGNMENT);
        assert_eq!(ring.slot_offset(1), ring.slot_stride());
        ring.write(0, &[1.0; 32]);
        ring.write(1, &[2.0; 32]);
    }
}
