// Frame loop driver
//
// Runs the fixed frame sequence: reset, record, submit, present, rotate,
// flush. The flush at the end keeps exactly one frame in flight, which is
// what makes the single command buffer and the slot-per-back-buffer constant
// ring safe without any per-resource fencing.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::backend::pipeline::{select_pipeline, PipelineKind, PipelineSpec, Pipelines};
use crate::backend::swapchain::BACK_BUFFER_COUNT;
use crate::backend::texture::{scan_texture_dir, texture_key};
use crate::backend::{DefaultBuffer, RenderDevice, SlotMap, SwapchainTargets, Texture2D, UploadRing};
use crate::config::Config;
use crate::error::{RenderError, Result, VkResultExt};
use crate::scene::{SceneData, Submesh};

/// Per-object shader constants, written once per frame into the current slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ObjectConstants {
    pub world_view_proj: Mat4,
    pub world: Mat4,
}

/// One recorded draw, fully resolved ahead of the frame loop.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawCall {
    pub index_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub texture_slot: usize,
    pub pipeline: PipelineKind,
    pub diffuse_color: [f32; 4],
}

/// Resolve every submesh into a draw call, preserving submesh order.
pub fn build_draw_plan(submeshes: &[Submesh], slots: &SlotMap) -> Vec<DrawCall> {
    submeshes
        .iter()
        .map(|submesh| DrawCall {
            index_count: submesh.index_count,
            first_index: submesh.start_index,
            vertex_offset: submesh.base_vertex as i32,
            texture_slot: slots.resolve(submesh.material.diffuse_texture.as_deref()),
            pipeline: select_pipeline(&submesh.material),
            diffuse_color: submesh.material.diffuse_color,
        })
        .collect()
}

pub struct Renderer {
    targets: SwapchainTargets,
    pipelines: Pipelines,
    vertex_buffer: DefaultBuffer,
    index_buffer: DefaultBuffer,
    constants: UploadRing<ObjectConstants>,
    #[allow(dead_code)]
    textures: Vec<Texture2D>,
    draw_plan: Vec<DrawCall>,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    clear_color: [f32; 4],
    elapsed: std::time::Instant,
    device: Arc<RenderDevice>,
}

impl Renderer {
    pub fn new(
        device: &Arc<RenderDevice>,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        config: &Config,
        scene: &SceneData,
    ) -> Result<Self> {
        let mut targets = SwapchainTargets::new(
            device.clone(),
            surface,
            width,
            height,
            config.present_mode(),
        )?;

        let spec = PipelineSpec {
            vertex_shader: Path::new(&config.scene.vertex_shader),
            opaque_fragment_shader: Path::new(&config.scene.fragment_shader),
            cutout_fragment_shader: Path::new(&config.scene.cutout_shader),
        };
        let mut pipelines = Pipelines::new(device, targets.format, &spec)?;
        targets.attach_render_pass(pipelines.render_pass)?;

        // One-time setup batch: every immutable upload rides a single command
        // list, then one flush retires all the staging copies at once.
        let cmd = device.begin_commands()?;

        let mut vertex_buffer = DefaultBuffer::upload_immutable(
            device,
            cmd,
            bytemuck::cast_slice(&scene.vertices),
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        let mut index_buffer = DefaultBuffer::upload_immutable(
            device,
            cmd,
            bytemuck::cast_slice(&scene.indices),
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;

        let mut textures = vec![Texture2D::fallback_white(device, cmd)?];
        let available: HashMap<String, std::path::PathBuf> =
            scan_texture_dir(Path::new(&config.scene.texture_dir))?
                .into_iter()
                .map(|path| (texture_key(&path.to_string_lossy()).to_string(), path))
                .collect();
        let referenced: Vec<String> = scene
            .unique_texture_refs()
            .into_iter()
            .map(str::to_string)
            .collect();
        for reference in &referenced {
            if let Some(path) = available.get(texture_key(reference)) {
                textures.push(Texture2D::from_file(device, cmd, path)?);
            } else {
                log::warn!("Texture '{}' not found, using fallback", reference);
            }
        }

        device.end_commands()?;
        device.submit(&[], &[], &[])?;
        device.flush()?;

        vertex_buffer.release_staging();
        index_buffer.release_staging();
        for texture in &mut textures {
            texture.release_staging();
        }

        let loaded: Vec<String> = textures[1..].iter().map(|t| t.name.clone()).collect();
        let slots = SlotMap::new(&referenced, &loaded);
        debug_assert_eq!(slots.len(), textures.len());

        let slot_count = targets.image_count().max(BACK_BUFFER_COUNT as usize);
        let constants = UploadRing::<ObjectConstants>::new(device, slot_count)?;

        let views: Vec<vk::ImageView> = textures.iter().map(|t| t.view).collect();
        pipelines.write_descriptors(
            constants.buffer(),
            std::mem::size_of::<ObjectConstants>() as vk::DeviceSize,
            &views,
        )?;

        let draw_plan = build_draw_plan(&scene.submeshes, &slots);
        log::info!(
            "Prepared {} draw calls over {} texture slots",
            draw_plan.len(),
            slots.len()
        );

        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let image_available = unsafe { device.device.create_semaphore(&semaphore_info, None) }
            .api("vkCreateSemaphore")?;
        let render_finished = match unsafe {
            device.device.create_semaphore(&semaphore_info, None)
        }
        .api("vkCreateSemaphore")
        {
            Ok(s) => s,
            Err(e) => {
                unsafe { device.device.destroy_semaphore(image_available, None) };
                return Err(e);
            }
        };

        Ok(Self {
            targets,
            pipelines,
            vertex_buffer,
            index_buffer,
            constants,
            textures,
            draw_plan,
            image_available,
            render_finished,
            clear_color: config.graphics.clear_color,
            elapsed: std::time::Instant::now(),
            device: device.clone(),
        })
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.targets.extent
    }

    /// Recreate the swap chain targets at a new size. Zero dimensions are a
    /// no-op; the queue is flushed inside before anything is destroyed.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<bool> {
        self.targets.resize(width, height)
    }

    /// One full frame: write constants, acquire, record, submit, present,
    /// rotate, flush. Returns whether the swap chain wants a resize.
    pub fn draw_frame(&mut self) -> Result<bool> {
        let slot = self.targets.current_index() % self.constants.slot_count();
        self.constants.write(slot, &self.compute_constants());

        let (image_index, mut suboptimal) = match self.targets.acquire(self.image_available) {
            Ok(acquired) => acquired,
            Err(RenderError::Api {
                result: vk::Result::ERROR_OUT_OF_DATE_KHR,
                ..
            }) => return Ok(true),
            Err(e) => return Err(e),
        };

        let cmd = self.device.begin_commands()?;
        self.record_scene(cmd, image_index);
        self.device.end_commands()?;

        self.device.submit(
            &[self.image_available],
            &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            &[self.render_finished],
        )?;

        // Rotation happens inside present.
        suboptimal |= self.targets.present(image_index, &[self.render_finished])?;

        // Single frame in flight: the CPU does not start the next frame until
        // this one has fully retired on the GPU.
        self.device.flush()?;

        Ok(suboptimal)
    }

    fn compute_constants(&self) -> ObjectConstants {
        let extent = self.targets.extent;
        let aspect = extent.width.max(1) as f32 / extent.height.max(1) as f32;

        // Slow orbit around the scene origin.
        let t = self.elapsed.elapsed().as_secs_f32() * 0.3;
        let radius = 5.0;
        let eye = Vec3::new(radius * t.cos(), 2.0, radius * t.sin());
        let view = Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y);

        let mut proj = Mat4::perspective_rh(std::f32::consts::FRAC_PI_4, aspect, 0.1, 1000.0);
        // Vulkan clip space points Y down.
        proj.y_axis.y *= -1.0;

        let world = Mat4::IDENTITY;
        ObjectConstants {
            world_view_proj: proj * view * world,
            world,
        }
    }

    fn record_scene(&self, cmd: vk::CommandBuffer, image_index: u32) {
        let device = &self.device.device;
        let extent = self.targets.extent;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.pipelines.render_pass)
            .framebuffer(self.targets.framebuffer(image_index))
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .clear_values(&clear_values);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };

        let slot = self.targets.current_index() % self.constants.slot_count();
        let dynamic_offset = self.constants.slot_offset(slot) as u32;

        unsafe {
            device.cmd_begin_render_pass(cmd, &pass_info, vk::SubpassContents::INLINE);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[scissor]);

            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, self.index_buffer.buffer, 0, vk::IndexType::UINT32);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipelines.layout,
                0,
                &[self.pipelines.constants_set()],
                &[dynamic_offset],
            );

            let mut bound_pipeline = None;
            for draw in &self.draw_plan {
                if bound_pipeline != Some(draw.pipeline) {
                    device.cmd_bind_pipeline(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        self.pipelines.pipeline(draw.pipeline),
                    );
                    bound_pipeline = Some(draw.pipeline);
                }
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipelines.layout,
                    1,
                    &[self.pipelines.texture_set(draw.texture_slot)],
                    &[],
                );
                device.cmd_push_constants(
                    cmd,
                    self.pipelines.layout,
                    vk::ShaderStageFlags::FRAGMENT,
                    0,
                    bytemuck::bytes_of(&draw.diffuse_color),
                );
                device.cmd_draw_indexed(
                    cmd,
                    draw.index_count,
                    1,
                    draw.first_index,
                    draw.vertex_offset,
                    0,
                );
            }

            device.cmd_end_render_pass(cmd);
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        // No frame can be in flight when the targets and buffers go away.
        let _ = self.device.flush();
        unsafe {
            self.device
                .device
                .destroy_semaphore(self.image_available, None);
            self.device
                .device
                .destroy_semaphore(self.render_finished, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Material;

    fn submesh(start: u32, count: u32, base: u32, texture: Option<&str>) -> Submesh {
        Submesh {
            start_index: start,
            index_count: count,
            base_vertex: base,
            material: Material {
                diffuse_color: [1.0; 4],
                diffuse_texture: texture.map(str::to_string),
            },
        }
    }

    #[test]
    fn cube_plan_is_a_single_full_range_draw() {
        let cube = SceneData::unit_cube(1.0);
        let slots = SlotMap::default();
        let plan = build_draw_plan(&cube.submeshes, &slots);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].index_count, 36);
        assert_eq!(plan[0].first_index, 0);
        assert_eq!(plan[0].vertex_offset, 0);
        assert_eq!(plan[0].texture_slot, 0);
        assert_eq!(plan[0].pipeline, PipelineKind::Opaque);
    }

    #[test]
    fn plan_preserves_submesh_order_and_ranges() {
        let submeshes = vec![
            submesh(0, 300, 0, None),
            submesh(300, 150, 200, None),
            submesh(450, 90, 350, None),
        ];
        let plan = build_draw_plan(&submeshes, &SlotMap::default());
        let ranges: Vec<(u32, u32, i32)> = plan
            .iter()
            .map(|d| (d.first_index, d.index_count, d.vertex_offset))
            .collect();
        assert_eq!(ranges, vec![(0, 300, 0), (300, 150, 200), (450, 90, 350)]);
    }

    #[test]
    fn unknown_texture_lands_on_fallback_slot() {
        let submeshes = vec![submesh(0, 3, 0, Some("missing.png"))];
        let plan = build_draw_plan(&submeshes, &SlotMap::default());
        assert_eq!(plan[0].texture_slot, 0);
    }

    #[test]
    fn loaded_texture_gets_its_slot() {
        let loaded = vec!["brick".to_string()];
        let slots = SlotMap::new(["brick.png"], &loaded);
        let submeshes = vec![
            submesh(0, 3, 0, Some("brick.png")),
            submesh(3, 3, 0, None),
        ];
        let plan = build_draw_plan(&submeshes, &slots);
        assert_eq!(plan[0].texture_slot, 1);
        assert_eq!(plan[1].texture_slot, 0);
    }

    #[test]
    fn cutout_material_routes_to_cutout_pipeline() {
        let submeshes = vec![
            submesh(0, 3, 0, Some("sponza_thorn_diff.png")),
            submesh(3, 3, 0, Some("brick.png")),
        ];
        let plan = build_draw_plan(&submeshes, &SlotMap::default());
        assert_eq!(plan[0].pipeline, PipelineKind::Cutout);
        assert_eq!(plan[1].pipeline, PipelineKind::Opaque);
    }
}
