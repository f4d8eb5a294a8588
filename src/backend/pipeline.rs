// Graphics pipelines and descriptor tables
//
// Two pipelines share one layout: the opaque default and an alpha-cutout
// variant for foliage-style geometry. Which one a submesh uses is decided
// up front from its material, never per frame.
//
// Descriptor layout, fixed for the whole app:
//   set 0, binding 0  dynamic uniform buffer (per-frame object constants)
//   set 1, binding 0  combined image sampler (one set per texture slot)
//   push constants    16 bytes of material color, fragment stage

use ash::vk;
use std::path::Path;
use std::sync::Arc;

use super::shader::load_shader_module;
use super::swapchain::DEPTH_FORMAT;
use super::RenderDevice;
use crate::error::{Result, VkResultExt};
use crate::scene::{Material, VERTEX_STRIDE};

/// Materials whose texture reference contains this substring render through
/// the alpha-cutout pipeline. Matching is case-sensitive.
pub const CUTOUT_PATTERN: &str = "thorn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Opaque,
    Cutout,
}

/// Route a material to a pipeline by inspecting its texture reference.
pub fn select_pipeline(material: &Material) -> PipelineKind {
    match &material.diffuse_texture {
        Some(reference) if reference.contains(CUTOUT_PATTERN) => PipelineKind::Cutout,
        _ => PipelineKind::Opaque,
    }
}

/// Shader blob locations for the pipeline pair.
pub struct PipelineSpec<'a> {
    pub vertex_shader: &'a Path,
    pub opaque_fragment_shader: &'a Path,
    pub cutout_fragment_shader: &'a Path,
}

/// Create the single render pass both pipelines target. The color attachment
/// enters undefined (its previous content is cleared anyway) and leaves in
/// the present state, so no explicit render-target barriers are recorded.
pub fn create_render_pass(device: &RenderDevice, format: vk::Format) -> Result<vk::RenderPass> {
    let color_attachment = vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();

    let depth_attachment = vk::AttachmentDescription::builder()
        .format(DEPTH_FORMAT)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();
    let depth_attachment_ref = vk::AttachmentReference::builder()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachments = [color_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_attachments)
        .depth_stencil_attachment(&depth_attachment_ref)
        .build();

    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .build();

    let attachments = [color_attachment, depth_attachment];
    let subpasses = [subpass];
    let dependencies = [dependency];
    let create_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe { device.device.create_render_pass(&create_info, None) }.api("vkCreateRenderPass")
}

pub struct Pipelines {
    pub render_pass: vk::RenderPass,
    pub layout: vk::PipelineLayout,
    constants_set_layout: vk::DescriptorSetLayout,
    texture_set_layout: vk::DescriptorSetLayout,
    sampler: vk::Sampler,
    opaque: vk::Pipeline,
    cutout: vk::Pipeline,
    descriptor_pool: vk::DescriptorPool,
    constants_set: vk::DescriptorSet,
    texture_sets: Vec<vk::DescriptorSet>,
    device: Arc<RenderDevice>,
}

impl Pipelines {
    pub fn new(
        device: &Arc<RenderDevice>,
        color_format: vk::Format,
        spec: &PipelineSpec,
    ) -> Result<Self> {
        let render_pass = create_render_pass(device, color_format)?;

        let max_anisotropy = device.properties.limits.max_sampler_anisotropy.min(16.0);
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(true)
            .max_anisotropy(max_anisotropy)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler =
            unsafe { device.device.create_sampler(&sampler_info, None) }.api("vkCreateSampler")?;

        let constants_binding = vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .build();
        let constants_bindings = [constants_binding];
        let constants_layout_info =
            vk::DescriptorSetLayoutCreateInfo::builder().bindings(&constants_bindings);
        let constants_set_layout = unsafe {
            device
                .device
                .create_descriptor_set_layout(&constants_layout_info, None)
        }
        .api("vkCreateDescriptorSetLayout")?;

        let samplers = [sampler];
        let texture_binding = vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .immutable_samplers(&samplers)
            .build();
        let texture_bindings = [texture_binding];
        let texture_layout_info =
            vk::DescriptorSetLayoutCreateInfo::builder().bindings(&texture_bindings);
        let texture_set_layout = unsafe {
            device
                .device
                .create_descriptor_set_layout(&texture_layout_info, None)
        }
        .api("vkCreateDescriptorSetLayout")?;

        // Material diffuse color, one vec4.
        let push_constant_range = vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(16)
            .build();

        let set_layouts = [constants_set_layout, texture_set_layout];
        let push_constant_ranges = [push_constant_range];
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
            .api("vkCreatePipelineLayout")?;

        let vertex_module = load_shader_module(device, spec.vertex_shader)?;
        let opaque_module = load_shader_module(device, spec.opaque_fragment_shader)?;
        let cutout_module = load_shader_module(device, spec.cutout_fragment_shader)?;

        let opaque = Self::create_pipeline(device, layout, render_pass, vertex_module, opaque_module);
        let cutout = Self::create_pipeline(device, layout, render_pass, vertex_module, cutout_module);

        unsafe {
            device.device.destroy_shader_module(vertex_module, None);
            device.device.destroy_shader_module(opaque_module, None);
            device.device.destroy_shader_module(cutout_module, None);
        }
        let opaque = opaque?;
        let cutout = match cutout {
            Ok(p) => p,
            Err(e) => {
                unsafe { device.device.destroy_pipeline(opaque, None) };
                return Err(e);
            }
        };

        log::info!("Created opaque and cutout pipelines");

        Ok(Self {
            render_pass,
            layout,
            constants_set_layout,
            texture_set_layout,
            sampler,
            opaque,
            cutout,
            descriptor_pool: vk::DescriptorPool::null(),
            constants_set: vk::DescriptorSet::null(),
            texture_sets: Vec::new(),
            device: device.clone(),
        })
    }

    fn create_pipeline(
        device: &RenderDevice,
        layout: vk::PipelineLayout,
        render_pass: vk::RenderPass,
        vertex_module: vk::ShaderModule,
        fragment_module: vk::ShaderModule,
    ) -> Result<vk::Pipeline> {
        let entry = c"main";
        let stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex_module)
                .name(entry)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment_module)
                .name(entry)
                .build(),
        ];

        let binding = vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(VERTEX_STRIDE)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build();
        let attributes = [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 12,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: 24,
            },
        ];
        let bindings = [binding];
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

        // Viewport and scissor are dynamic so a resize never rebuilds pipelines.
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        // Source content uses clockwise front faces; the projection Y-flip
        // keeps that winding on screen.
        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::CLOCKWISE)
            .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS);

        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build();
        let blend_attachments = [color_blend_attachment];
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

        let create_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
        }
        .map_err(|(_, result)| crate::error::RenderError::Api {
            call: "vkCreateGraphicsPipelines",
            result,
        })?;
        Ok(pipelines[0])
    }

    /// Allocate and fill the descriptor tables: one dynamic constants set
    /// bound to the per-frame ring, and one texture set per slot with slot 0
    /// pointing at the fallback texture.
    pub fn write_descriptors(
        &mut self,
        constants_buffer: vk::Buffer,
        constants_range: vk::DeviceSize,
        texture_views: &[vk::ImageView],
    ) -> Result<()> {
        assert!(self.descriptor_pool == vk::DescriptorPool::null());
        assert!(!texture_views.is_empty());

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                descriptor_count: 1,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: texture_views.len() as u32,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(1 + texture_views.len() as u32)
            .pool_sizes(&pool_sizes);
        self.descriptor_pool =
            unsafe { self.device.device.create_descriptor_pool(&pool_info, None) }
                .api("vkCreateDescriptorPool")?;

        let constants_layouts = [self.constants_set_layout];
        let constants_alloc = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&constants_layouts);
        self.constants_set =
            unsafe { self.device.device.allocate_descriptor_sets(&constants_alloc) }
                .api("vkAllocateDescriptorSets")?[0];

        let texture_layouts = vec![self.texture_set_layout; texture_views.len()];
        let texture_alloc = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&texture_layouts);
        self.texture_sets =
            unsafe { self.device.device.allocate_descriptor_sets(&texture_alloc) }
                .api("vkAllocateDescriptorSets")?;

        let buffer_info = vk::DescriptorBufferInfo {
            buffer: constants_buffer,
            offset: 0,
            range: constants_range,
        };
        let buffer_infos = [buffer_info];
        let mut writes = vec![vk::WriteDescriptorSet::builder()
            .dst_set(self.constants_set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
            .buffer_info(&buffer_infos)
            .build()];

        let image_infos: Vec<[vk::DescriptorImageInfo; 1]> = texture_views
            .iter()
            .map(|&view| {
                [vk::DescriptorImageInfo {
                    sampler: self.sampler,
                    image_view: view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                }]
            })
            .collect();
        for (set, image_info) in self.texture_sets.iter().zip(&image_infos) {
            writes.push(
                vk::WriteDescriptorSet::builder()
                    .dst_set(*set)
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(image_info)
                    .build(),
            );
        }

        unsafe {
            self.device.device.update_descriptor_sets(&writes, &[]);
        }
        Ok(())
    }

    pub fn pipeline(&self, kind: PipelineKind) -> vk::Pipeline {
        match kind {
            PipelineKind::Opaque => self.opaque,
            PipelineKind::Cutout => self.cutout,
        }
    }

    pub fn constants_set(&self) -> vk::DescriptorSet {
        self.constants_set
    }

    pub fn texture_set(&self, slot: usize) -> vk::DescriptorSet {
        self.texture_sets[slot]
    }
}

impl Drop for Pipelines {
    fn drop(&mut self) {
        unsafe {
            if self.descriptor_pool != vk::DescriptorPool::null() {
                self.device
                    .device
                    .destroy_descriptor_pool(self.descriptor_pool, None);
            }
            self.device.device.destroy_pipeline(self.opaque, None);
            self.device.device.destroy_pipeline(self.cutout, None);
            self.device.device.destroy_pipeline_layout(self.layout, None);
            self.device
                .device
                .destroy_descriptor_set_layout(self.constants_set_layout, None);
            self.device
                .device
                .destroy_descriptor_set_layout(self.texture_set_layout, None);
            self.device.device.destroy_sampler(self.sampler, None);
            self.device.device.destroy_render_pass(self.render_pass, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material(texture: Option<&str>) -> Material {
        Material {
            diffuse_color: [1.0; 4],
            diffuse_texture: texture.map(str::to_string),
        }
    }

    #[test]
    fn matching_texture_reference_selects_cutout() {
        let m = material(Some("textures/sponza_thorn_diff.png"));
        assert_eq!(select_pipeline(&m), PipelineKind::Cutout);
    }

    #[test]
    fn plain_texture_reference_selects_opaque() {
        let m = material(Some("brick.png"));
        assert_eq!(select_pipeline(&m), PipelineKind::Opaque);
    }

    #[test]
    fn untextured_material_selects_opaque() {
        assert_eq!(select_pipeline(&material(None)), PipelineKind::Opaque);
    }

    #[test]
    fn pattern_match_is_case_sensitive() {
        let m = material(Some("Thorn_diff.png"));
        assert_eq!(select_pipeline(&m), PipelineKind::Opaque);
    }
}
