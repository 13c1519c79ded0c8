//! Shader modules and the depth-tested mesh pipeline.

use crate::error::{GpuError, Result, VkResultExt};
use ash::vk;

/// Create a shader module from SPIR-V words.
///
/// # Safety
/// The device must be valid and `code` must be valid SPIR-V.
pub unsafe fn create_shader_module(
    device: &ash::Device,
    code: &[u32],
    label: &str,
) -> Result<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::default().code(code);
    device
        .create_shader_module(&info, None)
        .map_err(|e| GpuError::ShaderCompilation(format!("{label}: {e}")))
}

/// Opaque triangle-list pipeline over one interleaved vertex stream.
///
/// Depth test and write are always on; viewport and scissor are dynamic.
#[derive(Clone, Debug)]
pub struct MeshPipelineDesc<'a> {
    pub vertex_shader: &'a [u32],
    pub fragment_shader: &'a [u32],
    pub vertex_stride: u32,
    /// Format and byte offset per shader location, starting at location 0.
    pub attributes: &'a [(vk::Format, u32)],
    pub cull_mode: vk::CullModeFlags,
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
}

impl MeshPipelineDesc<'_> {
    fn validate(&self) -> Result<()> {
        if self.vertex_shader.is_empty() || self.fragment_shader.is_empty() {
            return Err(GpuError::PipelineCreation(
                "mesh pipeline needs vertex and fragment code".to_string(),
            ));
        }
        if self.attributes.is_empty() {
            return Err(GpuError::PipelineCreation(
                "mesh pipeline has no vertex attributes".to_string(),
            ));
        }
        for (location, &(format, offset)) in self.attributes.iter().enumerate() {
            if offset >= self.vertex_stride {
                return Err(GpuError::PipelineCreation(format!(
                    "attribute {location} ({format:?}) at offset {offset} \
                     lies outside the {}-byte vertex",
                    self.vertex_stride
                )));
            }
        }
        Ok(())
    }

    fn attribute_descriptions(&self) -> Vec<vk::VertexInputAttributeDescription> {
        self.attributes
            .iter()
            .enumerate()
            .map(|(location, &(format, offset))| {
                vk::VertexInputAttributeDescription::default()
                    .location(location as u32)
                    .binding(0)
                    .format(format)
                    .offset(offset)
            })
            .collect()
    }
}

/// Mesh pipeline and its layout.
pub struct MeshPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl MeshPipeline {
    /// Create the pipeline for dynamic rendering.
    ///
    /// # Safety
    /// The device must be valid and shader code must be valid SPIR-V.
    pub unsafe fn new(
        device: &ash::Device,
        desc: &MeshPipelineDesc<'_>,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Self> {
        desc.validate()?;

        let vert_module = create_shader_module(device, desc.vertex_shader, "mesh vertex")?;
        let fragment = create_shader_module(device, desc.fragment_shader, "mesh fragment");
        let frag_module = match fragment {
            Ok(module) => module,
            Err(e) => {
                device.destroy_shader_module(vert_module, None);
                return Err(e);
            }
        };

        let created = Self::create(device, desc, set_layouts, vert_module, frag_module);
        device.destroy_shader_module(vert_module, None);
        device.destroy_shader_module(frag_module, None);
        let pipeline = created?;

        tracing::debug!(
            color = ?desc.color_format,
            depth = ?desc.depth_format,
            attributes = desc.attributes.len(),
            "Mesh pipeline created"
        );
        Ok(pipeline)
    }

    unsafe fn create(
        device: &ash::Device,
        desc: &MeshPipelineDesc<'_>,
        set_layouts: &[vk::DescriptorSetLayout],
        vert_module: vk::ShaderModule,
        frag_module: vk::ShaderModule,
    ) -> Result<Self> {
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert_module)
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag_module)
                .name(c"main"),
        ];

        let bindings = [vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(desc.vertex_stride)
            .input_rate(vk::VertexInputRate::VERTEX)];
        let attributes = desc.attribute_descriptions();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(desc.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS);
        let blend = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(set_layouts);
        let layout = device
            .create_pipeline_layout(&layout_info, None)
            .call("vkCreatePipelineLayout")?;

        let color_formats = [desc.color_format];
        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(desc.depth_format);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let created =
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None);
        let pipeline = match created {
            Ok(pipelines) => pipelines.into_iter().next(),
            Err((_, e)) => {
                device.destroy_pipeline_layout(layout, None);
                return Err(GpuError::PipelineCreation(e.to_string()));
            }
        };
        match pipeline {
            Some(pipeline) => Ok(Self { pipeline, layout }),
            None => {
                device.destroy_pipeline_layout(layout, None);
                Err(GpuError::PipelineCreation("no pipeline returned".to_string()))
            }
        }
    }

    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CODE: &[u32] = &[0x0723_0203];

    fn desc(attributes: &[(vk::Format, u32)]) -> MeshPipelineDesc<'_> {
        MeshPipelineDesc {
            vertex_shader: CODE,
            fragment_shader: CODE,
            vertex_stride: 24,
            attributes,
            cull_mode: vk::CullModeFlags::NONE,
            color_format: vk::Format::R8G8B8A8_UNORM,
            depth_format: vk::Format::D32_SFLOAT,
        }
    }

    #[test]
    fn attributes_take_consecutive_locations() {
        let attributes = [
            (vk::Format::R32G32B32_SFLOAT, 0),
            (vk::Format::R32G32B32_SFLOAT, 12),
        ];
        let descriptions = desc(&attributes).attribute_descriptions();

        assert_eq!(descriptions.len(), 2);
        assert_eq!(descriptions[1].location, 1);
        assert_eq!(descriptions[1].offset, 12);
        assert!(descriptions.iter().all(|d| d.binding == 0));
    }

    #[test]
    fn attribute_past_the_vertex_is_rejected() {
        let attributes = [(vk::Format::R32G32B32_SFLOAT, 24)];
        let err = desc(&attributes).validate().unwrap_err();
        assert!(matches!(err, GpuError::PipelineCreation(msg) if msg.contains("offset 24")));
    }

    #[test]
    fn missing_code_or_attributes_is_rejected() {
        let attributes = [(vk::Format::R32G32B32_SFLOAT, 0)];
        let mut no_fragment = desc(&attributes);
        no_fragment.fragment_shader = &[];

        assert!(no_fragment.validate().is_err());
        assert!(desc(&[]).validate().is_err());
        assert!(desc(&attributes).validate().is_ok());
    }
}
