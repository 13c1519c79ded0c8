//! Rasterized render path.
//!
//! Draws the scene with dynamic rendering into the back buffer. Pass
//! constants sit at binding 0; binding 1 is a dynamic uniform buffer holding
//! one [`ObjectConstants`] element per draw.

use ash::vk;
use gpu_allocator::MemoryLocation;
use prism_core::{align_up, RtVertex};
use prism_gpu::{
    write_dynamic_uniform_buffer, write_uniform_buffer, DescriptorPool,
    DescriptorSetLayoutBuilder, GpuAllocator, GpuContext, GpuImage, MeshPipeline,
    MeshPipelineDesc, VkResultExt,
};
use prism_rt::MeshBuffers;

use crate::camera::PassConstants;
use crate::error::{RenderError, Result};
use crate::frame::{transition_image, FrameBindings, ImageAccess, RecordContext, COLOR_RANGE};
use crate::scene::{Scene, SceneMesh, INSTANCE_COUNT};

/// Draws per frame: one per triangle instance plus the ground plane.
pub const DRAW_COUNT: usize = INSTANCE_COUNT + 1;

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

pub const CLEAR_COLOR: [f32; 4] = [0.0, 0.2, 0.4, 1.0];

/// Per-draw constants.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ObjectConstants {
    pub world: [[f32; 4]; 4],
    pub color: [f32; 4],
}

impl ObjectConstants {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    /// Distance between consecutive elements for a device's dynamic-offset
    /// alignment.
    pub fn stride(min_offset_alignment: u64) -> u64 {
        align_up(Self::SIZE, min_offset_alignment.max(1))
    }

    /// Size of the per-frame object constant buffer.
    pub fn buffer_size(min_offset_alignment: u64) -> u64 {
        Self::stride(min_offset_alignment) * DRAW_COUNT as u64
    }
}

struct DepthTarget {
    image: GpuImage,
    view: vk::ImageView,
}

impl DepthTarget {
    unsafe fn new(
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(DEPTH_FORMAT)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let mut image = allocator.create_image(&image_info, MemoryLocation::GpuOnly, "depth")?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(DEPTH_FORMAT)
            .subresource_range(depth_range());
        let view = match device
            .create_image_view(&view_info, None)
            .call("vkCreateImageView")
        {
            Ok(view) => view,
            Err(e) => {
                allocator.free_image(&mut image)?;
                return Err(e.into());
            }
        };
        Ok(Self { image, view })
    }

    unsafe fn destroy(mut self, device: &ash::Device, allocator: &mut GpuAllocator) -> Result<()> {
        device.destroy_image_view(self.view, None);
        allocator.free_image(&mut self.image)?;
        Ok(())
    }
}

fn depth_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::DEPTH,
        ..COLOR_RANGE
    }
}

/// Raster path resources.
pub struct RasterPath {
    pipeline: MeshPipeline,
    set_layout: vk::DescriptorSetLayout,
    descriptor_pool: DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,
    triangle: MeshBuffers,
    plane: MeshBuffers,
    depth: DepthTarget,
    object_stride: u64,
}

impl RasterPath {
    /// Create the path for a `color_format` target of `extent`, with one
    /// descriptor set per entry of `frames`.
    ///
    /// # Safety
    /// The context must be valid. Every frame must carry object constants of
    /// at least [`ObjectConstants::buffer_size`] bytes.
    pub unsafe fn new(
        gpu: &GpuContext,
        color_format: vk::Format,
        extent: vk::Extent2D,
        frames: &[FrameBindings<'_>],
    ) -> Result<Self> {
        let device = gpu.device();
        let object_stride =
            ObjectConstants::stride(gpu.capabilities().min_uniform_buffer_offset_alignment);

        let stages = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
        let set_layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, stages)
            .dynamic_uniform_buffer(1, stages)
            .build(device)?;

        let desc = MeshPipelineDesc {
            vertex_shader: prism_shaders::mesh_vert(),
            fragment_shader: prism_shaders::mesh_frag(),
            vertex_stride: RtVertex::STRIDE as u32,
            attributes: &[
                (vk::Format::R32G32B32_SFLOAT, 0),
                (vk::Format::R32G32B32_SFLOAT, RtVertex::NORMAL_OFFSET),
            ],
            cull_mode: vk::CullModeFlags::NONE,
            color_format,
            depth_format: DEPTH_FORMAT,
        };
        let pipeline = match MeshPipeline::new(device, &desc, &[set_layout]) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                device.destroy_descriptor_set_layout(set_layout, None);
                return Err(e.into());
            }
        };

        let frame_count = frames.len() as u32;
        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(frame_count),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .descriptor_count(frame_count),
        ];
        let descriptor_pool = DescriptorPool::new(device, frame_count, &pool_sizes)?;

        let mut descriptor_sets = Vec::with_capacity(frames.len());
        for frame in frames {
            let objects = frame
                .object_constants
                .ok_or(RenderError::MissingObjectConstants)?;
            let set = descriptor_pool.allocate(device, set_layout)?;
            write_uniform_buffer(
                device,
                set,
                0,
                frame.pass_constants.buffer,
                0,
                PassConstants::SIZE,
            );
            write_dynamic_uniform_buffer(device, set, 1, objects.buffer, ObjectConstants::SIZE);
            descriptor_sets.push(set);
        }

        let mut allocator = gpu.allocator().lock();
        let [triangle_mesh, plane_mesh] = [SceneMesh::Triangle, SceneMesh::Plane].map(mesh_data);
        let triangle = MeshBuffers::upload(&mut allocator, &triangle_mesh, "raster_triangle")?;
        let plane = MeshBuffers::upload(&mut allocator, &plane_mesh, "raster_plane")?;
        let depth = DepthTarget::new(device, &mut allocator, extent)?;

        tracing::info!(
            width = extent.width,
            height = extent.height,
            frames = frames.len(),
            "Raster path initialized"
        );

        Ok(Self {
            pipeline,
            set_layout,
            descriptor_pool,
            descriptor_sets,
            triangle,
            plane,
            depth,
            object_stride,
        })
    }

    /// Recreate the depth buffer for a new target size.
    ///
    /// # Safety
    /// No frame using the old depth buffer may be in flight.
    pub unsafe fn resize(&mut self, gpu: &GpuContext, extent: vk::Extent2D) -> Result<()> {
        let mut allocator = gpu.allocator().lock();
        let depth = DepthTarget::new(gpu.device(), &mut allocator, extent)?;
        std::mem::replace(&mut self.depth, depth).destroy(gpu.device(), &mut allocator)
    }

    /// Record the frame: update constants, draw every scene object, leave the
    /// target in its final layout.
    ///
    /// # Safety
    /// The command buffer must be recording and the slot's buffers must not
    /// be read by a frame in flight.
    pub unsafe fn record(&mut self, device: &ash::Device, ctx: &RecordContext<'_>) -> Result<()> {
        let set = *self
            .descriptor_sets
            .get(ctx.slot)
            .ok_or(RenderError::FrameSlot {
                slot: ctx.slot,
                count: self.descriptor_sets.len(),
            })?;
        let objects = ctx
            .bindings
            .object_constants
            .ok_or(RenderError::MissingObjectConstants)?;

        let pass = PassConstants::new(ctx.camera, ctx.scene.light_position);
        ctx.bindings.pass_constants.write(std::slice::from_ref(&pass))?;

        let draws = ctx.scene.draw_items();
        for (i, item) in draws.iter().enumerate() {
            let constants = ObjectConstants {
                world: item.world.to_cols_array_2d(),
                color: item.color,
            };
            objects.write_range(i as u64 * self.object_stride, std::slice::from_ref(&constants))?;
        }

        let target = ctx.target;
        let color_attachment = ImageAccess::new(
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        );
        transition_image(
            device,
            ctx.cmd,
            target.image,
            COLOR_RANGE,
            ImageAccess::UNDEFINED,
            color_attachment,
        );
        transition_image(
            device,
            ctx.cmd,
            self.depth.image.image,
            depth_range(),
            ImageAccess::UNDEFINED,
            ImageAccess::new(
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ),
        );

        let color_attachments = [vk::RenderingAttachmentInfo::default()
            .image_view(target.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: CLEAR_COLOR,
                },
            })];
        let depth_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(self.depth.view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });
        let render_area = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: target.extent,
        };
        let rendering_info = vk::RenderingInfo::default()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&color_attachments)
            .depth_attachment(&depth_attachment);

        device.cmd_begin_rendering(ctx.cmd, &rendering_info);
        device.cmd_set_viewport(
            ctx.cmd,
            0,
            &[vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: target.extent.width as f32,
                height: target.extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            }],
        );
        device.cmd_set_scissor(ctx.cmd, 0, &[render_area]);
        device.cmd_bind_pipeline(
            ctx.cmd,
            vk::PipelineBindPoint::GRAPHICS,
            self.pipeline.pipeline,
        );

        for (i, item) in draws.iter().enumerate() {
            let mesh = match item.mesh {
                SceneMesh::Triangle => &self.triangle,
                SceneMesh::Plane => &self.plane,
            };
            device.cmd_bind_descriptor_sets(
                ctx.cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout,
                0,
                &[set],
                &[(i as u64 * self.object_stride) as u32],
            );
            device.cmd_bind_vertex_buffers(ctx.cmd, 0, &[mesh.vertices.buffer.buffer], &[0]);
            device.cmd_bind_index_buffer(
                ctx.cmd,
                mesh.indices.buffer.buffer,
                0,
                vk::IndexType::UINT32,
            );
            device.cmd_draw_indexed(ctx.cmd, mesh.indices.count, 1, 0, 0, 0);
        }
        device.cmd_end_rendering(ctx.cmd);

        transition_image(
            device,
            ctx.cmd,
            target.image,
            COLOR_RANGE,
            color_attachment,
            ImageAccess::target_final(target.final_layout),
        );
        Ok(())
    }

    /// # Safety
    /// No frame using the path may be in flight.
    pub unsafe fn destroy(self, gpu: &GpuContext) -> Result<()> {
        let device = gpu.device();
        let mut allocator = gpu.allocator().lock();
        self.depth.destroy(device, &mut allocator)?;
        self.triangle.destroy(&mut allocator)?;
        self.plane.destroy(&mut allocator)?;
        self.descriptor_pool.destroy(device);
        device.destroy_descriptor_set_layout(self.set_layout, None);
        self.pipeline.destroy(device);
        Ok(())
    }
}

fn mesh_data(mesh: SceneMesh) -> prism_core::MeshData {
    match mesh {
        SceneMesh::Triangle => prism_core::MeshData::triangle(),
        SceneMesh::Plane => Scene::ground_plane(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_constants_are_aligned_for_dynamic_offsets() {
        assert_eq!(ObjectConstants::SIZE, 80);
        assert_eq!(ObjectConstants::stride(256), 256);
        assert_eq!(ObjectConstants::stride(64), 128);
        assert_eq!(ObjectConstants::stride(0), 80);
        assert_eq!(ObjectConstants::buffer_size(256), 256 * DRAW_COUNT as u64);
    }

    #[test]
    fn draw_count_matches_scene() {
        assert_eq!(Scene::new().draw_items().len(), DRAW_COUNT);
    }
}
