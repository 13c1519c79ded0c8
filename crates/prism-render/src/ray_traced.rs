//! Hardware ray-traced render path.
//!
//! Initialization builds both bottom-level structures and the first
//! top-level build in one submission, then creates the pipeline and the
//! shader table. Each frame updates the TLAS in place, traces into a storage
//! image and blits that image into the target.

use ash::vk;
use gpu_allocator::MemoryLocation;
use prism_gpu::command::execute_single_time_commands;
use prism_gpu::{
    write_acceleration_structure, write_storage_image, write_uniform_buffer, BufferKind,
    CommandPool, DescriptorPool, GpuAllocator, GpuBuffer, GpuContext, GpuError, GpuImage,
    VkResultExt,
};
use prism_rt::{
    exports, BottomLevelAs, BuildMode, HitGroupLayout, LocalArgument, MeshBuffers, RtDevice,
    RtPipeline, ShaderRecord, ShaderTable, ShaderTableBuilder, SubobjectArena, TlasInstance,
    TopLevelAs, RAY_TYPE_PRIMARY, RAY_TYPE_SHADOW,
};

use crate::camera::PassConstants;
use crate::error::{RenderError, Result};
use crate::frame::{transition_image, FrameBindings, ImageAccess, RecordContext, COLOR_RANGE};
use crate::scene::{Scene, INSTANCE_BLAS, TRIANGLE_COLORS};

pub const OUTPUT_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Output image between frames.
const OUTPUT_IDLE: ImageAccess = ImageAccess::new(
    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    vk::PipelineStageFlags2::TRANSFER,
    vk::AccessFlags2::TRANSFER_READ,
);

/// Output image while rays are traced into it.
const OUTPUT_TRACING: ImageAccess = ImageAccess::new(
    vk::ImageLayout::GENERAL,
    vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
    vk::AccessFlags2::SHADER_STORAGE_WRITE,
);

/// Storage image the ray-generation shader writes.
struct OutputImage {
    image: GpuImage,
    view: vk::ImageView,
    extent: vk::Extent2D,
}

impl OutputImage {
    unsafe fn new(
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(OUTPUT_FORMAT)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let mut image =
            allocator.create_image(&image_info, MemoryLocation::GpuOnly, "rt_output")?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(OUTPUT_FORMAT)
            .subresource_range(COLOR_RANGE);
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
        Ok(Self {
            image,
            view,
            extent,
        })
    }

    /// Move a fresh image into its between-frames layout.
    unsafe fn record_initial_transition(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        transition_image(
            device,
            cmd,
            self.image.image,
            COLOR_RANGE,
            ImageAccess::UNDEFINED,
            OUTPUT_IDLE,
        );
    }

    unsafe fn destroy(mut self, device: &ash::Device, allocator: &mut GpuAllocator) -> Result<()> {
        device.destroy_image_view(self.view, None);
        allocator.free_image(&mut self.image)?;
        Ok(())
    }
}

/// Ray-traced path resources.
pub struct RayTracedPath {
    rt: RtDevice,
    meshes: Vec<Vec<MeshBuffers>>,
    blas: Vec<BottomLevelAs>,
    tlas: TopLevelAs,
    hit_layout: HitGroupLayout,
    pipeline: RtPipeline,
    shader_table: ShaderTable,
    triangle_colors: Vec<GpuBuffer>,
    output: OutputImage,
    descriptor_pool: DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,
}

/// Resources created so far while a [`RayTracedPath`] is assembled.
#[derive(Default)]
struct Staged {
    meshes: Vec<Vec<MeshBuffers>>,
    blas: Vec<BottomLevelAs>,
    tlas: Option<TopLevelAs>,
    output: Option<OutputImage>,
    pipeline: Option<RtPipeline>,
    triangle_colors: Vec<GpuBuffer>,
    shader_table: Option<ShaderTable>,
    descriptor_pool: Option<DescriptorPool>,
}

impl Staged {
    /// Free everything in reverse creation order, logging failures.
    ///
    /// # Safety
    /// Nothing recorded against these resources may still be executing.
    unsafe fn release(self, device: &ash::Device, rt: &RtDevice, allocator: &mut GpuAllocator) {
        fn logged<E: std::fmt::Display>(what: &str, result: std::result::Result<(), E>) {
            if let Err(e) = result {
                tracing::warn!(what, "Release after failed initialization: {e}");
            }
        }

        if let Some(pool) = self.descriptor_pool {
            pool.destroy(device);
        }
        if let Some(table) = self.shader_table {
            logged("shader table", table.destroy(allocator));
        }
        for mut buffer in self.triangle_colors {
            logged("triangle colors", allocator.free_buffer(&mut buffer));
        }
        if let Some(pipeline) = self.pipeline {
            pipeline.destroy(device);
        }
        if let Some(output) = self.output {
            logged("output image", output.destroy(device, allocator));
        }
        if let Some(tlas) = self.tlas {
            logged("tlas", tlas.destroy(rt, allocator));
        }
        for blas in self.blas {
            logged("blas", blas.destroy(rt, allocator));
        }
        for geometry in self.meshes.into_iter().flatten() {
            logged("mesh", geometry.destroy(allocator));
        }
    }
}

impl RayTracedPath {
    /// Build acceleration structures, pipeline and shader table, and one
    /// descriptor set per entry of `frames`.
    ///
    /// Fails with an unsupported error when the context was created without
    /// ray tracing. Whatever was created before a failing step is freed.
    ///
    /// # Safety
    /// The context must be valid.
    pub unsafe fn new(
        gpu: &GpuContext,
        extent: vk::Extent2D,
        frames: &[FrameBindings<'_>],
        scene: &Scene,
    ) -> Result<Self> {
        let rt = RtDevice::new(gpu)?;
        let hit_layout = Scene::hit_layout()?;

        let mut staged = Staged::default();
        match Self::stage(gpu, &rt, &hit_layout, extent, frames, scene, &mut staged) {
            Ok(descriptor_sets) => {
                let Staged {
                    meshes,
                    blas,
                    tlas: Some(tlas),
                    output: Some(output),
                    pipeline: Some(pipeline),
                    triangle_colors,
                    shader_table: Some(shader_table),
                    descriptor_pool: Some(descriptor_pool),
                } = staged
                else {
                    return Err(GpuError::InvalidState(
                        "ray-traced path staged incompletely".to_string(),
                    )
                    .into());
                };
                Ok(Self {
                    rt,
                    meshes,
                    blas,
                    tlas,
                    hit_layout,
                    pipeline,
                    shader_table,
                    triangle_colors,
                    output,
                    descriptor_pool,
                    descriptor_sets,
                })
            }
            Err(e) => {
                // A failed one-time submission may still be executing.
                let _ = gpu.device().device_wait_idle();
                staged.release(gpu.device(), &rt, &mut gpu.allocator().lock());
                Err(e)
            }
        }
    }

    /// Create every resource into `staged`; returns the per-frame sets.
    unsafe fn stage(
        gpu: &GpuContext,
        rt: &RtDevice,
        hit_layout: &HitGroupLayout,
        extent: vk::Extent2D,
        frames: &[FrameBindings<'_>],
        scene: &Scene,
        staged: &mut Staged,
    ) -> Result<Vec<vk::DescriptorSet>> {
        let device = gpu.device();
        let frame_slots = frames.len() as u32;

        let mut allocator = gpu.allocator().lock();

        for (b, blas_meshes) in Scene::blas_meshes().iter().enumerate() {
            let mut uploaded = Vec::new();
            for (g, mesh) in blas_meshes.iter().enumerate() {
                match MeshBuffers::upload(&mut allocator, mesh, &format!("blas{b}_geometry{g}")) {
                    Ok(buffers) => uploaded.push(buffers),
                    Err(e) => {
                        staged.meshes.push(uploaded);
                        return Err(e.into());
                    }
                }
            }
            staged.meshes.push(uploaded);
        }

        let tlas = staged.tlas.insert(TopLevelAs::new(
            rt,
            &mut allocator,
            hit_layout.instance_count(),
            frame_slots,
        )?);
        let output = staged
            .output
            .insert(OutputImage::new(device, &mut allocator, extent)?);

        let pool = CommandPool::new(
            device,
            gpu.graphics_queue_family(),
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?;
        let meshes = &staged.meshes;
        let blas = &mut staged.blas;
        let built = execute_single_time_commands(
            device,
            &pool,
            gpu.graphics_queue(),
            |cmd| -> Result<()> {
                for (b, geometry) in meshes.iter().enumerate() {
                    let refs: Vec<&MeshBuffers> = geometry.iter().collect();
                    blas.push(BottomLevelAs::build(
                        rt,
                        &mut allocator,
                        cmd,
                        &refs,
                        &format!("blas{b}"),
                    )?);
                }
                let instances = scene_instances(blas, scene);
                tlas.record_build(rt, cmd, &instances, hit_layout, BuildMode::Build, 0)?;
                output.record_initial_transition(device, cmd);
                Ok(())
            },
        );
        pool.destroy(device);
        built?;
        for structure in &mut staged.blas {
            structure.release_scratch(&mut allocator)?;
        }

        tracing::info!(
            blas = staged.blas.len(),
            instances = hit_layout.instance_count(),
            hit_records = hit_layout.total_records(),
            tlas_size = tlas.sizes.acceleration_structure_size,
            "Acceleration structures built"
        );

        let arena = SubobjectArena::scene_default()?;
        let pipeline = staged.pipeline.insert(RtPipeline::new(rt, &arena)?);

        for (i, colors) in TRIANGLE_COLORS.iter().enumerate() {
            let buffer = allocator.create_buffer_for(
                BufferKind::Uniform,
                std::mem::size_of_val(colors) as u64,
                &format!("triangle_colors_{i}"),
            )?;
            let written = buffer.write(colors.as_slice());
            staged.triangle_colors.push(buffer);
            written?;
        }

        let builder = shader_records(hit_layout, device, &staged.triangle_colors)?;
        staged.shader_table = Some(ShaderTable::new(rt, &mut allocator, pipeline, &builder)?);
        drop(allocator);

        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .descriptor_count(frame_slots),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(frame_slots),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(frame_slots),
        ];
        let descriptor_pool = staged
            .descriptor_pool
            .insert(DescriptorPool::new(device, frame_slots, &pool_sizes)?);
        let mut descriptor_sets = Vec::with_capacity(frames.len());
        for frame in frames {
            let set = descriptor_pool.allocate(device, pipeline.set_layout())?;
            write_acceleration_structure(device, set, 0, tlas.handle);
            write_storage_image(device, set, 1, output.view, vk::ImageLayout::GENERAL);
            write_uniform_buffer(
                device,
                set,
                2,
                frame.pass_constants.buffer,
                0,
                PassConstants::SIZE,
            );
            descriptor_sets.push(set);
        }

        tracing::info!(
            width = extent.width,
            height = extent.height,
            frames = frames.len(),
            "Ray-traced path initialized"
        );
        Ok(descriptor_sets)
    }

    pub fn hit_layout(&self) -> &HitGroupLayout {
        &self.hit_layout
    }

    pub fn tlas(&self) -> &TopLevelAs {
        &self.tlas
    }

    pub fn shader_table(&self) -> &ShaderTable {
        &self.shader_table
    }

    /// Recreate the output image for a new target size.
    ///
    /// # Safety
    /// No frame using the path may be in flight.
    pub unsafe fn resize(&mut self, gpu: &GpuContext, extent: vk::Extent2D) -> Result<()> {
        let device = gpu.device();
        let mut allocator = gpu.allocator().lock();
        let output = OutputImage::new(device, &mut allocator, extent)?;
        std::mem::replace(&mut self.output, output).destroy(device, &mut allocator)?;
        drop(allocator);

        let pool = CommandPool::new(
            device,
            gpu.graphics_queue_family(),
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?;
        let transitioned =
            execute_single_time_commands(device, &pool, gpu.graphics_queue(), |cmd| {
                self.output.record_initial_transition(device, cmd);
                Ok::<_, RenderError>(())
            });
        pool.destroy(device);
        transitioned?;

        for &set in &self.descriptor_sets {
            write_storage_image(device, set, 1, self.output.view, vk::ImageLayout::GENERAL);
        }
        Ok(())
    }

    /// Record the frame: update the TLAS, trace, blit into the target.
    ///
    /// # Safety
    /// The command buffer must be recording and no frame in flight may use
    /// `ctx.slot`.
    pub unsafe fn record(&mut self, device: &ash::Device, ctx: &RecordContext<'_>) -> Result<()> {
        let set = *self
            .descriptor_sets
            .get(ctx.slot)
            .ok_or(RenderError::FrameSlot {
                slot: ctx.slot,
                count: self.descriptor_sets.len(),
            })?;

        let pass = PassConstants::new(ctx.camera, ctx.scene.light_position);
        ctx.bindings.pass_constants.write(std::slice::from_ref(&pass))?;

        let instances = scene_instances(&self.blas, ctx.scene);
        self.tlas.record_build(
            &self.rt,
            ctx.cmd,
            &instances,
            &self.hit_layout,
            BuildMode::Update,
            ctx.slot as u32,
        )?;

        let output = self.output.image.image;
        transition_image(device, ctx.cmd, output, COLOR_RANGE, OUTPUT_IDLE, OUTPUT_TRACING);

        device.cmd_bind_pipeline(
            ctx.cmd,
            vk::PipelineBindPoint::RAY_TRACING_KHR,
            self.pipeline.handle(),
        );
        device.cmd_bind_descriptor_sets(
            ctx.cmd,
            vk::PipelineBindPoint::RAY_TRACING_KHR,
            self.pipeline.layout(),
            0,
            &[set],
            &[],
        );
        let table = &self.shader_table;
        self.rt.rt_loader().cmd_trace_rays(
            ctx.cmd,
            &table.raygen_region,
            &table.miss_region,
            &table.hit_region,
            &table.callable_region,
            self.output.extent.width,
            self.output.extent.height,
            1,
        );

        transition_image(device, ctx.cmd, output, COLOR_RANGE, OUTPUT_TRACING, OUTPUT_IDLE);

        let target = ctx.target;
        let copy_dst = ImageAccess::new(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        );
        transition_image(
            device,
            ctx.cmd,
            target.image,
            COLOR_RANGE,
            ImageAccess::UNDEFINED,
            copy_dst,
        );

        let layers = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let corner = |extent: vk::Extent2D| vk::Offset3D {
            x: extent.width as i32,
            y: extent.height as i32,
            z: 1,
        };
        let region = vk::ImageBlit::default()
            .src_subresource(layers)
            .src_offsets([vk::Offset3D::default(), corner(self.output.extent)])
            .dst_subresource(layers)
            .dst_offsets([vk::Offset3D::default(), corner(target.extent)]);
        device.cmd_blit_image(
            ctx.cmd,
            output,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            target.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
            vk::Filter::NEAREST,
        );

        transition_image(
            device,
            ctx.cmd,
            target.image,
            COLOR_RANGE,
            copy_dst,
            ImageAccess::target_final(target.final_layout),
        );
        Ok(())
    }

    /// # Safety
    /// No frame using the path may be in flight.
    pub unsafe fn destroy(self, gpu: &GpuContext) -> Result<()> {
        let device = gpu.device();
        let mut allocator = gpu.allocator().lock();

        self.descriptor_pool.destroy(device);
        self.output.destroy(device, &mut allocator)?;
        self.shader_table.destroy(&mut allocator)?;
        for mut buffer in self.triangle_colors {
            allocator.free_buffer(&mut buffer)?;
        }
        self.pipeline.destroy(device);
        self.tlas.destroy(&self.rt, &mut allocator)?;
        for blas in self.blas {
            blas.destroy(&self.rt, &mut allocator)?;
        }
        for geometry in self.meshes.into_iter().flatten() {
            geometry.destroy(&mut allocator)?;
        }
        Ok(())
    }
}

/// Top-level instances for the scene's current transforms.
fn scene_instances(blas: &[BottomLevelAs], scene: &Scene) -> Vec<TlasInstance> {
    scene
        .instance_transforms()
        .iter()
        .zip(INSTANCE_BLAS)
        .enumerate()
        .map(|(i, (&transform, b))| TlasInstance::new(i as u32, blas[b].device_address, transform))
        .collect()
}

/// Records for every shader-table slot of the scene.
///
/// Triangle geometries get their instance's colour buffer, the plane spawns
/// shadow rays, and every shadow slot uses the shadow hit group.
fn shader_records<'a>(
    layout: &'a HitGroupLayout,
    device: &ash::Device,
    triangle_colors: &[GpuBuffer],
) -> Result<ShaderTableBuilder<'a>> {
    let mut builder = ShaderTableBuilder::new(layout);
    builder.ray_gen(ShaderRecord::new(
        exports::RAY_GEN,
        vec![LocalArgument::DescriptorTable(0)],
    ));
    builder.miss(RAY_TYPE_PRIMARY, ShaderRecord::bare(exports::MISS))?;
    builder.miss(RAY_TYPE_SHADOW, ShaderRecord::bare(exports::SHADOW_MISS))?;

    for slot in layout.slots() {
        let record = if slot.ray_type == RAY_TYPE_SHADOW {
            ShaderRecord::bare(exports::SHADOW_HIT_GROUP)
        } else if slot.geometry == 0 {
            let colors = &triangle_colors[slot.instance as usize];
            ShaderRecord::new(
                exports::TRI_HIT_GROUP,
                vec![LocalArgument::ConstantBuffer(colors.device_address(device))],
            )
        } else {
            ShaderRecord::new(
                exports::PLANE_HIT_GROUP,
                vec![LocalArgument::DescriptorTable(0)],
            )
        };
        builder.hit(slot.instance, slot.geometry, slot.ray_type, record)?;
    }
    Ok(builder)
}
