//! Acceleration-structure and end-to-end rendering tests on real hardware.

use approx::assert_relative_eq;
use ash::vk;
use glam::{Mat4, Vec3};
use image::RgbaImage;

use prism_core::{MeshData, Transform3x4};
use prism_gpu::command::execute_single_time_commands;
use prism_gpu::{CommandPool, GpuContext, GpuContextBuilder};
use prism_render::raster::CLEAR_COLOR;
use prism_render::{PathKind, RayTracedPath, RenderError, RenderPath, Scene};
use prism_rt::{BottomLevelAs, MeshBuffers, RtDevice, RtError};
use prism_test::{
    create_test_camera, HeadlessRenderer, TestError, VisualRegressionTest, VisualTestConfig,
};

const FRAME_DT: f32 = 1.0 / 60.0;

fn ray_tracing_context() -> GpuContext {
    GpuContextBuilder::new()
        .app_name("prism-rt-test")
        .validation(true)
        .ray_tracing(true)
        .build()
        .unwrap()
}

fn upload(gpu: &GpuContext, meshes: &[MeshData]) -> Vec<MeshBuffers> {
    let mut allocator = gpu.allocator().lock();
    meshes
        .iter()
        .enumerate()
        .map(|(i, mesh)| MeshBuffers::upload(&mut allocator, mesh, &format!("mesh{i}")).unwrap())
        .collect()
}

fn free(gpu: &GpuContext, meshes: Vec<MeshBuffers>) {
    let mut allocator = gpu.allocator().lock();
    for mesh in meshes {
        mesh.destroy(&mut allocator).unwrap();
    }
}

fn distinct_colors(image: &RgbaImage) -> usize {
    let mut colors: Vec<[u8; 4]> = image.pixels().map(|p| p.0).collect();
    colors.sort_unstable();
    colors.dedup();
    colors.len()
}

#[test]
#[ignore = "Requires GPU hardware"]
fn blas_prebuild_sizes_grow_with_geometry_count() {
    let gpu = ray_tracing_context();
    let rt = RtDevice::new(&gpu).unwrap();
    let meshes = upload(
        &gpu,
        &[
            MeshData::triangle(),
            Scene::ground_plane(),
            MeshData::cube(1.0, 1.0, 1.0),
        ],
    );

    let mut previous = 0;
    for count in 1..=meshes.len() {
        let refs: Vec<&MeshBuffers> = meshes[..count].iter().collect();
        // SAFETY: The mesh buffers are live
        let sizes = unsafe { BottomLevelAs::query_sizes(&rt, &refs).unwrap() };
        assert!(sizes.acceleration_structure_size > 0);
        assert!(sizes.build_scratch_size > 0);
        assert!(
            sizes.acceleration_structure_size >= previous,
            "{count} geometries need {} bytes, fewer needed {previous}",
            sizes.acceleration_structure_size
        );
        previous = sizes.acceleration_structure_size;
    }

    free(&gpu, meshes);
}

#[test]
#[ignore = "Requires GPU hardware"]
fn blas_over_triangle_and_quad_builds() {
    let gpu = ray_tracing_context();
    let rt = RtDevice::new(&gpu).unwrap();
    let meshes = upload(&gpu, &[MeshData::triangle(), Scene::ground_plane()]);
    let device = gpu.device();

    // SAFETY: All handles are valid and the queue is idle
    let mut blas = unsafe {
        let pool = CommandPool::new(
            device,
            gpu.graphics_queue_family(),
            vk::CommandPoolCreateFlags::TRANSIENT,
        )
        .unwrap();
        let built = execute_single_time_commands(device, &pool, gpu.graphics_queue(), |cmd| {
            let refs: Vec<&MeshBuffers> = meshes.iter().collect();
            let mut allocator = gpu.allocator().lock();
            BottomLevelAs::build(&rt, &mut allocator, cmd, &refs, "test_blas")
        });
        pool.destroy(device);
        built.unwrap()
    };

    assert_eq!(blas.geometry_count, 2);
    assert_ne!(blas.device_address, 0);
    assert!(blas.sizes.acceleration_structure_size > 0);

    let mut allocator = gpu.allocator().lock();
    blas.release_scratch(&mut allocator).unwrap();
    assert!(blas.buffers.scratch.is_none());
    // SAFETY: The build has completed
    unsafe { blas.destroy(&rt, &mut allocator).unwrap() };
    drop(allocator);

    free(&gpu, meshes);
}

#[test]
#[ignore = "Requires GPU hardware"]
fn tlas_updates_only_move_transforms() {
    let (width, height) = (64, 64);
    let mut renderer = HeadlessRenderer::new(width, height, PathKind::RayTraced).unwrap();
    let camera = create_test_camera(width, height);
    let mut scene = Scene::new();

    let first = {
        renderer.render(&scene, &camera).unwrap();
        let RenderPath::RayTraced(path) = renderer.path().unwrap() else {
            panic!("expected the ray-traced path");
        };
        path.tlas()
            .read_instances(renderer.last_slot() as u32)
            .unwrap()
    };

    for _ in 0..10 {
        scene.advance(FRAME_DT);
        renderer.render(&scene, &camera).unwrap();
    }

    let RenderPath::RayTraced(path) = renderer.path().unwrap() else {
        panic!("expected the ray-traced path");
    };
    let tlas = path.tlas();
    let layout = path.hit_layout();
    let instances = tlas.read_instances(renderer.last_slot() as u32).unwrap();

    assert_eq!(tlas.instance_count(), 3);
    assert_eq!(instances.len(), first.len());
    for (i, (now, before)) in instances.iter().zip(&first).enumerate() {
        assert_eq!(now.instance_id(), before.instance_id());
        assert_eq!(now.blas_address, before.blas_address);
        assert_eq!(now.mask(), before.mask());
        assert_eq!(Some(now.sbt_offset()), layout.instance_offset(i as u32));
    }

    let offsets: Vec<u32> = instances.iter().map(|d| d.sbt_offset()).collect();
    layout.verify_instance_offsets(&offsets).unwrap();

    let expected = Transform3x4::from_mat4(
        Mat4::from_translation(Vec3::new(-2.0, 0.0, 0.0)) * Mat4::from_rotation_y(scene.angle()),
    );
    for (row, expected_row) in instances[1].transform.rows.iter().zip(&expected.rows) {
        for (value, expected_value) in row.iter().zip(expected_row) {
            assert_relative_eq!(*value, *expected_value, epsilon = 1e-5);
        }
    }
    assert_eq!(instances[0].transform, Transform3x4::IDENTITY);
}

#[test]
#[ignore = "Requires GPU hardware"]
fn ray_traced_frame_shows_scene() {
    let (width, height) = (128, 96);
    let mut renderer = HeadlessRenderer::new(width, height, PathKind::RayTraced).unwrap();
    let camera = create_test_camera(width, height);

    let image = renderer.render(&Scene::new(), &camera).unwrap();
    assert_eq!(image.dimensions(), (width, height));
    // Sky gradient, plane with shadows and three interpolated triangles.
    assert!(distinct_colors(&image) > 16);
}

#[test]
#[ignore = "Requires GPU hardware"]
fn raster_frame_draws_over_clear_color() {
    let (width, height) = (128, 96);
    let mut renderer = HeadlessRenderer::new(width, height, PathKind::Raster).unwrap();
    let camera = create_test_camera(width, height);

    let image = renderer.render(&Scene::new(), &camera).unwrap();
    assert_eq!(image.dimensions(), (width, height));

    let clear = CLEAR_COLOR.map(|c| (c * 255.0).round() as u8);
    let center = image.get_pixel(width / 2, height / 2).0;
    assert_ne!(center, clear, "the centre triangle should cover the clear colour");
    assert!(distinct_colors(&image) > 2);
}

#[test]
#[ignore = "Requires GPU hardware"]
fn ray_traced_renderer_needs_ray_tracing() {
    let gpu = GpuContextBuilder::new()
        .app_name("prism-rt-test")
        .build()
        .unwrap();
    assert!(matches!(RtDevice::new(&gpu), Err(RtError::Unsupported)));
}

#[test]
#[ignore = "Requires GPU hardware"]
fn failed_path_creation_frees_what_it_built() {
    let gpu = ray_tracing_context();
    let before = gpu.allocator().lock().live_allocations();
    let extent = vk::Extent2D {
        width: 64,
        height: 64,
    };

    // Meshes upload before the top-level structure rejects zero frame slots.
    // SAFETY: The context is valid and idle
    let result = unsafe { RayTracedPath::new(&gpu, extent, &[], &Scene::new()) };

    assert!(matches!(result, Err(RenderError::RayTracing(RtError::Acceleration(_)))));
    assert_eq!(gpu.allocator().lock().live_allocations(), before);
}

#[test]
#[ignore = "Requires GPU hardware"]
fn both_paths_match_their_baselines() {
    let root = format!("{}/visual", env!("CARGO_TARGET_TMPDIR"));
    let _ = std::fs::remove_dir_all(&root);
    let config = VisualTestConfig {
        threshold: 0.001,
        baseline_dir: format!("{root}/baselines"),
        output_dir: format!("{root}/output"),
    };

    for (kind, name) in [
        (PathKind::RayTraced, "ray_traced_scene"),
        (PathKind::Raster, "raster_scene"),
    ] {
        let mut test =
            VisualRegressionTest::with_dimensions(config.clone(), 128, 96, kind).unwrap();
        let camera = create_test_camera(128, 96);
        let scene = Scene::new();

        // First run records the baseline, the second must reproduce it.
        test.run_test(name, &scene, &camera).unwrap();
        test.run_test(name, &scene, &camera).unwrap();

        let mut moved = camera;
        moved.set_position(Vec3::new(0.0, 4.0, 6.0));
        moved.look_at(Vec3::ZERO);
        let result = test.run_test(name, &scene, &moved);
        assert!(
            matches!(result, Err(TestError::ImageComparison(_))),
            "{kind} view from a new position should differ from the baseline"
        );
    }
}
