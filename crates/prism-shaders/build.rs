//! Build script to compile GLSL shaders to SPIR-V.

use shaderc::{Compiler, ShaderKind};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// (source file, output name, stage)
const SHADERS: &[(&str, &str, ShaderKind)] = &[
    ("raygen.rgen", "raygen.spv", ShaderKind::RayGeneration),
    ("miss.rmiss", "miss.spv", ShaderKind::Miss),
    ("shadow_miss.rmiss", "shadow_miss.spv", ShaderKind::Miss),
    ("tri_hit.rchit", "tri_hit.spv", ShaderKind::ClosestHit),
    ("plane_hit.rchit", "plane_hit.spv", ShaderKind::ClosestHit),
    ("shadow_hit.rchit", "shadow_hit.spv", ShaderKind::ClosestHit),
    ("mesh.vert", "mesh_vert.spv", ShaderKind::Vertex),
    ("mesh.frag", "mesh_frag.spv", ShaderKind::Fragment),
];

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let shader_dir = Path::new("shaders");

    // Rerun if shaders change
    println!("cargo:rerun-if-changed=shaders/");

    let compiler = Compiler::new().expect("Failed to create shader compiler");

    for (source, output, kind) in SHADERS {
        compile_shader(
            &compiler,
            shader_dir,
            source,
            &out_dir.join(output),
            *kind,
        );
    }
}

fn compile_shader(
    compiler: &Compiler,
    shader_dir: &Path,
    file_name: &str,
    output_path: &Path,
    kind: ShaderKind,
) {
    let input_path = shader_dir.join(file_name);
    let source = fs::read_to_string(&input_path)
        .unwrap_or_else(|e| panic!("Failed to read shader {input_path:?}: {e}"));

    let mut options = shaderc::CompileOptions::new().expect("Failed to create compile options");
    options.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_3 as u32,
    );
    options.set_target_spirv(shaderc::SpirvVersion::V1_6);
    options.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let include_dir = shader_dir.to_path_buf();
    options.set_include_callback(move |requested, _include_type, _source, _depth| {
        let path = include_dir.join(requested);
        let content = fs::read_to_string(&path).map_err(|e| format!("{path:?}: {e}"))?;
        Ok(shaderc::ResolvedInclude {
            resolved_name: path.to_string_lossy().into_owned(),
            content,
        })
    });

    let result = compiler
        .compile_into_spirv(&source, kind, file_name, "main", Some(&options))
        .unwrap_or_else(|e| panic!("Failed to compile shader {input_path:?}: {e}"));

    if result.get_num_warnings() > 0 {
        println!(
            "cargo:warning=Shader warnings in {input_path:?}: {}",
            result.get_warning_messages()
        );
    }

    fs::write(output_path, bytemuck::cast_slice::<u32, u8>(result.as_binary()))
        .unwrap_or_else(|e| panic!("Failed to write shader {output_path:?}: {e}"));
}
