//! GLSL shaders and their compiled SPIR-V bytecode.
//!
//! Shaders are compiled at build time using shaderc. Every ray-tracing stage
//! shares `shaders/common.glsl`, which fixes the payload layout, the ray-type
//! numbering and the global descriptor bindings.

use std::sync::OnceLock;

/// Convert byte slice to aligned u32 Vec (SPIR-V requires 4-byte alignment).
fn bytes_to_spirv(bytes: &[u8]) -> Vec<u32> {
    assert!(
        bytes.len() % 4 == 0,
        "SPIR-V bytecode must be 4-byte aligned"
    );
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

macro_rules! spirv_shader {
    ($(#[$meta:meta])* $name:ident => $file:literal) => {
        $(#[$meta])*
        pub fn $name() -> &'static [u32] {
            static SPIRV: OnceLock<Vec<u32>> = OnceLock::new();
            SPIRV.get_or_init(|| {
                bytes_to_spirv(include_bytes!(concat!(env!("OUT_DIR"), "/", $file)))
            })
        }
    };
}

spirv_shader!(
    /// Camera ray generation.
    raygen => "raygen.spv"
);
spirv_shader!(
    /// Background gradient for primary rays.
    miss => "miss.spv"
);
spirv_shader!(
    /// Marks shadow rays that reach the light.
    shadow_miss => "shadow_miss.spv"
);
spirv_shader!(
    /// Barycentric shading with per-instance colours from the shader record.
    tri_hit => "tri_hit.spv"
);
spirv_shader!(
    /// Ground plane shading; spawns a shadow ray.
    plane_hit => "plane_hit.spv"
);
spirv_shader!(
    /// Marks shadow rays as occluded.
    shadow_hit => "shadow_hit.spv"
);
spirv_shader!(
    /// Raster path vertex stage.
    mesh_vert => "mesh_vert.spv"
);
spirv_shader!(
    /// Raster path fragment stage.
    mesh_frag => "mesh_frag.spv"
);

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn all_shaders_load() {
        for shader in [
            raygen(),
            miss(),
            shadow_miss(),
            tri_hit(),
            plane_hit(),
            shadow_hit(),
            mesh_vert(),
            mesh_frag(),
        ] {
            assert_eq!(shader[0], SPIRV_MAGIC, "Invalid SPIR-V magic number");
            assert!(shader.len() > 20, "Shader too small");
        }
    }

    #[test]
    #[should_panic(expected = "4-byte aligned")]
    fn rejects_truncated_bytecode() {
        bytes_to_spirv(&[0x03, 0x02, 0x23]);
    }
}
