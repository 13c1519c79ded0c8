//! Command-line configuration.

use anyhow::{bail, Context};
use prism_render::PathKind;

/// Viewer options parsed from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerConfig {
    /// Path used for the first frame.
    pub initial_path: PathKind,
    /// Whether `R` switches paths at runtime.
    pub toggle_key: bool,
    pub vsync: bool,
    pub validation: bool,
    pub width: u32,
    pub height: u32,
    pub help: bool,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            initial_path: PathKind::RayTraced,
            toggle_key: false,
            vsync: false,
            validation: cfg!(debug_assertions),
            width: 1280,
            height: 720,
            help: false,
        }
    }
}

impl ViewerConfig {
    /// Parse the process arguments.
    pub fn from_args() -> anyhow::Result<Self> {
        Self::parse(std::env::args().skip(1))
    }

    /// Parse arguments, excluding the program name.
    pub fn parse<I, S>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_ref() {
                "--raster" => config.initial_path = PathKind::Raster,
                "--toggle-key" => config.toggle_key = true,
                "--vsync" => config.vsync = true,
                "--no-validation" => config.validation = false,
                "--size" => {
                    let value = args.next().context("--size needs a value like 1280x720")?;
                    (config.width, config.height) = parse_size(value.as_ref())?;
                }
                "-h" | "--help" => config.help = true,
                other => bail!("unknown argument `{other}` (see --help)"),
            }
        }

        Ok(config)
    }

    /// Whether the device must support ray tracing: the ray-traced path is
    /// either the first one shown or reachable with the toggle key.
    pub fn needs_ray_tracing(&self) -> bool {
        self.toggle_key || self.initial_path == PathKind::RayTraced
    }
}

fn parse_size(value: &str) -> anyhow::Result<(u32, u32)> {
    let (width, height) = value
        .split_once(['x', 'X'])
        .with_context(|| format!("size `{value}` is not WIDTHxHEIGHT"))?;
    let width: u32 = width
        .parse()
        .with_context(|| format!("bad width in `{value}`"))?;
    let height: u32 = height
        .parse()
        .with_context(|| format!("bad height in `{value}`"))?;
    if width == 0 || height == 0 {
        bail!("size `{value}` must be non-zero");
    }
    Ok((width, height))
}

pub fn print_help() {
    eprintln!(
        "Prism viewer: three triangles over a ground plane, ray traced or rasterized

USAGE:
    cargo run -p prism-viewer -- [OPTIONS]

OPTIONS:
    --raster            Start with the raster path (default: ray traced)
    --toggle-key        Let R switch between raster and ray tracing
    --vsync             Present with vsync
    --no-validation     Disable Vulkan validation layers
    --size <WxH>        Window size (default: 1280x720)
    -h, --help          Print this help message

CONTROLS:
    W/A/S/D, arrows     Move and strafe
    Q/E                 Turn
    R                   Switch path (with --toggle-key)
    Escape              Quit

ENVIRONMENT VARIABLES:
    RUST_LOG            Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_ray_tracing_without_toggle() {
        let config = ViewerConfig::parse(Vec::<String>::new()).unwrap();
        assert_eq!(config.initial_path, PathKind::RayTraced);
        assert!(!config.toggle_key);
        assert_eq!((config.width, config.height), (1280, 720));
    }

    #[test]
    fn parses_every_flag() {
        let config = ViewerConfig::parse([
            "--raster",
            "--toggle-key",
            "--vsync",
            "--no-validation",
            "--size",
            "800x600",
        ])
        .unwrap();
        assert_eq!(config.initial_path, PathKind::Raster);
        assert!(config.toggle_key);
        assert!(config.vsync);
        assert!(!config.validation);
        assert_eq!((config.width, config.height), (800, 600));
        assert!(!config.help);
    }

    #[test]
    fn ray_tracing_needed_unless_raster_only() {
        assert!(ViewerConfig::parse(Vec::<String>::new()).unwrap().needs_ray_tracing());
        assert!(ViewerConfig::parse(["--raster", "--toggle-key"]).unwrap().needs_ray_tracing());
        assert!(!ViewerConfig::parse(["--raster"]).unwrap().needs_ray_tracing());
    }

    #[test]
    fn help_flag() {
        assert!(ViewerConfig::parse(["-h"]).unwrap().help);
        assert!(ViewerConfig::parse(["--help"]).unwrap().help);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(ViewerConfig::parse(["--size"]).is_err());
        assert!(ViewerConfig::parse(["--size", "800"]).is_err());
        assert!(ViewerConfig::parse(["--size", "0x600"]).is_err());
        assert!(ViewerConfig::parse(["--size", "wide x tall"]).is_err());
        assert!(ViewerConfig::parse(["--fullscreen"]).is_err());
    }
}
