//! Prism viewer.
//!
//! Renders three coloured triangles over a ground plane, either with
//! hardware ray tracing (with hard shadows) or with a plain raster pass.
//! Two of the triangles spin in place, which refits the top-level
//! acceleration structure every frame.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p prism-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--raster`: Start with the raster path
//! - `--toggle-key`: Let `R` switch paths at runtime
//! - `--vsync`: Present with vsync
//! - `--no-validation`: Disable Vulkan validation layers
//! - `--size <WxH>`: Window size
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;
mod config;

use prism_app::{run_app, AppConfig};

use crate::app::Viewer;
use crate::config::{print_help, ViewerConfig};

fn main() -> anyhow::Result<()> {
    let config = ViewerConfig::from_args()?;
    if config.help {
        print_help();
        return Ok(());
    }

    let app_config = AppConfig::new("Prism")
        .with_size(config.width, config.height)
        .with_vsync(config.vsync)
        .with_validation(config.validation)
        .with_ray_tracing(config.needs_ray_tracing());

    run_app::<Viewer>(app_config, config)
}
