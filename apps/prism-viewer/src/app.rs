//! Viewer application: the fixed scene behind a switchable render path.

use std::collections::HashSet;

use anyhow::Context;
use prism_app::{
    AppContext, Camera, ElementState, FrameContext, KeyCode, KeyEvent, PhysicalKey, RenderApp,
    RenderPath, Scene, WindowEvent,
};
use prism_render::RecordContext;
use tracing::{error, info};

use crate::config::ViewerConfig;

/// Camera movement speed in units per second.
const MOVE_SPEED: f32 = 3.0;

/// Camera turn rate in radians per second.
const TURN_SPEED: f32 = 1.5;

/// Keys currently held down.
#[derive(Default)]
struct HeldKeys(HashSet<KeyCode>);

impl HeldKeys {
    fn set(&mut self, code: KeyCode, state: ElementState) {
        match state {
            ElementState::Pressed => self.0.insert(code),
            ElementState::Released => self.0.remove(&code),
        };
    }

    /// +1 while any `positive` key is held, -1 for `negative`, 0 for both or neither.
    fn axis(&self, positive: &[KeyCode], negative: &[KeyCode]) -> f32 {
        let held = |keys: &[KeyCode]| keys.iter().any(|k| self.0.contains(k));
        f32::from(u8::from(held(positive))) - f32::from(u8::from(held(negative)))
    }
}

pub struct Viewer {
    config: ViewerConfig,
    camera: Camera,
    scene: Scene,
    path: Option<RenderPath>,
    keys: HeldKeys,
    switch_requested: bool,
    should_exit: bool,
}

impl Viewer {
    fn move_camera(&mut self, dt: f32) {
        let forward = self
            .keys
            .axis(&[KeyCode::KeyW, KeyCode::ArrowUp], &[KeyCode::KeyS, KeyCode::ArrowDown]);
        let right = self.keys.axis(
            &[KeyCode::KeyD, KeyCode::ArrowRight],
            &[KeyCode::KeyA, KeyCode::ArrowLeft],
        );
        let turn = self.keys.axis(&[KeyCode::KeyE], &[KeyCode::KeyQ]);

        self.camera.move_forward(forward * MOVE_SPEED * dt);
        self.camera.move_right(right * MOVE_SPEED * dt);
        self.camera.yaw(turn * TURN_SPEED * dt);
    }
}

impl RenderApp for Viewer {
    type Options = ViewerConfig;

    fn init(ctx: &mut AppContext, config: ViewerConfig) -> anyhow::Result<Self> {
        let scene = Scene::new();

        let mut camera = Camera::default();
        camera.set_aspect(ctx.aspect_ratio());

        // SAFETY: Nothing has been submitted yet
        let path = unsafe { ctx.create_path(config.initial_path, &scene)? };

        if config.toggle_key {
            info!("Press R to switch between raster and ray tracing");
        }

        Ok(Self {
            config,
            camera,
            scene,
            path: Some(path),
            keys: HeldKeys::default(),
            switch_requested: false,
            should_exit: false,
        })
    }

    fn update(&mut self, ctx: &mut AppContext, dt: f32) -> anyhow::Result<()> {
        self.scene.advance(dt);
        self.move_camera(dt);

        if std::mem::take(&mut self.switch_requested) {
            if let Some(path) = self.path.take() {
                let from = path.kind();
                // SAFETY: The device is valid; switching waits for frames in flight
                match unsafe { ctx.switch_path(path, &self.scene) } {
                    Ok(next) => {
                        info!("Switched from {from} to {}", next.kind());
                        self.path = Some(next);
                    }
                    Err(e) => {
                        self.should_exit = true;
                        return Err(e.context("switching render path"));
                    }
                }
            }
        }

        Ok(())
    }

    fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()> {
        let path = self.path.as_mut().context("no active render path")?;

        let record = RecordContext {
            cmd: frame.command_buffer,
            slot: frame.slot,
            target: frame.target,
            bindings: ctx.frames.current().bindings(),
            camera: &self.camera,
            scene: &self.scene,
        };

        // SAFETY: The command buffer is recording and the slot's previous frame has retired
        unsafe { path.record(ctx.gpu.device(), &record)? };
        Ok(())
    }

    fn on_resize(&mut self, ctx: &mut AppContext, _width: u32, _height: u32) -> anyhow::Result<()> {
        self.camera.set_aspect(ctx.aspect_ratio());
        if let Some(path) = &mut self.path {
            // SAFETY: The runner waits for the device before resizing
            unsafe { path.resize(&ctx.gpu, ctx.extent())? };
        }
        Ok(())
    }

    fn on_event(&mut self, event: &WindowEvent) -> bool {
        let WindowEvent::KeyboardInput {
            event:
                KeyEvent {
                    physical_key: PhysicalKey::Code(code),
                    state,
                    repeat,
                    ..
                },
            ..
        } = event
        else {
            return false;
        };

        self.keys.set(*code, *state);

        if *state == ElementState::Pressed && !*repeat {
            match code {
                KeyCode::KeyR if self.config.toggle_key => self.switch_requested = true,
                KeyCode::Escape => self.should_exit = true,
                _ => {}
            }
        }
        true
    }

    fn should_exit(&self) -> bool {
        self.should_exit
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        if let Some(path) = self.path.take() {
            // SAFETY: The runner idles the GPU before cleanup
            if let Err(e) = unsafe { path.destroy(&ctx.gpu) } {
                error!("Failed to destroy render path: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opposing_keys_cancel() {
        let mut keys = HeldKeys::default();
        assert_eq!(keys.axis(&[KeyCode::KeyW], &[KeyCode::KeyS]), 0.0);

        keys.set(KeyCode::KeyW, ElementState::Pressed);
        assert_eq!(keys.axis(&[KeyCode::KeyW], &[KeyCode::KeyS]), 1.0);

        keys.set(KeyCode::KeyS, ElementState::Pressed);
        assert_eq!(keys.axis(&[KeyCode::KeyW], &[KeyCode::KeyS]), 0.0);

        keys.set(KeyCode::KeyW, ElementState::Released);
        assert_eq!(keys.axis(&[KeyCode::KeyW], &[KeyCode::KeyS]), -1.0);
    }

    #[test]
    fn alternate_bindings_count_once() {
        let mut keys = HeldKeys::default();
        keys.set(KeyCode::KeyD, ElementState::Pressed);
        keys.set(KeyCode::ArrowRight, ElementState::Pressed);
        assert_eq!(
            keys.axis(&[KeyCode::KeyD, KeyCode::ArrowRight], &[KeyCode::KeyA]),
            1.0
        );
    }
}
