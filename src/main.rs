// Scene renderer entry point
//
// The window shell: owns the winit event loop, creates the device and the
// renderer when the window appears, and forwards resize/redraw events into
// the frame loop. All rendering logic lives in `renderer`.

mod backend;
mod config;
mod error;
mod renderer;
mod scene;

use anyhow::{Context, Result};
use backend::RenderDevice;
use config::Config;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use renderer::Renderer;
use scene::SceneData;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = Config::load();
    log::info!("Starting scene renderer");
    log::info!("Window: {}x{}", config.window.width, config.window.height);
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    // A render failure stops the loop; surface it as the process result.
    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

struct App {
    config: Config,
    window: Option<Arc<Window>>,
    // Declared before the device so it tears down first.
    renderer: Option<Renderer>,
    device: Option<Arc<RenderDevice>>,
    is_minimized: bool,
    needs_resize: bool,
    /// First unrecoverable error; set once, then the event loop exits.
    fatal: Option<anyhow::Error>,

    frame_count: u32,
    last_fps_update: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            window: None,
            renderer: None,
            device: None,
            is_minimized: false,
            needs_resize: false,
            fatal: None,
            frame_count: 0,
            last_fps_update: Instant::now(),
        }
    }

    fn init_renderer(&mut self, window: Arc<Window>) -> Result<()> {
        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;

        let display_handle = window.raw_display_handle();
        let window_handle = window.raw_window_handle();

        let device = RenderDevice::new(
            &self.config.window.title,
            enable_validation,
            Some(display_handle),
        )?;

        let surface = unsafe {
            ash_window::create_surface(
                device.entry(),
                &device.instance,
                display_handle,
                window_handle,
                None,
            )
        }
        .context("Failed to create window surface")?;

        let scene = match &self.config.scene.model_path {
            Some(path) => SceneData::load_obj(Path::new(path), self.config.scene.scale)?,
            None => {
                log::info!("No model configured, rendering the unit cube");
                SceneData::unit_cube(self.config.scene.scale)
            }
        };

        let size = window.inner_size();
        let renderer = Renderer::new(
            &device,
            surface,
            size.width,
            size.height,
            &self.config,
            &scene,
        )?;

        self.device = Some(device);
        self.renderer = Some(renderer);
        Ok(())
    }

    fn render_frame(&mut self) -> Result<bool> {
        if self.is_minimized {
            return Ok(false);
        }
        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(false);
        };

        if self.needs_resize {
            let size = self
                .window
                .as_ref()
                .map(|w| w.inner_size())
                .unwrap_or_default();
            if renderer.resize(size.width, size.height)? {
                self.needs_resize = false;
            } else {
                return Ok(false);
            }
        }

        if renderer.draw_frame()? {
            self.needs_resize = true;
        }
        Ok(true)
    }

    /// Record the first unrecoverable error. Frame-loop failures are fatal;
    /// the caller exits the event loop right after.
    fn record_fatal(&mut self, error: anyhow::Error) {
        log::error!("Render error: {:?}", error);
        if let Some(ref device) = self.device {
            let _ = device.wait_idle();
        }
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }
        self.frame_count += 1;
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS",
                    self.config.window.title, fps
                ));
            }
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_renderer(window.clone()) {
            log::error!("Failed to initialize renderer: {:?}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(ref device) = self.device {
                    let _ = device.wait_idle();
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    self.needs_resize = true;
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(rendered) => {
                    if rendered {
                        self.update_fps();
                    }
                }
                Err(e) => {
                    self.record_fatal(e);
                    event_loop.exit();
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};
                if event.state.is_pressed() {
                    if let PhysicalKey::Code(KeyCode::Escape) = event.physical_key {
                        log::info!("ESC pressed, exiting...");
                        event_loop.exit();
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_failure_is_recorded_and_surfaced() {
        let mut app = App::new(Config::default());
        assert!(app.fatal.is_none());

        app.record_fatal(error::RenderError::EmptyUpload.into());
        assert!(app.fatal.is_some());

        // Only the first failure is reported; later ones must not mask it.
        app.record_fatal(error::RenderError::NoAdapter.into());
        let surfaced = app.fatal.take().unwrap();
        assert!(surfaced.to_string().contains("empty"));
    }
}
