// =============================================================================
// VULKAN RAY TRACER
// =============================================================================
//
// Traces a small scene with hardware ray tracing and presents the result.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  App (winit event loop, config, input)                          │
// │    └── Vulkan Device + Swapchain                                │
// │          └── RayTracer (BLAS/TLAS, RT pipeline, SBT)            │
// │                └── Per-frame command buffer + storage image     │
// │                      └── Synchronization (fences, semaphores)   │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait for the fence of this frame slot
// 2. Acquire swapchain image (out of date -> recreate)
// 3. Wait for whichever frame last used that image
// 4. Record: trace rays into storage image, blit to swapchain image
// 5. Submit, then present on the present queue
//
// =============================================================================

mod backend;
mod camera;
mod capture;
mod config;
mod files;
mod hot_reload;
mod logging;
mod renderer;
mod scene;

use anyhow::{Context, Result};
use ash::vk;
use backend::sync::{FrameSync, ImagesInFlight};
use backend::{Swapchain, VulkanDevice};
use capture::FrameCapture;
use config::{Config, KeyBindings};
use hot_reload::ShaderWatcher;
use renderer::RayTracer;
use scene::Scene;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::PhysicalKey,
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    logging::init(&config.debug)?;
    log::info!("Starting Vulkan ray tracer");
    log::info!("Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Main application struct holding all Vulkan resources.
///
/// Field order matters for Drop: the renderer and swapchain hold an Arc of
/// the device, sync objects are destroyed explicitly in Drop.
pub struct App {
    // ─────────────────────────────────────────────────────────────────────────
    // CONFIGURATION
    // ─────────────────────────────────────────────────────────────────────────
    config: Config,
    bindings: KeyBindings,

    // ─────────────────────────────────────────────────────────────────────────
    // WINDOW
    // ─────────────────────────────────────────────────────────────────────────
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // RENDERING (dropped top to bottom, device last)
    // ─────────────────────────────────────────────────────────────────────────
    renderer: Option<RayTracer>,
    swapchain: Option<Swapchain>,
    device: Option<Arc<VulkanDevice>>,

    // ─────────────────────────────────────────────────────────────────────────
    // SYNCHRONIZATION
    // ─────────────────────────────────────────────────────────────────────────
    /// Sync objects for each frame in flight
    frame_sync: Vec<FrameSync>,
    /// Fence of the frame currently using each swapchain image
    images_in_flight: ImagesInFlight,
    /// Which sync slot we're currently using (0 to max_frames_in_flight-1)
    current_frame: usize,
    wait_stages: [vk::PipelineStageFlags; 1],

    // ─────────────────────────────────────────────────────────────────────────
    // TOOLS
    // ─────────────────────────────────────────────────────────────────────────
    capture: FrameCapture,
    shader_watcher: Option<ShaderWatcher>,

    // ─────────────────────────────────────────────────────────────────────────
    // STATE FLAGS
    // ─────────────────────────────────────────────────────────────────────────
    /// Set when the window is resized or present reports a stale swapchain
    needs_resize: bool,
    /// Window has zero area - skip rendering
    is_minimized: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // FPS TRACKING
    // ─────────────────────────────────────────────────────────────────────────
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    pub fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let bindings = config.controls.bindings();
        let capture = FrameCapture::new(config.debug.renderdoc);
        if capture.is_available() {
            log::info!("Press {:?} to capture a frame", bindings.capture);
        }
        let now = Instant::now();
        Self {
            config,
            bindings,
            window: None,
            is_fullscreen,
            renderer: None,
            swapchain: None,
            device: None,
            frame_sync: Vec::new(),
            images_in_flight: ImagesInFlight::default(),
            current_frame: 0,
            // The first use of the swapchain image is the blit
            wait_stages: [vk::PipelineStageFlags::TRANSFER],
            capture,
            shader_watcher: None,
            needs_resize: false,
            is_minimized: false,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    /// Device, swapchain, ray tracer and sync objects, in that order
    fn init_vulkan(&mut self, window: &Window) -> Result<()> {
        log::info!("Initializing Vulkan...");

        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let device = VulkanDevice::new(&self.config.window.title, window, enable_validation)?;
        self.device = Some(device.clone());

        let size = window.inner_size();
        let swapchain = Swapchain::new(
            device.clone(),
            size.width.max(1),
            size.height.max(1),
            self.config.preferred_present_mode(),
        )?;
        log::info!("Presenting {:?} with {:?}", swapchain.format, swapchain.present_mode);

        let renderer = RayTracer::new(device.clone(), &self.config, &Scene::default(), swapchain.extent)?;

        // Sync objects don't depend on the swapchain and survive resizes
        let frame_sync = (0..self.config.graphics.max_frames_in_flight)
            .map(|_| FrameSync::new(&device))
            .collect::<Result<Vec<_>>>()?;

        self.images_in_flight = ImagesInFlight::new(swapchain.images.len());
        self.frame_sync = frame_sync;
        self.renderer = Some(renderer);
        self.swapchain = Some(swapchain);

        if self.config.shaders.hot_reload {
            match ShaderWatcher::new(&self.config.shaders.directory) {
                Ok(watcher) => self.shader_watcher = Some(watcher),
                Err(e) => log::warn!("Shader hot-reload disabled: {:#}", e),
            }
        }

        log::info!("Vulkan initialized successfully!");
        Ok(())
    }

    /// Rebuild the swapchain for the current window size
    fn recreate_swapchain(&mut self) -> Result<()> {
        let window = self.window.clone().context("Window not initialized")?;
        let device = self.device.clone().context("Device not initialized")?;

        let size = window.inner_size();
        if size.width == 0 || size.height == 0 {
            self.is_minimized = true;
            return Ok(());
        }
        self.is_minimized = false;

        device.wait_idle()?;

        // The surface can only have one swapchain at a time
        self.swapchain = None;
        let swapchain = Swapchain::new(
            device,
            size.width,
            size.height,
            self.config.preferred_present_mode(),
        )?;

        if let Some(renderer) = self.renderer.as_mut() {
            renderer.resize(swapchain.extent)?;
        }
        self.images_in_flight.reset(swapchain.images.len());
        log::debug!("Swapchain recreated with {} images", self.images_in_flight.len());
        self.swapchain = Some(swapchain);
        self.needs_resize = false;

        Ok(())
    }

    // =========================================================================
    // FRAME RENDERING
    // =========================================================================

    /// Render one frame. Returns false if nothing was presented.
    pub fn render_frame(&mut self) -> Result<bool> {
        if self.is_minimized {
            return Ok(false);
        }

        if self.needs_resize {
            self.recreate_swapchain()?;
            if self.is_minimized {
                return Ok(false);
            }
        }

        let device = self.device.clone().context("Device not initialized")?;
        let swapchain = self.swapchain.as_ref().context("Swapchain not initialized")?;
        let renderer = self.renderer.as_ref().context("Renderer not initialized")?;
        let sync = self.frame_sync.get(self.current_frame).context("Frame sync not initialized")?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Wait until this frame slot's previous submission is done
        // ─────────────────────────────────────────────────────────────────────
        unsafe {
            device.device.wait_for_fences(&[sync.in_flight_fence], true, u64::MAX)?;
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Acquire next swapchain image
        // ─────────────────────────────────────────────────────────────────────
        let image_index = match swapchain.acquire_next_image(u64::MAX, sync.image_available)? {
            Some((index, suboptimal)) => {
                if suboptimal {
                    self.needs_resize = true;
                }
                index
            }
            None => {
                self.needs_resize = true;
                return Ok(false);
            }
        };

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Wait for the frame that last rendered to this image
        // ─────────────────────────────────────────────────────────────────────
        if let Some(previous) = self.images_in_flight.claim(image_index as usize, sync.in_flight_fence) {
            unsafe { device.device.wait_for_fences(&[previous], true, u64::MAX)? };
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Record and submit
        // ─────────────────────────────────────────────────────────────────────
        let cmd = match renderer.record(
            self.current_frame,
            swapchain.images[image_index as usize],
            swapchain.extent,
        ) {
            Ok(cmd) => cmd,
            Err(e) => {
                // The image stays acquired until the swapchain is rebuilt
                self.needs_resize = true;
                release_frame(&device, sync, &self.wait_stages)?;
                return Err(e);
            }
        };

        let wait_semaphores = [sync.image_available];
        let signal_semaphores = [sync.render_finished];
        let command_buffers = [cmd];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        // Reset only once the work that signals it is ready to go
        unsafe {
            device.device.reset_fences(&[sync.in_flight_fence])?;
            device.device.queue_submit(
                device.graphics_queue,
                &[submit_info.build()],
                sync.in_flight_fence,
            )?;
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 5: Present the image
        // ─────────────────────────────────────────────────────────────────────
        if swapchain.present(device.present_queue, image_index, &[sync.render_finished])? {
            self.needs_resize = true;
        }

        self.current_frame = (self.current_frame + 1) % self.frame_sync.len();

        Ok(true)
    }

    /// Errors are logged and the next redraw tries again
    fn frame_finished(&mut self, result: Result<bool>) {
        match result {
            Ok(true) => self.update_fps(),
            Ok(false) => {}
            Err(e) => log::error!("Render error: {:?}", e),
        }
    }

    // =========================================================================
    // SHADER HOT-RELOAD
    // =========================================================================

    fn poll_shader_changes(&mut self) {
        let Some(watcher) = self.shader_watcher.as_ref() else {
            return;
        };

        let changes = watcher.take_changes();
        if changes.is_empty() {
            return;
        }
        log::info!("Shader change detected: {:?}", changes);

        if let Some(renderer) = self.renderer.as_mut() {
            if let Err(e) = renderer.reload_shaders() {
                log::error!("{:#}", e);
            }
        }
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            self.needs_resize = true;
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    pub fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

/// Consume the acquire semaphore and signal the frame fence without rendering,
/// so the frame slot can be waited on and reused after a failed recording
fn release_frame(
    device: &VulkanDevice,
    sync: &FrameSync,
    wait_stages: &[vk::PipelineStageFlags],
) -> Result<()> {
    let wait_semaphores = [sync.image_available];
    let submit_info = vk::SubmitInfo::builder()
        .wait_semaphores(&wait_semaphores)
        .wait_dst_stage_mask(wait_stages);

    unsafe {
        device.device.reset_fences(&[sync.in_flight_fence])?;
        device.device.queue_submit(
            device.graphics_queue,
            &[submit_info.build()],
            sync.in_flight_fence,
        )?;
    }
    Ok(())
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(&window) {
            log::error!("Failed to initialize Vulkan: {:?}", e);
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

            WindowEvent::RedrawRequested => {
                let result = self.render_frame();
                self.frame_finished(result);
            }

            WindowEvent::KeyboardInput { event, .. } => {
                if !event.state.is_pressed() || event.repeat {
                    return;
                }
                let PhysicalKey::Code(key) = event.physical_key else {
                    return;
                };

                if key == self.bindings.quit {
                    log::info!("{:?} pressed, exiting...", key);
                    event_loop.exit();
                } else if key == self.bindings.fullscreen {
                    self.toggle_fullscreen();
                } else if key == self.bindings.capture {
                    self.capture.trigger();
                }
            }

            _ => {}
        }
    }

    /// Poll for shader changes, then request the next frame
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        self.poll_shader_changes();

        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        if let Some(device) = self.device.clone() {
            let _ = device.wait_idle();

            // Destroy in reverse order of creation
            for sync in &self.frame_sync {
                sync.destroy(&device.device);
            }
            self.frame_sync.clear();

            self.renderer = None;
            self.swapchain = None;
        }

        // Last Arc: destroys the device, surface and instance
        self.device = None;

        log::info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> App {
        let mut config = Config::default();
        config.debug.show_fps = true;
        config.debug.renderdoc = false;
        App::new(config)
    }

    #[test]
    fn render_error_keeps_frame_state() {
        let mut app = app();
        app.frame_finished(Err(anyhow::anyhow!("recording failed")));
        assert_eq!(app.frame_count, 0);
        assert_eq!(app.current_frame, 0);

        app.frame_finished(Ok(true));
        assert_eq!(app.frame_count, 1);
    }

    #[test]
    fn skipped_frame_is_not_counted() {
        let mut app = app();
        app.frame_finished(Ok(false));
        assert_eq!(app.frame_count, 0);
    }

    #[test]
    fn render_without_device_reports_error() {
        let mut app = app();
        assert!(app.render_frame().is_err());
        assert_eq!(app.current_frame, 0);
    }
}
