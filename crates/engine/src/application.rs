//! The application trait and the frame loop.

use tracing::warn;

use forge_gfx::GfxError;

use crate::clock::FrameClock;
use crate::Services;

/// Callbacks a Forge application implements.
///
/// `on_update` runs at the fixed timestep; `on_render` runs once per loop
/// iteration with the interpolation factor `alpha = lag / delta`.
pub trait Application {
    /// Whether the loop should exit. Defaults to the window's close flag.
    fn should_close(&mut self, services: &Services) -> bool {
        services.platform.window().should_close()
    }

    fn on_init(&mut self, _services: &mut Services) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_terminate(&mut self, _services: &mut Services) {}

    fn on_update(&mut self, _services: &mut Services, _delta: f64) {}

    /// Builds and executes the frame's render graph.
    fn on_render(&mut self, services: &mut Services, alpha: f64) -> anyhow::Result<()>;
}

/// Runs the fixed-timestep loop until the application asks to close.
///
/// ```text
/// while !should_close:
///   clock.advance()
///   poll_events
///   while clock.step(): on_update(delta)
///   on_render(clock.alpha())
///   context.next_frame()
/// ```
pub fn run<A: Application + ?Sized>(
    app: &mut A,
    services: &mut Services,
    update_hz: u32,
) -> anyhow::Result<()> {
    app.on_init(services)?;

    let mut clock = FrameClock::new(update_hz);

    while !app.should_close(services) {
        clock.advance();
        services.platform.poll_events();

        while clock.step() {
            app.on_update(services, clock.delta());
        }

        app.on_render(services, clock.alpha())?;
        services.context.next_frame();
    }

    app.on_terminate(services);
    Ok(())
}

/// What [`render_frame`] did this iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was recorded, submitted, and presented.
    Rendered,
    /// The swapchain was stale; it was recreated and the frame skipped.
    SkippedStale,
}

/// Performs one acquire → reset → record → submit → present cycle.
///
/// A stale swapchain at acquire time triggers recovery (device wait-idle,
/// recreation at the current framebuffer size, `resize_hook`) and skips the
/// frame. A stale result from present triggers the same recovery after the
/// frame was already rendered.
pub fn render_frame(
    services: &mut Services,
    mut resize_hook: impl FnMut(&mut Services) -> anyhow::Result<()>,
    mut record: impl FnMut(&mut Services) -> anyhow::Result<()>,
) -> anyhow::Result<FrameOutcome> {
    let image_available = services.context.current_frame_ref().image_available();
    match services.context.swapchain_mut().acquire_image(image_available) {
        Err(GfxError::SwapchainStale) => {
            recover(services, &mut resize_hook)?;
            return Ok(FrameOutcome::SkippedStale);
        }
        result => result?,
    }

    services.context.current_frame_mut().reset()?;
    record(services)?;
    services.context.current_frame_ref().submit()?;

    let render_finished = services.context.current_frame_ref().render_finished();
    match services.context.swapchain_mut().present_image(render_finished) {
        Err(GfxError::SwapchainStale) => {
            recover(services, &mut resize_hook)?;
            Ok(FrameOutcome::Rendered)
        }
        result => {
            result?;
            Ok(FrameOutcome::Rendered)
        }
    }
}

fn recover(
    services: &mut Services,
    resize_hook: &mut impl FnMut(&mut Services) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let extent = services.platform.window().framebuffer_size();
    warn!(target: "gfx::swapchain", "Swapchain stale, recreating at {}x{}", extent.0, extent.1);
    services.context.recreate_swapchain(extent)?;
    resize_hook(services)
}
