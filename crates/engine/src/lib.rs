//! Engine assembly: services, application trait, and the frame loop.
//!
//! The engine wires the platform (window + input) and the graphics context
//! into a [`Services`] struct that is passed explicitly to the application
//! — no global service locator. [`run`] drives the fixed-timestep update /
//! variable-rate render loop; [`render_frame`] performs one acquire →
//! record → submit → present cycle with stale-swapchain recovery.

mod application;
mod clock;

use anyhow::Context as _;
use tracing::info;

use forge_gfx::context::DeviceContext;
use forge_platform::Platform;

pub use application::{render_frame, run, Application, FrameOutcome};
pub use clock::FrameClock;

/// Semantic engine/application version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

/// Everything the application needs, constructed once and passed by
/// reference.
pub struct Services {
    pub platform: Platform,
    pub context: DeviceContext,
}

/// Engine entry points.
pub struct Engine;

impl Engine {
    /// Initializes the platform and the graphics context.
    pub fn init(title: &str, width: u32, height: u32) -> anyhow::Result<Services> {
        info!("Engine initialization started");

        let platform =
            Platform::new(title, width, height).context("Failed to initialize platform")?;
        info!("Window and input initialized");

        let context = DeviceContext::new(platform.window())
            .context("Failed to initialize graphics context")?;

        info!("Engine initialized successfully");
        Ok(Services { platform, context })
    }

    /// Tears the engine down: waits for the GPU, persists the pipeline
    /// cache, and drops every service in reverse construction order.
    pub fn terminate(services: Services) -> anyhow::Result<()> {
        info!("Engine termination started");
        services.context.wait_idle()?;
        services.context.save_pipeline_cache()?;
        drop(services);
        info!("Engine terminated successfully");
        Ok(())
    }
}
