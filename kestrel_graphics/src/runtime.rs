use anyhow::Result;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::Context;

/// Window-system services the core consumes. Implemented by the host
/// application; the engine never talks to the platform directly.
pub trait Runtime {
    fn display_handle(&self) -> RawDisplayHandle;
    fn window_handle(&self) -> RawWindowHandle;

    /// Current drawable surface size in pixels.
    fn surface_extent(&self) -> vk::Extent2D;

    /// UI scale of the surface's output.
    fn scale_factor(&self) -> f64;

    fn is_focused(&self) -> bool;

    /// Pumps platform events. Call once per frame before `frame_begin`.
    fn process_events(&mut self);

    fn requested_close(&self) -> bool;
}

impl Context {
    pub fn from_runtime(runtime: &dyn Runtime) -> Result<Self> {
        Self::new(runtime.display_handle(), runtime.window_handle())
    }
}
