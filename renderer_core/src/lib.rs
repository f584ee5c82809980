//! `renderer_core`
//!
//! Scene renderer core: the per-display frame loop and everything it depends on.
//!
//! Design goals:
//! - Deterministic and tick-driven; no internal threads.
//! - Records addressed by stable ids, never pointers.
//! - Narrow capability traits (`Drawable`, `Presentable`) instead of a graphics API.
//! - No `unsafe`.

pub mod backend;
pub mod config;
pub mod event;
pub mod ids;
pub mod lifecycle;
pub mod registry;
pub mod renderer;
pub mod scheduler;
pub mod sla;
pub mod time;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::backend::*;
    pub use crate::config::*;
    pub use crate::event::*;
    pub use crate::ids::*;
    pub use crate::lifecycle::{SceneLifecycle, SceneState, SceneTransition, TransitionError};
    pub use crate::registry::{ContentRegistry, RegistryError};
    pub use crate::renderer::Renderer;
    pub use crate::scheduler::TickReport;
    pub use crate::sla::{ExpirationMonitor, LatencyMonitor};
    pub use crate::time::*;
}
