//! `renderer_host`
//!
//! Host process around the renderer core:
//! - Fixed-rate tick loop
//! - Bounded command queue for content sources and scene-control clients
//! - Optional auto-show of every published scene
//! - Simulated content source for headless runs

pub mod host;

pub use host::{ContentSource, HostCommand, HostState, HostStatus, RendererHost, CONSOLE_HELP};
