//! Rendering backend abstraction.
//!
//! The renderer does not depend on a graphics API. It drives two narrow
//! capabilities supplied by collaborators:
//! - [`Drawable`]: one per scene, renders (part of) the scene's elements.
//! - [`Presentable`]: one per display buffer, clears/presents/reads back pixels.
//!
//! Headless implementations are provided for the host binary and for tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::{
    ids::{BufferId, DisplayId},
    time::{FrameTimeBudget, ManualClock},
};

/// Resumption cursor into a scene's drawable elements.
///
/// Totally ordered by (pass, element). [`RenderPassIterator::START`] means either
/// "nothing rendered yet" or "fully finished"; any other value means the scene
/// still has work left and must be resumed from exactly this cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct RenderPassIterator {
    pass: u32,
    element: u32,
}

impl RenderPassIterator {
    pub const START: RenderPassIterator = RenderPassIterator { pass: 0, element: 0 };

    pub const fn new(pass: u32, element: u32) -> Self {
        RenderPassIterator { pass, element }
    }

    pub const fn pass(&self) -> u32 {
        self.pass
    }

    pub const fn element(&self) -> u32 {
        self.element
    }

    pub fn is_start(&self) -> bool {
        *self == Self::START
    }
}

/// Kind of display buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferKind {
    /// The on-screen surface. Exactly one per display.
    Primary,
    /// Offscreen target rendered to completion whenever it changes.
    Offscreen,
    /// Double-buffered offscreen target rendered under the frame time budget.
    InterruptibleOffscreen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferSize {
    pub width: u32,
    pub height: u32,
}

impl BufferSize {
    pub const fn new(width: u32, height: u32) -> Self {
        BufferSize { width, height }
    }
}

bitflags::bitflags! {
    /// Which attachments a buffer clear touches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ClearFlags: u32 {
        const NONE = 0;
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
        const ALL = Self::COLOR.bits() | Self::DEPTH.bits() | Self::STENCIL.bits();
    }
}

impl Default for ClearFlags {
    fn default() -> Self {
        Self::ALL
    }
}

/// RGBA clear color.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClearColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl ClearColor {
    pub const BLACK: ClearColor = ClearColor::rgba(0.0, 0.0, 0.0, 1.0);

    pub const fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        ClearColor { r, g, b, a }
    }
}

impl Default for ClearColor {
    fn default() -> Self {
        Self::BLACK
    }
}

/// Region for pixel read-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        PixelRect { x, y, width, height }
    }

    pub fn fits(&self, size: BufferSize) -> bool {
        self.width > 0
            && self.height > 0
            && self.x.saturating_add(self.width) <= size.width
            && self.y.saturating_add(self.height) <= size.height
    }
}

/// Everything a drawable may know about the render call it is serving.
#[derive(Debug)]
pub struct RenderContext<'a> {
    pub buffer: BufferId,
    pub kind: BufferKind,
    pub size: BufferSize,
    /// Present only for interruptible buffers.
    pub budget: Option<&'a FrameTimeBudget>,
    /// Depth/stencil content may be discarded after this scene.
    pub discard_depth_stencil: bool,
}

impl RenderContext<'_> {
    pub fn should_interrupt(&self) -> bool {
        self.budget.is_some_and(FrameTimeBudget::is_exhausted)
    }
}

/// Scene content that can be rendered into a buffer.
pub trait Drawable: Send {
    /// Renders starting at `from` and returns where to resume.
    ///
    /// Without a budget the call must finish and return [`RenderPassIterator::START`].
    /// With a budget it renders at least one element, checks
    /// [`RenderContext::should_interrupt`] between elements, and returns a
    /// non-start cursor if it stopped early.
    fn render(&mut self, from: RenderPassIterator, ctx: &RenderContext<'_>) -> RenderPassIterator;
}

/// A render target owned by the platform layer.
pub trait Presentable: Send {
    fn clear(&mut self, flags: ClearFlags, color: ClearColor);

    /// Makes the rendered content visible to consumers (swap/flip).
    fn present(&mut self);

    /// Backpressure from the presentation surface.
    fn can_accept_new_frame(&self) -> bool {
        true
    }

    fn handle_window_events(&mut self) {}

    /// Called on frames that were consumed without a redraw.
    fn notify_clients(&mut self) {}

    fn read_pixels(&mut self, rect: PixelRect) -> anyhow::Result<Vec<u8>>;
}

/// Creates surfaces for newly registered buffers.
pub trait PlatformFactory: Send {
    fn create_presentable(
        &mut self,
        display: DisplayId,
        buffer: BufferId,
        kind: BufferKind,
        size: BufferSize,
    ) -> anyhow::Result<Box<dyn Presentable>>;
}

/// Counters recorded by a [`HeadlessSurface`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SurfaceStats {
    pub clears: u32,
    pub last_clear: Option<(ClearFlags, ClearColor)>,
    pub presents: u32,
    pub notifications: u32,
    pub window_event_polls: u32,
    pub pixel_reads: Vec<PixelRect>,
}

/// Shared view into a headless surface.
#[derive(Debug, Clone)]
pub struct SurfaceProbe {
    stats: Arc<Mutex<SurfaceStats>>,
    accepting: Arc<AtomicBool>,
}

impl Default for SurfaceProbe {
    fn default() -> Self {
        SurfaceProbe {
            stats: Arc::default(),
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl SurfaceProbe {
    pub fn stats(&self) -> SurfaceStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    fn update(&self, f: impl FnOnce(&mut SurfaceStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

/// Surface that renders nowhere but records what was asked of it.
#[derive(Debug)]
pub struct HeadlessSurface {
    size: BufferSize,
    probe: SurfaceProbe,
}

impl HeadlessSurface {
    pub fn new(size: BufferSize) -> Self {
        HeadlessSurface {
            size,
            probe: SurfaceProbe::default(),
        }
    }

    pub fn probe(&self) -> SurfaceProbe {
        self.probe.clone()
    }
}

impl Presentable for HeadlessSurface {
    fn clear(&mut self, flags: ClearFlags, color: ClearColor) {
        self.probe.update(|s| {
            s.clears += 1;
            s.last_clear = Some((flags, color));
        });
    }

    fn present(&mut self) {
        self.probe.update(|s| s.presents += 1);
    }

    fn can_accept_new_frame(&self) -> bool {
        self.probe.accepting.load(Ordering::SeqCst)
    }

    fn handle_window_events(&mut self) {
        self.probe.update(|s| s.window_event_polls += 1);
    }

    fn notify_clients(&mut self) {
        self.probe.update(|s| s.notifications += 1);
    }

    fn read_pixels(&mut self, rect: PixelRect) -> anyhow::Result<Vec<u8>> {
        if !rect.fits(self.size) {
            bail!("read rect {:?} outside of {}x{} surface", rect, self.size.width, self.size.height);
        }
        self.probe.update(|s| s.pixel_reads.push(rect));
        Ok(vec![0; rect.width as usize * rect.height as usize * 4])
    }
}

/// Factory handing out [`HeadlessSurface`]s and keeping their probes.
#[derive(Debug, Clone, Default)]
pub struct HeadlessPlatform {
    probes: Arc<Mutex<HashMap<BufferId, SurfaceProbe>>>,
    refuse_creation: Arc<AtomicBool>,
}

impl HeadlessPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe(&self, buffer: BufferId) -> Option<SurfaceProbe> {
        self.probes.lock().ok()?.get(&buffer).cloned()
    }

    /// Makes subsequent surface creation fail, emulating device loss.
    pub fn set_refuse_creation(&self, refuse: bool) {
        self.refuse_creation.store(refuse, Ordering::SeqCst);
    }
}

impl PlatformFactory for HeadlessPlatform {
    fn create_presentable(
        &mut self,
        display: DisplayId,
        buffer: BufferId,
        kind: BufferKind,
        size: BufferSize,
    ) -> anyhow::Result<Box<dyn Presentable>> {
        if self.refuse_creation.load(Ordering::SeqCst) {
            bail!("headless platform refused {:?} buffer {} on display {}", kind, buffer, display);
        }
        let surface = HeadlessSurface::new(size);
        if let Ok(mut probes) = self.probes.lock() {
            probes.insert(buffer, surface.probe());
        }
        Ok(Box::new(surface))
    }
}

/// One call observed by a [`SyntheticDrawable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderCall {
    pub buffer: BufferId,
    pub from: RenderPassIterator,
    pub returned: RenderPassIterator,
    pub interruptible: bool,
    pub discard_depth_stencil: bool,
}

/// Shared view into a [`SyntheticDrawable`].
#[derive(Debug, Clone, Default)]
pub struct DrawProbe {
    elements_drawn: Arc<AtomicU64>,
    calls: Arc<Mutex<Vec<RenderCall>>>,
}

impl DrawProbe {
    pub fn elements_drawn(&self) -> u64 {
        self.elements_drawn.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<RenderCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of calls that ran the scene to its end.
    pub fn completed_passes(&self) -> usize {
        self.calls().iter().filter(|c| c.returned.is_start()).count()
    }
}

/// Drawable made of `elements` uniform elements.
///
/// When built with [`SyntheticDrawable::with_element_cost`], each element
/// advances a [`ManualClock`], which makes budget exhaustion deterministic.
#[derive(Debug)]
pub struct SyntheticDrawable {
    elements: u32,
    cost: Option<(Arc<ManualClock>, Duration)>,
    probe: DrawProbe,
}

impl SyntheticDrawable {
    pub fn new(elements: u32) -> Self {
        SyntheticDrawable {
            elements,
            cost: None,
            probe: DrawProbe::default(),
        }
    }

    pub fn with_element_cost(mut self, clock: Arc<ManualClock>, cost: Duration) -> Self {
        self.cost = Some((clock, cost));
        self
    }

    pub fn probe(&self) -> DrawProbe {
        self.probe.clone()
    }
}

impl Drawable for SyntheticDrawable {
    fn render(&mut self, from: RenderPassIterator, ctx: &RenderContext<'_>) -> RenderPassIterator {
        let mut element = from.element();
        let returned = loop {
            if element >= self.elements {
                break RenderPassIterator::START;
            }
            self.probe.elements_drawn.fetch_add(1, Ordering::SeqCst);
            if let Some((clock, cost)) = &self.cost {
                clock.advance(*cost);
            }
            element += 1;
            if element >= self.elements {
                break RenderPassIterator::START;
            }
            if ctx.should_interrupt() {
                break RenderPassIterator::new(0, element);
            }
        };
        if let Ok(mut calls) = self.probe.calls.lock() {
            calls.push(RenderCall {
                buffer: ctx.buffer,
                from,
                returned,
                interruptible: ctx.budget.is_some(),
                discard_depth_stencil: ctx.discard_depth_stencil,
            });
        }
        returned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(budget: Option<&FrameTimeBudget>) -> RenderContext<'_> {
        RenderContext {
            buffer: BufferId(1),
            kind: BufferKind::InterruptibleOffscreen,
            size: BufferSize::new(4, 4),
            budget,
            discard_depth_stencil: false,
        }
    }

    #[test]
    fn cursor_order_is_pass_then_element() {
        assert!(RenderPassIterator::new(0, 5) < RenderPassIterator::new(1, 0));
        assert!(RenderPassIterator::START < RenderPassIterator::new(0, 1));
        assert!(RenderPassIterator::default().is_start());
    }

    #[test]
    fn synthetic_drawable_finishes_without_budget() {
        let mut drawable = SyntheticDrawable::new(5);
        let probe = drawable.probe();
        let out = drawable.render(RenderPassIterator::START, &context(None));
        assert!(out.is_start());
        assert_eq!(probe.elements_drawn(), 5);
        assert_eq!(probe.completed_passes(), 1);
    }

    #[test]
    fn synthetic_drawable_resumes_where_it_stopped() {
        let clock = ManualClock::shared();
        let mut drawable = SyntheticDrawable::new(5).with_element_cost(clock.clone(), Duration::from_millis(1));
        let probe = drawable.probe();

        let budget = FrameTimeBudget::start(clock.clone(), Duration::from_millis(2));
        let cursor = drawable.render(RenderPassIterator::START, &context(Some(&budget)));
        assert_eq!(cursor, RenderPassIterator::new(0, 2));

        let budget = FrameTimeBudget::start(clock.clone(), Duration::from_millis(2));
        let cursor = drawable.render(cursor, &context(Some(&budget)));
        assert_eq!(cursor, RenderPassIterator::new(0, 4));

        let budget = FrameTimeBudget::start(clock, Duration::from_millis(2));
        let cursor = drawable.render(cursor, &context(Some(&budget)));
        assert!(cursor.is_start());
        assert_eq!(probe.elements_drawn(), 5);
    }

    #[test]
    fn exhausted_budget_still_draws_one_element() {
        let clock = ManualClock::shared();
        let mut drawable = SyntheticDrawable::new(3);
        let budget = FrameTimeBudget::start(clock, Duration::ZERO);
        assert_eq!(drawable.render(RenderPassIterator::START, &context(Some(&budget))), RenderPassIterator::new(0, 1));
    }

    #[test]
    fn headless_surface_rejects_out_of_bounds_reads() {
        let mut surface = HeadlessSurface::new(BufferSize::new(4, 4));
        assert_eq!(surface.read_pixels(PixelRect::new(0, 0, 2, 2)).unwrap().len(), 16);
        assert!(surface.read_pixels(PixelRect::new(3, 3, 2, 2)).is_err());
        assert!(surface.read_pixels(PixelRect::new(0, 0, 0, 1)).is_err());
        assert_eq!(surface.probe().stats().pixel_reads.len(), 1);
    }

    #[test]
    fn headless_platform_tracks_probes() {
        let mut platform = HeadlessPlatform::new();
        let mut surface = platform
            .create_presentable(DisplayId(0), BufferId(7), BufferKind::Primary, BufferSize::new(8, 8))
            .unwrap();
        surface.present();
        assert_eq!(platform.probe(BufferId(7)).unwrap().stats().presents, 1);

        platform.set_refuse_creation(true);
        assert!(platform
            .create_presentable(DisplayId(0), BufferId(8), BufferKind::Offscreen, BufferSize::new(8, 8))
            .is_err());
    }
}
