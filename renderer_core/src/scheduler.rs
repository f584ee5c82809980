//! Frame scheduler.
//!
//! One call to [`FrameScheduler::run_one_tick`] renders every display once:
//!
//! 1. Displays whose surface refuses a new frame only poll window events.
//! 2. Normal offscreen buffers that changed are cleared and rendered to
//!    completion; their consumers are marked changed for the same tick.
//! 3. Interruptible offscreen buffers render under the frame time budget. An
//!    interrupted scene stores its cursor and processing stops; a completed pass
//!    is presented and its consumers are marked changed for the *next* tick.
//! 4. The primary buffer renders to completion and presents when it changed,
//!    otherwise it only notifies clients.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, info, trace, warn};

use crate::{
    backend::{BufferKind, ClearFlags, PixelRect, RenderContext, RenderPassIterator},
    config::{BudgetScope, RendererConfig},
    event::{EventCollector, RendererEvent},
    ids::{BufferId, DisplayId, SceneId},
    registry::ContentRegistry,
    time::{Clock, FrameTimeBudget},
};

/// What happened during one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Displays whose surface could not accept a frame.
    pub skipped_displays: Vec<DisplayId>,
    /// Scenes whose render finished this tick, in render order.
    pub rendered_scenes: Vec<SceneId>,
    /// Buffers cleared and rendered this tick (including partial passes).
    pub changed_buffers: Vec<BufferId>,
    /// Buffers flipped this tick.
    pub presented_buffers: Vec<BufferId>,
    /// Primary buffers that only notified their clients.
    pub notified_buffers: Vec<BufferId>,
    /// An interruptible pass ran out of budget.
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScreenshotRequest {
    buffer: BufferId,
    rect: PixelRect,
}

#[derive(Debug, Default)]
struct LoopTimes {
    samples: u32,
    max: Duration,
    total: Duration,
}

pub struct FrameScheduler {
    clock: Arc<dyn Clock>,
    budget_allowance: Duration,
    budget_scope: BudgetScope,
    skip_unmodified_buffers: bool,
    loop_time_report_period: u32,
    /// Consumers of buffers presented last tick.
    deferred_marks: Vec<BufferId>,
    screenshots: Vec<ScreenshotRequest>,
    processed_screenshots: Vec<RendererEvent>,
    loop_times: LoopTimes,
}

impl FrameScheduler {
    pub fn new(config: &RendererConfig, clock: Arc<dyn Clock>) -> Self {
        FrameScheduler {
            clock,
            budget_allowance: config.frame_budget(),
            budget_scope: config.budget_scope,
            skip_unmodified_buffers: config.skip_unmodified_buffers,
            loop_time_report_period: config.loop_time_report_period,
            deferred_marks: Vec::new(),
            screenshots: Vec::new(),
            processed_screenshots: Vec::new(),
            loop_times: LoopTimes::default(),
        }
    }

    pub fn budget_scope(&self) -> BudgetScope {
        self.budget_scope
    }

    /// Buffers that will be marked changed at the start of the next tick.
    pub fn deferred_marks(&self) -> &[BufferId] {
        &self.deferred_marks
    }

    pub fn run_one_tick(&mut self, registry: &mut ContentRegistry, events: &mut EventCollector) -> TickReport {
        let started = self.clock.now();
        let mut report = TickReport::default();

        if !self.skip_unmodified_buffers {
            for buffer in registry.buffers.values_mut() {
                buffer.needs_rerender = true;
            }
        }
        for buffer in std::mem::take(&mut self.deferred_marks) {
            registry.mark_buffer_for_rerender(buffer);
        }

        let global_budget = FrameTimeBudget::start(self.clock.clone(), self.budget_allowance);

        for display in registry.display_ids() {
            let Some(primary) = registry.display(display).and_then(|d| d.primary) else {
                continue;
            };
            if !self.accepts_frame(registry, display, primary) {
                report.skipped_displays.push(display);
                continue;
            }

            self.render_offscreen_buffers(registry, display, &mut report);

            let budget = match self.budget_scope {
                BudgetScope::Global => global_budget.clone(),
                BudgetScope::PerDisplay => FrameTimeBudget::start(self.clock.clone(), self.budget_allowance),
            };
            let waiting_on = self.interrupted_elsewhere(registry, display);
            if let Some(other) = waiting_on {
                trace!(display = %other, "interruptible rendering waits for an interrupted pass");
            } else if self.render_interruptible_buffers(registry, display, &budget, &mut report) {
                report.interrupted = true;
            }

            self.render_primary(registry, primary, &mut report);
        }

        self.record_loop_time(started, events);
        trace!(?report, "tick finished");
        report
    }

    fn accepts_frame(&mut self, registry: &mut ContentRegistry, display_id: DisplayId, primary: BufferId) -> bool {
        let Some(buffer) = registry.buffers.get_mut(&primary) else {
            return false;
        };
        let accepting = buffer.surface.can_accept_new_frame();
        if !accepting {
            buffer.surface.handle_window_events();
        }
        if let Some(record) = registry.display_mut(display_id) {
            if record.could_render_last_frame != accepting {
                if accepting {
                    info!(display = %display_id, "display accepts frames again");
                } else {
                    info!(display = %display_id, "display cannot accept a new frame, skipping");
                }
                record.could_render_last_frame = accepting;
            }
        }
        accepting
    }

    /// With a global budget only one interruptible pass may be open at a time;
    /// returns the display holding it when that is not `display`.
    fn interrupted_elsewhere(&self, registry: &ContentRegistry, display: DisplayId) -> Option<DisplayId> {
        if self.budget_scope != BudgetScope::Global {
            return None;
        }
        registry
            .buffers
            .values()
            .find(|b| b.mid_pass && b.display != display)
            .map(|b| b.display)
    }

    fn buffers_of_kind(registry: &ContentRegistry, display: DisplayId, kind: BufferKind) -> Vec<BufferId> {
        registry
            .display(display)
            .map(|d| {
                d.buffers
                    .iter()
                    .copied()
                    .filter(|b| registry.buffer(*b).is_some_and(|r| r.kind == kind))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn render_offscreen_buffers(&mut self, registry: &mut ContentRegistry, display: DisplayId, report: &mut TickReport) {
        for buffer in Self::buffers_of_kind(registry, display, BufferKind::Offscreen) {
            if !registry.buffer_has_changes(buffer) {
                continue;
            }
            render_to_completion(registry, buffer, report);
            for consumer in registry.consumers_of(buffer) {
                registry.mark_buffer_for_rerender(consumer);
            }
            self.process_screenshots(registry, buffer);
        }
    }

    /// Returns whether a pass was interrupted.
    fn render_interruptible_buffers(
        &mut self,
        registry: &mut ContentRegistry,
        display: DisplayId,
        budget: &FrameTimeBudget,
        report: &mut TickReport,
    ) -> bool {
        let mut order = Self::buffers_of_kind(registry, display, BufferKind::InterruptibleOffscreen);
        if let Some(pos) = order.iter().position(|b| registry.buffer(*b).is_some_and(|r| r.mid_pass)) {
            let resumed = order.remove(pos);
            order.insert(0, resumed);
        }

        for buffer in order {
            let Some(mid_pass) = registry.buffer(buffer).map(|b| b.mid_pass) else {
                continue;
            };
            if !mid_pass && !registry.buffer_has_changes(buffer) {
                continue;
            }
            if budget.is_exhausted() {
                trace!(buffer = %buffer, "frame budget exhausted, buffer skipped");
                return true;
            }
            if !mid_pass {
                start_pass(registry, buffer);
            }
            report.changed_buffers.push(buffer);

            if let Some((scene, cursor)) = render_interruptible_pass(registry, buffer, budget, report) {
                debug!(buffer = %buffer, scene = %scene, ?cursor, "interruptible pass suspended");
                return true;
            }

            let Some(record) = registry.buffers.get_mut(&buffer) else {
                continue;
            };
            record.surface.present();
            record.mid_pass = false;
            record.unpresented_content = false;
            record.resume_cursor = None;
            report.presented_buffers.push(buffer);
            debug!(buffer = %buffer, "interruptible pass presented");

            self.deferred_marks.extend(registry.consumers_of(buffer));
            self.process_screenshots(registry, buffer);
        }
        false
    }

    fn render_primary(&mut self, registry: &mut ContentRegistry, primary: BufferId, report: &mut TickReport) {
        if registry.buffer_has_changes(primary) {
            render_to_completion(registry, primary, report);
            if let Some(record) = registry.buffers.get_mut(&primary) {
                record.surface.present();
                record.unpresented_content = false;
            }
            report.presented_buffers.push(primary);
            self.process_screenshots(registry, primary);
        } else if let Some(record) = registry.buffers.get_mut(&primary) {
            record.surface.notify_clients();
            report.notified_buffers.push(primary);
        }
    }

    // ─── Screenshots ───

    /// Queues a pixel read after the buffer's next completed render.
    pub fn schedule_screenshot(&mut self, registry: &mut ContentRegistry, buffer: BufferId, rect: PixelRect) {
        if !registry.has_buffer(buffer) {
            warn!(buffer = %buffer, "screenshot requested for unknown buffer");
            self.processed_screenshots.push(RendererEvent::ReadPixelsFailed { buffer, rect });
            return;
        }
        registry.mark_buffer_for_rerender(buffer);
        self.screenshots.push(ScreenshotRequest { buffer, rect });
    }

    /// Fails screenshots of a buffer that is going away.
    pub fn cancel_screenshots(&mut self, buffer: BufferId) {
        let (cancelled, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.screenshots)
            .into_iter()
            .partition(|r| r.buffer == buffer);
        self.screenshots = kept;
        for request in cancelled {
            self.processed_screenshots
                .push(RendererEvent::ReadPixelsFailed { buffer, rect: request.rect });
        }
    }

    pub fn pending_screenshots(&self) -> usize {
        self.screenshots.len()
    }

    pub fn dispatch_processed_screenshots(&mut self, events: &mut EventCollector) {
        for event in std::mem::take(&mut self.processed_screenshots) {
            events.push(event);
        }
    }

    fn process_screenshots(&mut self, registry: &mut ContentRegistry, buffer: BufferId) {
        if !self.screenshots.iter().any(|r| r.buffer == buffer) {
            return;
        }
        let (due, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.screenshots)
            .into_iter()
            .partition(|r| r.buffer == buffer);
        self.screenshots = kept;
        let Some(record) = registry.buffers.get_mut(&buffer) else {
            return;
        };
        for request in due {
            let event = match record.surface.read_pixels(request.rect) {
                Ok(pixels) => RendererEvent::ReadPixels {
                    buffer,
                    rect: request.rect,
                    pixels,
                },
                Err(err) => {
                    warn!(buffer = %buffer, rect = ?request.rect, error = %err, "pixel read failed");
                    RendererEvent::ReadPixelsFailed {
                        buffer,
                        rect: request.rect,
                    }
                }
            };
            self.processed_screenshots.push(event);
        }
    }

    // ─── Rerender control ───

    pub fn mark_buffer_with_scene_for_rerender(&mut self, registry: &mut ContentRegistry, scene: SceneId) {
        if let Some(buffer) = registry.buffer_of_scene(scene) {
            registry.mark_buffer_for_rerender(buffer);
        }
    }

    /// Drops every stored cursor; interrupted passes restart from a clear.
    pub fn reset_render_interrupt_state(&mut self, registry: &mut ContentRegistry) {
        if registry.has_interrupted_rendering() {
            debug!("interrupted rendering reset");
        }
        registry.reset_interrupt_state();
    }

    fn record_loop_time(&mut self, started: Instant, events: &mut EventCollector) {
        if self.loop_time_report_period == 0 {
            return;
        }
        let elapsed = self.clock.now().saturating_duration_since(started);
        let stats = &mut self.loop_times;
        stats.samples += 1;
        stats.max = stats.max.max(elapsed);
        stats.total += elapsed;
        if stats.samples >= self.loop_time_report_period {
            let report = RendererEvent::PeriodicLoopTimes {
                max: stats.max,
                avg: stats.total / stats.samples,
            };
            self.loop_times = LoopTimes::default();
            events.push(report);
        }
    }
}

/// Clears a buffer and renders all of its shown scenes to completion.
fn render_to_completion(registry: &mut ContentRegistry, buffer: BufferId, report: &mut TickReport) {
    let scenes = registry.shown_scenes(buffer);
    let Some(record) = registry.buffers.get_mut(&buffer) else {
        return;
    };
    let flags = record.clear_flags;
    record.surface.clear(flags, record.clear_color);
    record.unpresented_content = true;
    registry.clear_change_flags(buffer);

    let may_discard = flags.contains(ClearFlags::DEPTH | ClearFlags::STENCIL);
    for (i, scene) in scenes.iter().enumerate() {
        let discard = may_discard && i + 1 == scenes.len();
        let cursor = render_scene(registry, *scene, buffer, RenderPassIterator::START, None, discard);
        if !cursor.is_start() {
            warn!(scene = %scene, buffer = %buffer, ?cursor, "scene did not finish without a budget");
        }
        report.rendered_scenes.push(*scene);
    }
    report.changed_buffers.push(buffer);
    trace!(buffer = %buffer, scenes = scenes.len(), "buffer rendered");
}

fn start_pass(registry: &mut ContentRegistry, buffer: BufferId) {
    let Some(record) = registry.buffers.get_mut(&buffer) else {
        return;
    };
    record.surface.clear(record.clear_flags, record.clear_color);
    record.mid_pass = true;
    record.unpresented_content = true;
    record.resume_cursor = None;
    registry.clear_change_flags(buffer);
    trace!(buffer = %buffer, "interruptible pass started");
}

/// Continues the pass of an interruptible buffer.
///
/// Returns the interrupted scene and its cursor, or `None` when every scene finished.
fn render_interruptible_pass(
    registry: &mut ContentRegistry,
    buffer: BufferId,
    budget: &FrameTimeBudget,
    report: &mut TickReport,
) -> Option<(SceneId, RenderPassIterator)> {
    let scenes = registry.shown_scenes(buffer);
    let resume_at = registry.buffer(buffer).and_then(|b| b.resume_cursor);

    let mut skipping = resume_at.is_some();
    for scene in scenes {
        let from = match resume_at {
            Some((resumed, cursor)) if resumed == scene => {
                skipping = false;
                cursor
            }
            _ if skipping => continue,
            _ => RenderPassIterator::START,
        };

        let cursor = render_scene(registry, scene, buffer, from, Some(budget), false);
        let record = registry.buffers.get_mut(&buffer)?;
        if cursor.is_start() {
            record.resume_cursor = None;
            report.rendered_scenes.push(scene);
        } else {
            record.resume_cursor = Some((scene, cursor));
            return Some((scene, cursor));
        }
    }
    None
}

fn render_scene(
    registry: &mut ContentRegistry,
    scene: SceneId,
    buffer: BufferId,
    from: RenderPassIterator,
    budget: Option<&FrameTimeBudget>,
    discard_depth_stencil: bool,
) -> RenderPassIterator {
    let Some((kind, size)) = registry.buffer(buffer).map(|b| (b.kind, b.size)) else {
        return RenderPassIterator::START;
    };
    let Some(drawable) = registry.scenes.get_mut(&scene).and_then(|s| s.drawable.as_mut()) else {
        debug!(scene = %scene, buffer = %buffer, "shown scene has nothing to draw");
        return RenderPassIterator::START;
    };
    let ctx = RenderContext {
        buffer,
        kind,
        size,
        budget,
        discard_depth_stencil,
    };
    drawable.render(from, &ctx)
}
