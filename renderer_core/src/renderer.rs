//! Renderer facade.
//!
//! Owns every renderer component and keeps them consistent: lifecycle
//! transitions update the registry and the SLA monitors, content flushes are
//! applied at the start of a tick, and the scheduler's results feed back into
//! the lifecycle (show completion) and the monitors (render timestamps).

use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::{
    backend::{BufferKind, BufferSize, ClearColor, ClearFlags, Drawable, HeadlessPlatform, PixelRect, PlatformFactory},
    config::RendererConfig,
    event::{ChannelEvent, EventCollector, LifecycleSignal, RendererEvent, SceneEvent, SceneEventKind},
    ids::{BufferId, DisplayId, SceneId, VersionTag},
    lifecycle::{SceneLifecycle, SceneState, SceneTransition, TransitionError, TransitionOutcome},
    registry::{ContentRegistry, PendingFlush, RegistryError},
    scheduler::{FrameScheduler, TickReport},
    sla::{ExpirationMonitor, LatencyMonitor},
    time::{Clock, FlushTime, FlushTimeInfo, SystemClock},
};

pub struct Renderer {
    config: RendererConfig,
    platform: Box<dyn PlatformFactory>,
    registry: ContentRegistry,
    lifecycle: SceneLifecycle,
    expiration: ExpirationMonitor,
    latency: LatencyMonitor,
    scheduler: FrameScheduler,
    events: EventCollector,
    next_display: u32,
    ticks: u64,
}

impl Renderer {
    pub fn new(config: RendererConfig, platform: Box<dyn PlatformFactory>, clock: Arc<dyn Clock>) -> Self {
        let scheduler = FrameScheduler::new(&config, clock);
        Renderer {
            config,
            platform,
            registry: ContentRegistry::new(),
            lifecycle: SceneLifecycle::new(),
            expiration: ExpirationMonitor::new(),
            latency: LatencyMonitor::new(),
            scheduler,
            events: EventCollector::new(),
            next_display: 0,
            ticks: 0,
        }
    }

    /// Renderer on headless surfaces; the returned platform exposes their probes.
    pub fn headless(config: RendererConfig, clock: Arc<dyn Clock>) -> (Self, HeadlessPlatform) {
        let platform = HeadlessPlatform::new();
        (Self::new(config, Box::new(platform.clone()), clock), platform)
    }

    /// Headless renderer paced by the system clock.
    pub fn with_system_clock(config: RendererConfig) -> (Self, HeadlessPlatform) {
        Self::headless(config, Arc::new(SystemClock))
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn registry(&self) -> &ContentRegistry {
        &self.registry
    }

    pub fn lifecycle(&self) -> &SceneLifecycle {
        &self.lifecycle
    }

    pub fn scene_state(&self, scene: SceneId) -> SceneState {
        self.lifecycle.state(scene)
    }

    pub fn expiration_monitor(&self) -> &ExpirationMonitor {
        &self.expiration
    }

    pub fn latency_monitor(&self) -> &LatencyMonitor {
        &self.latency
    }

    pub fn scheduler(&self) -> &FrameScheduler {
        &self.scheduler
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    // ─── Displays and buffers ───

    /// Creates a display together with its primary buffer.
    pub fn create_display(&mut self, size: BufferSize) -> anyhow::Result<DisplayId> {
        let display_id = DisplayId(self.next_display);
        self.next_display += 1;

        let primary = self.registry.reserve_buffer_id();
        let surface = match self
            .platform
            .create_presentable(display_id, primary, BufferKind::Primary, size)
            .with_context(|| format!("creating primary surface of display {display_id}"))
        {
            Ok(surface) => surface,
            Err(err) => {
                warn!(display = %display_id, error = %err, "display creation failed");
                self.events.push(RendererEvent::DisplayCreateFailed);
                return Err(err);
            }
        };

        self.registry.add_display(display_id)?;
        self.registry.insert_buffer(
            primary,
            display_id,
            BufferKind::Primary,
            size,
            self.config.default_clear_color,
            surface,
        )?;
        info!(display = %display_id, primary = %primary, width = size.width, height = size.height, "display created");
        self.events.push(RendererEvent::DisplayCreated(display_id));
        Ok(display_id)
    }

    /// Destroys a display; refused while scenes use it or a pass is interrupted.
    pub fn destroy_display(&mut self, display_id: DisplayId) -> Result<(), RegistryError> {
        let interrupted = self.registry.display(display_id).is_some_and(|d| {
            d.buffers
                .iter()
                .any(|b| self.registry.buffer(*b).is_some_and(|r| r.mid_pass))
        });
        let result = if interrupted {
            Err(RegistryError::DisplayInUse(display_id))
        } else {
            self.registry.remove_display(display_id)
        };
        match result {
            Ok(buffers) => {
                for buffer in buffers {
                    self.scheduler.cancel_screenshots(buffer);
                }
                info!(display = %display_id, "display destroyed");
                self.events.push(RendererEvent::DisplayDestroyed(display_id));
                Ok(())
            }
            Err(err) => {
                warn!(display = %display_id, error = %err, "display destruction refused");
                self.events.push(RendererEvent::DisplayDestroyFailed(display_id));
                Err(err)
            }
        }
    }

    /// Registers an offscreen buffer on an existing display.
    pub fn register_buffer(&mut self, display_id: DisplayId, kind: BufferKind, size: BufferSize) -> anyhow::Result<BufferId> {
        let created = self
            .registry
            .check_buffer_registration(display_id, kind)
            .map_err(anyhow::Error::from)
            .and_then(|()| {
                let buffer = self.registry.reserve_buffer_id();
                let surface = self.platform.create_presentable(display_id, buffer, kind, size)?;
                self.registry.insert_buffer(
                    buffer,
                    display_id,
                    kind,
                    size,
                    self.config.default_clear_color,
                    surface,
                )?;
                Ok(buffer)
            })
            .with_context(|| format!("registering {kind:?} buffer on display {display_id}"));

        match created {
            Ok(buffer) => {
                info!(display = %display_id, buffer = %buffer, ?kind, "offscreen buffer created");
                self.events.push(RendererEvent::OffscreenBufferCreated { display: display_id, buffer });
                Ok(buffer)
            }
            Err(err) => {
                warn!(display = %display_id, error = %err, "offscreen buffer creation failed");
                self.events.push(RendererEvent::OffscreenBufferCreateFailed { display: display_id });
                Err(err)
            }
        }
    }

    /// Destroys an offscreen buffer; refused while scenes are assigned to it.
    pub fn destroy_buffer(&mut self, buffer: BufferId) -> Result<(), RegistryError> {
        match self.registry.remove_buffer(buffer) {
            Ok(()) => {
                self.scheduler.cancel_screenshots(buffer);
                info!(buffer = %buffer, "offscreen buffer destroyed");
                self.events.push(RendererEvent::OffscreenBufferDestroyed(buffer));
                Ok(())
            }
            Err(err) => {
                warn!(buffer = %buffer, error = %err, "offscreen buffer destruction refused");
                self.events.push(RendererEvent::OffscreenBufferDestroyFailed(buffer));
                Err(err)
            }
        }
    }

    pub fn declare_buffer_dependency(&mut self, consumer: BufferId, provider: BufferId) -> Result<(), RegistryError> {
        self.registry.declare_dependency(consumer, provider)
    }

    pub fn set_clear_color(&mut self, buffer: BufferId, color: ClearColor) -> Result<(), RegistryError> {
        self.registry.set_clear_color(buffer, color)
    }

    pub fn set_clear_flags(&mut self, buffer: BufferId, flags: ClearFlags) -> Result<(), RegistryError> {
        self.registry.set_clear_flags(buffer, flags)
    }

    // ─── Scenes ───

    /// Publishes a scene and creates its record.
    pub fn create_scene(&mut self, scene: SceneId) -> Result<(), TransitionError> {
        self.transition(scene, SceneTransition::Publish)?;
        if let Err(err) = self.registry.create_scene(scene) {
            warn!(scene = %scene, error = %err, "scene record kept from earlier publication");
        }
        Ok(())
    }

    /// Unpublishes a scene from any state, tearing down everything it holds.
    pub fn destroy_scene(&mut self, scene: SceneId) -> Result<(), TransitionError> {
        self.transition(scene, SceneTransition::Unpublish)?;
        self.discard_scene_record(scene);
        Ok(())
    }

    fn discard_scene_record(&mut self, scene: SceneId) {
        self.expiration.stop_monitoring(scene);
        self.latency.stop_monitoring(scene);
        if let Err(err) = self.registry.destroy_scene(scene) {
            debug!(scene = %scene, error = %err, "no scene record to discard");
        }
    }

    /// Requests one lifecycle edge and applies its side effects.
    pub fn request_transition(&mut self, scene: SceneId, transition: SceneTransition) -> Result<SceneState, TransitionError> {
        match transition {
            SceneTransition::Publish => self.create_scene(scene)?,
            SceneTransition::Unpublish => self.destroy_scene(scene)?,
            _ => {
                let outcome = self.transition(scene, transition)?;
                self.apply_side_effects(scene, transition, &outcome);
            }
        }
        Ok(self.lifecycle.state(scene))
    }

    fn transition(&mut self, scene: SceneId, transition: SceneTransition) -> Result<TransitionOutcome, TransitionError> {
        let registry = &self.registry;
        self.lifecycle.apply(
            scene,
            transition,
            |display| registry.display(display).is_some_and(|d| d.primary.is_some()),
            &mut self.events,
        )
    }

    fn apply_side_effects(&mut self, scene: SceneId, transition: SceneTransition, outcome: &TransitionOutcome) {
        match transition {
            SceneTransition::Map(display) => self.registry.set_mapped_display(scene, Some(display)),
            SceneTransition::CompleteMap => self.assign_to_primary_if_unassigned(scene),
            SceneTransition::Show => self.set_shown_flag(scene, true),
            SceneTransition::Hide => self.hide(scene),
            SceneTransition::Unmap => self.unmap(scene),
            SceneTransition::Unsubscribe | SceneTransition::ForceUnsubscribe => {
                if matches!(outcome.previous, SceneState::RenderRequested | SceneState::Rendered) {
                    self.hide(scene);
                }
                self.unmap(scene);
                self.registry.clear_scene_content(scene);
                self.expiration.stop_monitoring(scene);
                self.latency.stop_monitoring(scene);
            }
            _ => {}
        }
    }

    fn hide(&mut self, scene: SceneId) {
        self.set_shown_flag(scene, false);
        self.expiration.on_hidden(scene);
    }

    fn set_shown_flag(&mut self, scene: SceneId, shown: bool) {
        if let Err(err) = self.registry.set_scene_shown(scene, shown) {
            warn!(scene = %scene, shown, error = %err, "shown flag not updated");
        }
    }

    fn unmap(&mut self, scene: SceneId) {
        self.set_shown_flag(scene, false);
        self.registry.unassign_scene(scene);
        self.registry.set_mapped_display(scene, None);
    }

    fn assign_to_primary_if_unassigned(&mut self, scene: SceneId) {
        let Some(display) = self.registry.scene(scene).and_then(|s| s.mapped_display) else {
            return;
        };
        let Some(primary) = self.registry.display(display).and_then(|d| d.primary) else {
            return;
        };
        let assigned_here = self
            .registry
            .buffer_of_scene(scene)
            .and_then(|b| self.registry.buffer(b))
            .is_some_and(|b| b.display == display);
        if !assigned_here && self.registry.assign_scene(scene, primary, 0).is_ok() {
            debug!(scene = %scene, buffer = %primary, "mapped scene assigned to primary buffer");
        }
    }

    pub fn set_scene_shown(&mut self, scene: SceneId, shown: bool) -> Result<SceneState, TransitionError> {
        let transition = if shown {
            SceneTransition::Show
        } else {
            SceneTransition::Hide
        };
        self.request_transition(scene, transition)
    }

    pub fn attach_drawable(&mut self, scene: SceneId, drawable: Box<dyn Drawable>) -> Result<(), RegistryError> {
        self.registry.attach_drawable(scene, drawable)
    }

    /// Queues a content update for the next tick.
    ///
    /// Updates for scenes that are not subscribed are dropped.
    pub fn flush(
        &mut self,
        scene: SceneId,
        payload: Bytes,
        version: VersionTag,
        time: FlushTimeInfo,
    ) -> Result<(), RegistryError> {
        if !self.registry.has_scene(scene) {
            warn!(scene = %scene, "flush for unknown scene refused");
            return Err(RegistryError::UnknownScene(scene));
        }
        let state = self.lifecycle.state(scene);
        if !state.accepts_flushes() && state != SceneState::SubscriptionRequested {
            debug!(scene = %scene, ?state, "flush for unsubscribed scene dropped");
            return Ok(());
        }
        self.registry.enqueue_flush(
            scene,
            PendingFlush {
                version,
                time,
                payload,
            },
        )
    }

    /// Moves a scene to a buffer at the given render order.
    pub fn assign_scene_to_buffer(&mut self, scene: SceneId, buffer: BufferId, order: i32) -> Result<(), RegistryError> {
        let result = self.check_assignment(scene, buffer).and_then(|()| self.registry.assign_scene(scene, buffer, order));
        match &result {
            Ok(()) => self.events.scene(scene, SceneEventKind::AssignedToBuffer(buffer)),
            Err(err) => {
                warn!(scene = %scene, buffer = %buffer, error = %err, "scene assignment refused");
                self.events.scene(scene, SceneEventKind::AssignToBufferFailed(buffer));
            }
        }
        result
    }

    fn check_assignment(&self, scene: SceneId, buffer: BufferId) -> Result<(), RegistryError> {
        let record = self.registry.scene(scene).ok_or(RegistryError::UnknownScene(scene))?;
        let target = self.registry.buffer(buffer).ok_or(RegistryError::UnknownBuffer(buffer))?;
        match record.mapped_display {
            Some(display) if display != target.display => Err(RegistryError::DisplayMismatch { buffer, display }),
            _ => Ok(()),
        }
    }

    // ─── Tick ───

    /// Runs one frame: lifecycle signals, mapping, flushes, rendering, SLA checks.
    pub fn run_one_tick(&mut self, now: FlushTime) -> TickReport {
        self.process_signals();
        self.advance_mapping();
        self.apply_pending_flushes();

        let report = self.scheduler.run_one_tick(&mut self.registry, &mut self.events);

        for scene in &report.rendered_scenes {
            self.expiration.on_rendered(*scene);
            self.latency.on_rendered(*scene);
            if self.lifecycle.state(*scene) == SceneState::RenderRequested {
                if let Err(err) = self.transition(*scene, SceneTransition::CompleteRender) {
                    debug!(scene = %scene, error = %err, "render completion rejected");
                }
            }
        }
        self.expiration.check_at_time(now, &self.registry, &mut self.events);
        self.latency.check_at_time(now, &self.registry, &mut self.events);

        self.ticks += 1;
        trace!(tick = self.ticks, rendered = report.rendered_scenes.len(), "renderer tick");
        report
    }

    fn process_signals(&mut self) {
        for signal in self.events.drain::<LifecycleSignal>() {
            let result = match signal {
                LifecycleSignal::ScenePublished(scene) => self.create_scene(scene),
                LifecycleSignal::SceneUnpublished(scene) => self.destroy_scene(scene),
                LifecycleSignal::SceneReceived(scene) => {
                    if !self.lifecycle.can_be_subscription_pending(scene) {
                        debug!(scene = %scene, "received scene was not requested");
                        continue;
                    }
                    self.transition(scene, SceneTransition::ReceiveScene).map(|_| ())
                }
            };
            if let Err(err) = result {
                debug!(?signal, error = %err, "lifecycle signal rejected");
            }
        }
    }

    fn advance_mapping(&mut self) {
        for scene in self.lifecycle.scenes_in(SceneState::MappingAndUploading) {
            if self.registry.has_pending_flushes(scene) {
                continue;
            }
            if self.transition(scene, SceneTransition::CompleteMap).is_ok() {
                self.assign_to_primary_if_unassigned(scene);
            }
        }
        for scene in self.lifecycle.scenes_in(SceneState::MapRequested) {
            if let Err(err) = self.transition(scene, SceneTransition::BeginUpload) {
                debug!(scene = %scene, error = %err, "upload start rejected");
            }
        }
    }

    fn apply_pending_flushes(&mut self) {
        for scene in self.registry.scene_ids() {
            if !self.lifecycle.state(scene).accepts_flushes() || self.in_interrupted_pass(scene) {
                continue;
            }
            for flush in self.registry.take_pending_flushes(scene) {
                if self.lifecycle.state(scene) == SceneState::SubscriptionPending {
                    if let Err(err) = self.transition(scene, SceneTransition::CompleteSubscription) {
                        debug!(scene = %scene, error = %err, "subscription completion rejected");
                    }
                }
                let version = flush.version;
                if self.registry.apply_content(scene, version, flush.payload).is_err() {
                    continue;
                }
                self.expiration
                    .on_content_applied(scene, flush.time.expiration, version, &mut self.events);
                self.latency.on_content_applied(
                    scene,
                    flush.time.created,
                    flush.time.latency_limit,
                    version,
                    &mut self.events,
                );
                if version.is_valid() {
                    self.events.scene(scene, SceneEventKind::Flushed(version));
                }
                trace!(scene = %scene, version = %version, "flush applied");
            }
        }
    }

    /// Content of scenes inside an unfinished pass must not change.
    fn in_interrupted_pass(&self, scene: SceneId) -> bool {
        self.registry
            .buffer_of_scene(scene)
            .and_then(|b| self.registry.buffer(b))
            .is_some_and(|b| b.mid_pass)
    }

    // ─── Scheduler pass-through ───

    pub fn schedule_screenshot(&mut self, buffer: BufferId, rect: PixelRect) {
        self.scheduler.schedule_screenshot(&mut self.registry, buffer, rect);
    }

    pub fn dispatch_processed_screenshots(&mut self) {
        self.scheduler.dispatch_processed_screenshots(&mut self.events);
    }

    pub fn mark_buffer_with_scene_for_rerender(&mut self, scene: SceneId) {
        self.scheduler.mark_buffer_with_scene_for_rerender(&mut self.registry, scene);
    }

    pub fn reset_render_interrupt_state(&mut self) {
        self.scheduler.reset_render_interrupt_state(&mut self.registry);
    }

    // ─── Events ───

    /// Queues a request from a content producer for the next tick.
    pub fn submit_signal(&mut self, signal: LifecycleSignal) {
        self.events.push(signal);
    }

    pub fn drain_events<E: ChannelEvent>(&mut self) -> Vec<E> {
        self.events.drain()
    }

    pub fn drain_events_into<E: ChannelEvent>(&mut self, out: &mut Vec<E>) {
        self.events.drain_and_append(out);
    }

    pub fn drain_scene_events(&mut self) -> Vec<SceneEvent> {
        self.events.drain()
    }

    pub fn drain_renderer_events(&mut self) -> Vec<RendererEvent> {
        self.events.drain()
    }
}
