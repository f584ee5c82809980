//! Shared helpers for the renderer integration tests.
//!
//! [`Harness`] owns a headless renderer on a manual clock. Drawables created
//! through it advance that clock by [`ELEMENT_COST`] per element, so a budget
//! of `k` milliseconds fits exactly `k` elements.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use bytes::Bytes;
use renderer_core::prelude::*;
use tracing::debug;

pub const ELEMENT_COST: Duration = Duration::from_millis(1);

/// Wall-clock origin used for flush timestamps.
pub const T0: FlushTime = FlushTime::from_millis(1_700_000_000_000);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub renderer: Renderer,
    pub platform: HeadlessPlatform,
    pub clock: Arc<ManualClock>,
    pub display: DisplayId,
    /// Wall-clock value passed to the next tick.
    pub now: FlushTime,
}

impl Harness {
    pub fn new(config: RendererConfig) -> anyhow::Result<Self> {
        init_tracing();
        let clock = ManualClock::shared();
        let (mut renderer, platform) = Renderer::headless(config, clock.clone());
        let display_id = renderer
            .create_display(BufferSize::new(64, 64))
            .context("create display")?;
        renderer.drain_renderer_events();
        debug!(display = %display_id, "test harness ready");
        Ok(Harness {
            renderer,
            platform,
            clock,
            display: display_id,
            now: T0,
        })
    }

    /// Harness whose frame budget fits `elements` elements per tick.
    pub fn with_element_budget(elements: u64) -> anyhow::Result<Self> {
        Self::new(RendererConfig {
            frame_budget_us: elements * ELEMENT_COST.as_micros() as u64,
            ..Default::default()
        })
    }

    pub fn primary(&self) -> anyhow::Result<BufferId> {
        self.renderer
            .registry()
            .display(self.display)
            .and_then(|d| d.primary)
            .context("display has no primary buffer")
    }

    pub fn offscreen(&mut self, kind: BufferKind) -> anyhow::Result<BufferId> {
        let buffer = self.renderer.register_buffer(self.display, kind, BufferSize::new(32, 32))?;
        self.renderer.drain_renderer_events();
        Ok(buffer)
    }

    pub fn surface(&self, buffer: BufferId) -> anyhow::Result<SurfaceStats> {
        Ok(self.platform.probe(buffer).context("no surface for buffer")?.stats())
    }

    pub fn tick(&mut self) -> TickReport {
        self.renderer.run_one_tick(self.now)
    }

    pub fn tick_at(&mut self, now: FlushTime) -> TickReport {
        self.now = now;
        self.tick()
    }

    pub fn state(&self, scene: SceneId) -> SceneState {
        self.renderer.scene_state(scene)
    }

    pub fn flush(&mut self, scene: SceneId, version: u64, time: FlushTimeInfo) -> anyhow::Result<()> {
        let payload = Bytes::from(format!("{scene}@{version}"));
        self.renderer
            .flush(scene, payload, VersionTag::new(version), time)
            .with_context(|| format!("flush scene {scene}"))
    }

    /// Publishes a scene with a clock-charging drawable.
    pub fn publish(&mut self, scene: SceneId, elements: u32) -> anyhow::Result<DrawProbe> {
        self.renderer.create_scene(scene)?;
        let drawable = SyntheticDrawable::new(elements).with_element_cost(self.clock.clone(), ELEMENT_COST);
        let probe = drawable.probe();
        self.renderer.attach_drawable(scene, Box::new(drawable))?;
        Ok(probe)
    }

    /// Subscribes a published scene; its first content carries `time`.
    pub fn subscribe(&mut self, scene: SceneId, time: FlushTimeInfo) -> anyhow::Result<()> {
        self.renderer.request_transition(scene, SceneTransition::Subscribe)?;
        self.renderer.submit_signal(LifecycleSignal::SceneReceived(scene));
        self.flush(scene, 1, time)?;
        self.tick();
        anyhow::ensure!(self.state(scene) == SceneState::Subscribed, "scene {scene} not subscribed");
        Ok(())
    }

    pub fn map(&mut self, scene: SceneId) -> anyhow::Result<()> {
        self.renderer.request_transition(scene, SceneTransition::Map(self.display))?;
        self.tick();
        self.tick();
        anyhow::ensure!(self.state(scene) == SceneState::Mapped, "scene {scene} not mapped");
        Ok(())
    }

    pub fn show(&mut self, scene: SceneId) -> anyhow::Result<()> {
        self.renderer.request_transition(scene, SceneTransition::Show)?;
        self.tick();
        anyhow::ensure!(self.state(scene) == SceneState::Rendered, "scene {scene} not rendered");
        Ok(())
    }

    /// Takes a scene from `Unknown` to `Rendered` on the primary buffer.
    pub fn bring_up(&mut self, scene: SceneId, elements: u32, time: FlushTimeInfo) -> anyhow::Result<DrawProbe> {
        let probe = self.publish(scene, elements)?;
        self.subscribe(scene, time)?;
        self.map(scene)?;
        self.show(scene)?;
        Ok(probe)
    }

    /// Drains all scene events and keeps the kinds for `scene`.
    pub fn scene_kinds(&mut self, scene: SceneId) -> Vec<SceneEventKind> {
        self.renderer
            .drain_scene_events()
            .into_iter()
            .filter(|e| e.scene == scene)
            .map(|e| e.kind)
            .collect()
    }
}
