//! Renderer host.
//!
//! Drives a [`Renderer`] at a fixed tick rate. Producers on other threads talk
//! to it only through a bounded command queue, so the renderer itself is
//! touched by a single writer:
//! - Content sources publish scenes and push flushes.
//! - Scene-control clients subscribe, map, show and assign scenes.
//!
//! With auto-show enabled the host acts as its own scene-control client and
//! brings every published scene on screen on the primary display.

use std::{collections::HashMap, thread::JoinHandle, time::Duration};

use anyhow::Context;
use bytes::Bytes;
use renderer_core::{
    backend::{BufferKind, BufferSize, HeadlessPlatform, PixelRect, SyntheticDrawable},
    config::RendererConfig,
    event::{LifecycleSignal, RendererEvent, SceneEvent, SceneEventKind},
    ids::{BufferId, DisplayId, SceneId, VersionTag},
    lifecycle::SceneTransition,
    renderer::Renderer,
    scheduler::TickReport,
    time::{FlushTime, FlushTimeInfo},
};
use serde::Serialize;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_DISPLAY_SIZE: BufferSize = BufferSize::new(1280, 720);

/// Commands understood by [`RendererHost::exec_console`].
pub const CONSOLE_HELP: &[&str] = &[
    "show|hide|subscribe|unsubscribe|unmap <scene>",
    "screenshot <buffer> <x> <y> <w> <h>",
    "reset   drop interrupted passes",
    "status  print host status as JSON",
    "help    this list",
    "quit    shut down",
];

/// Requests accepted by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    /// Publishes a scene drawn by a synthetic drawable of `elements` elements.
    Publish { scene: SceneId, elements: u32 },
    Receive(SceneId),
    Unpublish(SceneId),
    Subscribe(SceneId),
    Unsubscribe(SceneId),
    Map { scene: SceneId, display: DisplayId },
    Unmap(SceneId),
    Show(SceneId),
    Hide(SceneId),
    Flush {
        scene: SceneId,
        payload: Bytes,
        version: VersionTag,
        time: FlushTimeInfo,
    },
    CreateBuffer {
        display: DisplayId,
        kind: BufferKind,
        size: BufferSize,
    },
    Assign { scene: SceneId, buffer: BufferId, order: i32 },
    Screenshot { buffer: BufferId, rect: PixelRect },
    ResetInterruption,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Running,
    ShuttingDown,
}

/// Snapshot of the host for status output.
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    pub ticks: u64,
    pub displays: usize,
    pub scenes: usize,
    pub interrupted_rendering: bool,
    pub pending_screenshots: usize,
    pub budget_scope: String,
}

pub struct RendererHost {
    pub cfg: RendererConfig,
    renderer: Renderer,
    platform: HeadlessPlatform,
    display: DisplayId,
    state: HostState,
    auto_show: bool,
    commands: Option<mpsc::Receiver<HostCommand>>,
    /// Drawables waiting for their scene record to exist.
    pending_drawables: HashMap<SceneId, u32>,
    scene_events: Vec<SceneEvent>,
    renderer_events: Vec<RendererEvent>,
}

impl RendererHost {
    /// Creates a headless host with one display.
    pub fn new(cfg: RendererConfig) -> anyhow::Result<Self> {
        let (mut renderer, platform) = Renderer::with_system_clock(cfg.clone());
        let display_id = renderer
            .create_display(DEFAULT_DISPLAY_SIZE)
            .context("create default display")?;
        info!(display = %display_id, tick_hz = cfg.tick_hz, budget_us = cfg.frame_budget_us, "renderer host ready");

        Ok(Self {
            cfg,
            renderer,
            platform,
            display: display_id,
            state: HostState::Running,
            auto_show: false,
            commands: None,
            pending_drawables: HashMap::new(),
            scene_events: Vec::new(),
            renderer_events: Vec::new(),
        })
    }

    /// Makes the host subscribe, map and show every published scene.
    pub fn with_auto_show(mut self, auto_show: bool) -> Self {
        self.auto_show = auto_show;
        self
    }

    /// Creates the command queue; the host keeps the receiving end.
    pub fn command_channel(&mut self, capacity: usize) -> mpsc::Sender<HostCommand> {
        let (tx, rx) = mpsc::channel(capacity);
        self.commands = Some(rx);
        tx
    }

    pub fn set_command_input(&mut self, rx: mpsc::Receiver<HostCommand>) {
        self.commands = Some(rx);
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut Renderer {
        &mut self.renderer
    }

    pub fn platform(&self) -> &HeadlessPlatform {
        &self.platform
    }

    pub fn display(&self) -> DisplayId {
        self.display
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn status(&self) -> HostStatus {
        let registry = self.renderer.registry();
        HostStatus {
            ticks: self.renderer.ticks(),
            displays: registry.display_ids().len(),
            scenes: registry.scene_count(),
            interrupted_rendering: registry.has_interrupted_rendering(),
            pending_screenshots: self.renderer.scheduler().pending_screenshots(),
            budget_scope: format!("{:?}", self.cfg.budget_scope),
        }
    }

    pub fn status_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(&self.status()).context("serialize host status")
    }

    /// Scene events collected since the last call.
    pub fn take_scene_events(&mut self) -> Vec<SceneEvent> {
        std::mem::take(&mut self.scene_events)
    }

    /// Renderer events collected since the last call.
    pub fn take_renderer_events(&mut self) -> Vec<RendererEvent> {
        std::mem::take(&mut self.renderer_events)
    }

    /// Runs the host for a number of ticks at the configured rate.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = self.cfg.tick_interval();
        let mut next = Instant::now();

        for _ in 0..ticks {
            if self.state == HostState::ShuttingDown {
                break;
            }
            next += dt;
            self.step(FlushTime::now())?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes queued commands and one renderer tick.
    pub fn step(&mut self, now: FlushTime) -> anyhow::Result<TickReport> {
        for command in self.drain_commands() {
            if let Err(err) = self.exec(command) {
                warn!(error = %err, "host command refused");
            }
        }

        let report = self.renderer.run_one_tick(now);
        self.attach_pending_drawables();
        self.renderer.dispatch_processed_screenshots();

        let first_new = self.scene_events.len();
        self.renderer.drain_events_into(&mut self.scene_events);
        self.renderer.drain_events_into(&mut self.renderer_events);
        if self.auto_show {
            let new_events = self.scene_events[first_new..].to_vec();
            self.react_to(&new_events);
        }
        Ok(report)
    }

    fn drain_commands(&mut self) -> Vec<HostCommand> {
        let mut collected = Vec::new();
        if let Some(rx) = self.commands.as_mut() {
            while let Ok(command) = rx.try_recv() {
                collected.push(command);
            }
        }
        collected
    }

    /// Executes one command. Lifecycle refusals are reported through scene
    /// events; only malformed requests return an error.
    pub fn exec(&mut self, command: HostCommand) -> anyhow::Result<()> {
        debug!(?command, "host command");
        match command {
            HostCommand::Publish { scene, elements } => {
                self.pending_drawables.insert(scene, elements);
                self.renderer.submit_signal(LifecycleSignal::ScenePublished(scene));
            }
            HostCommand::Receive(scene) => self.renderer.submit_signal(LifecycleSignal::SceneReceived(scene)),
            HostCommand::Unpublish(scene) => {
                self.pending_drawables.remove(&scene);
                self.renderer.submit_signal(LifecycleSignal::SceneUnpublished(scene));
            }
            HostCommand::Subscribe(scene) => self.transition(scene, SceneTransition::Subscribe),
            HostCommand::Unsubscribe(scene) => self.transition(scene, SceneTransition::Unsubscribe),
            HostCommand::Map { scene, display } => self.transition(scene, SceneTransition::Map(display)),
            HostCommand::Unmap(scene) => self.transition(scene, SceneTransition::Unmap),
            HostCommand::Show(scene) => self.transition(scene, SceneTransition::Show),
            HostCommand::Hide(scene) => self.transition(scene, SceneTransition::Hide),
            HostCommand::Flush {
                scene,
                payload,
                version,
                time,
            } => self
                .renderer
                .flush(scene, payload, version, time)
                .with_context(|| format!("flush of scene {scene}"))?,
            HostCommand::CreateBuffer { display, kind, size } => {
                self.renderer.register_buffer(display, kind, size)?;
            }
            HostCommand::Assign { scene, buffer, order } => self
                .renderer
                .assign_scene_to_buffer(scene, buffer, order)
                .with_context(|| format!("assign scene {scene} to {buffer}"))?,
            HostCommand::Screenshot { buffer, rect } => self.renderer.schedule_screenshot(buffer, rect),
            HostCommand::ResetInterruption => self.renderer.reset_render_interrupt_state(),
            HostCommand::Shutdown => {
                info!("renderer host shutting down");
                self.state = HostState::ShuttingDown;
            }
        }
        Ok(())
    }

    /// Executes one console line and returns the lines to print.
    ///
    /// Accepts `status`, `quit`, `reset`, `show|hide|subscribe|unsubscribe|unmap <scene>`
    /// and `screenshot <buffer> <x> <y> <w> <h>`.
    pub fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&verb) = tokens.first() else {
            return Ok(Vec::new());
        };

        let scene_arg = || -> anyhow::Result<SceneId> {
            let raw = tokens.get(1).context("missing scene id")?;
            Ok(SceneId(raw.parse::<u64>().with_context(|| format!("bad scene id {raw:?}"))?))
        };

        let command = match verb {
            "help" => return Ok(CONSOLE_HELP.iter().map(|l| l.to_string()).collect()),
            "status" => return Ok(vec![self.status_json()?]),
            "quit" | "exit" => HostCommand::Shutdown,
            "reset" => HostCommand::ResetInterruption,
            "show" => HostCommand::Show(scene_arg()?),
            "hide" => HostCommand::Hide(scene_arg()?),
            "subscribe" => HostCommand::Subscribe(scene_arg()?),
            "unsubscribe" => HostCommand::Unsubscribe(scene_arg()?),
            "unmap" => HostCommand::Unmap(scene_arg()?),
            "screenshot" => {
                let mut numbers = Vec::with_capacity(5);
                for raw in tokens.iter().skip(1) {
                    numbers.push(raw.parse::<u32>().with_context(|| format!("bad number {raw:?}"))?);
                }
                let [buffer, x, y, width, height] = numbers[..] else {
                    return Ok(vec!["Usage: screenshot <buffer> <x> <y> <w> <h>".to_string()]);
                };
                HostCommand::Screenshot {
                    buffer: BufferId(buffer),
                    rect: PixelRect::new(x, y, width, height),
                }
            }
            other => return Ok(vec![format!("Unknown command: {other} (try 'help')")]),
        };
        self.exec(command)?;
        Ok(Vec::new())
    }

    fn transition(&mut self, scene: SceneId, transition: SceneTransition) {
        if let Err(err) = self.renderer.request_transition(scene, transition) {
            debug!(scene = %scene, error = %err, "transition refused");
        }
    }

    fn attach_pending_drawables(&mut self) {
        let ready: Vec<SceneId> = self
            .pending_drawables
            .keys()
            .copied()
            .filter(|scene| self.renderer.registry().has_scene(*scene))
            .collect();
        for scene in ready {
            if let Some(elements) = self.pending_drawables.remove(&scene) {
                if let Err(err) = self
                    .renderer
                    .attach_drawable(scene, Box::new(SyntheticDrawable::new(elements)))
                {
                    warn!(scene = %scene, error = %err, "drawable not attached");
                }
            }
        }
    }

    fn react_to(&mut self, events: &[SceneEvent]) {
        for event in events {
            match event.kind {
                SceneEventKind::Published => self.transition(event.scene, SceneTransition::Subscribe),
                SceneEventKind::Subscribed => self.transition(event.scene, SceneTransition::Map(self.display)),
                SceneEventKind::Mapped => self.transition(event.scene, SceneTransition::Show),
                _ => {}
            }
        }
    }
}

/// Simulated content source publishing scenes and flushing them periodically.
#[derive(Debug, Clone)]
pub struct ContentSource {
    pub scenes: Vec<SceneId>,
    pub elements: u32,
    pub flush_interval: Duration,
    /// Flushes per scene; `None` runs until the host goes away.
    pub flushes: Option<u64>,
    pub expiration: Option<Duration>,
    pub latency_limit: Option<Duration>,
}

impl Default for ContentSource {
    fn default() -> Self {
        Self {
            scenes: vec![SceneId(1), SceneId(2)],
            elements: 64,
            flush_interval: Duration::from_millis(50),
            flushes: None,
            expiration: Some(Duration::from_millis(500)),
            latency_limit: Some(Duration::from_millis(200)),
        }
    }
}

impl ContentSource {
    fn time_info(&self) -> FlushTimeInfo {
        let created = FlushTime::now();
        let mut info = FlushTimeInfo::created_at(created);
        if let Some(expiration) = self.expiration {
            info = info.with_expiration(created + expiration);
        }
        if let Some(limit) = self.latency_limit {
            info = info.with_latency_limit(limit);
        }
        info
    }

    /// Runs the source on its own thread until done or the host hangs up.
    pub fn spawn(self, tx: mpsc::Sender<HostCommand>) -> JoinHandle<()> {
        std::thread::spawn(move || {
            for scene in &self.scenes {
                let publish = HostCommand::Publish {
                    scene: *scene,
                    elements: self.elements,
                };
                if tx.blocking_send(publish).is_err() {
                    return;
                }
            }

            let mut version = 0u64;
            while self.flushes.map_or(true, |limit| version < limit) {
                version += 1;
                for scene in &self.scenes {
                    // Scenes that are not awaiting content decline this silently.
                    let receive = HostCommand::Receive(*scene);
                    let flush = HostCommand::Flush {
                        scene: *scene,
                        payload: Bytes::from(format!("scene {scene} v{version}")),
                        version: VersionTag::new(version),
                        time: self.time_info(),
                    };
                    if tx.blocking_send(receive).is_err() || tx.blocking_send(flush).is_err() {
                        return;
                    }
                }
                std::thread::sleep(self.flush_interval);
            }
            debug!(flushes = version, "content source finished");
        })
    }
}
