//! Event collection.
//!
//! A small multi-channel event queue. Each event type belongs to exactly one
//! channel, fixed at compile time through [`ChannelEvent`]:
//! - [`RendererEvent`]: renderer-wide results (displays, buffers, screenshots, loop times).
//! - [`SceneEvent`]: scene lifecycle outcomes and SLA notifications.
//! - [`LifecycleSignal`]: internal requests consumed only by the renderer's own driver.
//!
//! Order is FIFO within a channel; nothing is guaranteed across channels.

use std::{fmt::Debug, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    backend::PixelRect,
    ids::{BufferId, DisplayId, SceneId, VersionTag},
};

/// Channel discriminant, used for logging and draining by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Renderer,
    SceneControl,
    Internal,
}

/// Renderer-wide events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RendererEvent {
    DisplayCreated(DisplayId),
    DisplayCreateFailed,
    DisplayDestroyed(DisplayId),
    DisplayDestroyFailed(DisplayId),
    OffscreenBufferCreated { display: DisplayId, buffer: BufferId },
    OffscreenBufferCreateFailed { display: DisplayId },
    OffscreenBufferDestroyed(BufferId),
    OffscreenBufferDestroyFailed(BufferId),
    ReadPixels { buffer: BufferId, rect: PixelRect, pixels: Vec<u8> },
    ReadPixelsFailed { buffer: BufferId, rect: PixelRect },
    PeriodicLoopTimes { max: Duration, avg: Duration },
}

/// What happened to a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SceneEventKind {
    Published,
    PublishFailed,
    Unpublished,
    UnpublishFailed,
    Subscribed,
    SubscribeFailed,
    Unsubscribed,
    UnsubscribedIndirect,
    UnsubscribeFailed,
    Mapped,
    MapFailed,
    Unmapped,
    UnmappedIndirect,
    UnmapFailed,
    Shown,
    ShowFailed,
    Hidden,
    HiddenIndirect,
    HideFailed,
    AssignedToBuffer(BufferId),
    AssignToBufferFailed(BufferId),
    Flushed(VersionTag),
    ExpirationMonitoringEnabled,
    ExpirationMonitoringDisabled,
    Expired,
    RecoveredFromExpiration,
    LatencyMonitoringEnabled,
    LatencyMonitoringDisabled,
    LatencyExceeded,
    LatencyBackBelowLimit,
}

impl SceneEventKind {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SceneEventKind::PublishFailed
                | SceneEventKind::UnpublishFailed
                | SceneEventKind::SubscribeFailed
                | SceneEventKind::UnsubscribeFailed
                | SceneEventKind::MapFailed
                | SceneEventKind::UnmapFailed
                | SceneEventKind::ShowFailed
                | SceneEventKind::HideFailed
                | SceneEventKind::AssignToBufferFailed(_)
        )
    }
}

/// Scene-control channel payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SceneEvent {
    pub scene: SceneId,
    pub kind: SceneEventKind,
}

impl SceneEvent {
    pub fn new(scene: SceneId, kind: SceneEventKind) -> Self {
        SceneEvent { scene, kind }
    }
}

/// Requests from content producers, applied by the renderer at the start of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleSignal {
    ScenePublished(SceneId),
    SceneReceived(SceneId),
    SceneUnpublished(SceneId),
}

/// Binds an event type to its queue.
pub trait ChannelEvent: Debug + Sized {
    const CHANNEL: Channel;

    fn queue(collector: &mut EventCollector) -> &mut Vec<Self>;

    fn queue_ref(collector: &EventCollector) -> &Vec<Self>;
}

impl ChannelEvent for RendererEvent {
    const CHANNEL: Channel = Channel::Renderer;

    fn queue(collector: &mut EventCollector) -> &mut Vec<Self> {
        &mut collector.renderer
    }

    fn queue_ref(collector: &EventCollector) -> &Vec<Self> {
        &collector.renderer
    }
}

impl ChannelEvent for SceneEvent {
    const CHANNEL: Channel = Channel::SceneControl;

    fn queue(collector: &mut EventCollector) -> &mut Vec<Self> {
        &mut collector.scene_control
    }

    fn queue_ref(collector: &EventCollector) -> &Vec<Self> {
        &collector.scene_control
    }
}

impl ChannelEvent for LifecycleSignal {
    const CHANNEL: Channel = Channel::Internal;

    fn queue(collector: &mut EventCollector) -> &mut Vec<Self> {
        &mut collector.internal
    }

    fn queue_ref(collector: &EventCollector) -> &Vec<Self> {
        &collector.internal
    }
}

/// Per-channel FIFO queues.
#[derive(Debug, Default)]
pub struct EventCollector {
    renderer: Vec<RendererEvent>,
    scene_control: Vec<SceneEvent>,
    internal: Vec<LifecycleSignal>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event to its channel.
    pub fn push<E: ChannelEvent>(&mut self, event: E) {
        debug!(channel = ?E::CHANNEL, ?event, "event");
        E::queue(self).push(event);
    }

    /// Shorthand for the scene-control channel.
    pub fn scene(&mut self, scene: SceneId, kind: SceneEventKind) {
        self.push(SceneEvent::new(scene, kind));
    }

    /// Takes all queued events of a channel.
    pub fn drain<E: ChannelEvent>(&mut self) -> Vec<E> {
        std::mem::take(E::queue(self))
    }

    /// Moves all queued events of a channel to the end of `out`.
    pub fn drain_and_append<E: ChannelEvent>(&mut self, out: &mut Vec<E>) {
        out.append(E::queue(self));
    }

    /// Queued events of a channel, oldest first.
    pub fn peek<E: ChannelEvent>(&self) -> &[E] {
        E::queue_ref(self)
    }

    pub fn pending<E: ChannelEvent>(&self) -> usize {
        E::queue_ref(self).len()
    }
}
