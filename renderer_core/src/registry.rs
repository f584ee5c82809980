//! Content registry.
//!
//! Owns every scene record, display and display buffer for their entire
//! lifetime, plus the modified-state flags the frame scheduler reads. Records are
//! addressed by id; the registry keeps the scene ↔ buffer assignment consistent
//! in both directions.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt,
};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::{
    backend::{BufferKind, BufferSize, ClearColor, ClearFlags, Drawable, Presentable, RenderPassIterator},
    ids::{BufferId, DisplayId, SceneId, VersionTag},
    time::FlushTimeInfo,
};

/// A content update waiting to be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingFlush {
    pub version: VersionTag,
    pub time: FlushTimeInfo,
    pub payload: Bytes,
}

/// Where a scene is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAssignment {
    pub buffer: BufferId,
    pub order: i32,
}

/// A scene record.
pub struct Scene {
    pub id: SceneId,
    pub(crate) drawable: Option<Box<dyn Drawable>>,
    pub shown: bool,
    pub assignment: Option<BufferAssignment>,
    /// Content changed since the owning buffer last started rendering it.
    pub content_modified: bool,
    pub(crate) pending_flushes: VecDeque<PendingFlush>,
    /// Display requested by the last map request.
    pub mapped_display: Option<DisplayId>,
    pub applied_version: VersionTag,
    pub content: Option<Bytes>,
}

impl Scene {
    fn new(id: SceneId) -> Self {
        Scene {
            id,
            drawable: None,
            shown: false,
            assignment: None,
            content_modified: false,
            pending_flushes: VecDeque::new(),
            mapped_display: None,
            applied_version: VersionTag::INVALID,
            content: None,
        }
    }

    pub fn has_drawable(&self) -> bool {
        self.drawable.is_some()
    }

    pub fn pending_flushes(&self) -> impl Iterator<Item = &PendingFlush> {
        self.pending_flushes.iter()
    }
}

impl fmt::Debug for Scene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scene")
            .field("id", &self.id)
            .field("shown", &self.shown)
            .field("assignment", &self.assignment)
            .field("content_modified", &self.content_modified)
            .field("pending_flushes", &self.pending_flushes.len())
            .field("has_drawable", &self.drawable.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignedScene {
    pub scene: SceneId,
    pub order: i32,
}

/// A display buffer record.
pub struct DisplayBuffer {
    pub id: BufferId,
    pub display: DisplayId,
    pub kind: BufferKind,
    pub size: BufferSize,
    pub clear_flags: ClearFlags,
    pub clear_color: ClearColor,
    /// Must be cleared and re-rendered from scratch.
    pub needs_rerender: bool,
    /// Rendered into since the last present.
    pub unpresented_content: bool,
    /// Scenes sorted by (order, id).
    pub(crate) assigned: Vec<AssignedScene>,
    /// Extra buffers sampling this buffer's pixels.
    pub(crate) consumers: Vec<BufferId>,
    /// Interruptible only: the scene whose render is incomplete and where to resume it.
    pub(crate) resume_cursor: Option<(SceneId, RenderPassIterator)>,
    /// Interruptible only: a pass has been started and not yet presented.
    pub mid_pass: bool,
    pub(crate) surface: Box<dyn Presentable>,
}

impl DisplayBuffer {
    pub fn assigned_scenes(&self) -> &[AssignedScene] {
        &self.assigned
    }

    pub fn resume_cursor(&self, scene: SceneId) -> Option<RenderPassIterator> {
        self.resume_cursor.filter(|(s, _)| *s == scene).map(|(_, c)| c)
    }

    pub fn has_resume_cursor(&self) -> bool {
        self.resume_cursor.is_some()
    }

    pub fn is_interruptible(&self) -> bool {
        self.kind == BufferKind::InterruptibleOffscreen
    }

    /// Drops any partial pass so the next one starts from a clear.
    pub(crate) fn restart_pass(&mut self) {
        if self.mid_pass || self.resume_cursor.is_some() {
            trace!(buffer = %self.id, "interrupted pass discarded");
        }
        self.mid_pass = false;
        self.resume_cursor = None;
        self.needs_rerender = true;
    }
}

impl fmt::Debug for DisplayBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayBuffer")
            .field("id", &self.id)
            .field("display", &self.display)
            .field("kind", &self.kind)
            .field("needs_rerender", &self.needs_rerender)
            .field("mid_pass", &self.mid_pass)
            .field("assigned", &self.assigned)
            .field("resume_cursor", &self.resume_cursor)
            .finish()
    }
}

/// A display and the buffers it owns, in registration order.
#[derive(Debug, Clone)]
pub struct Display {
    pub id: DisplayId,
    pub primary: Option<BufferId>,
    pub buffers: Vec<BufferId>,
    /// Whether the surface accepted a frame on the previous tick.
    pub could_render_last_frame: bool,
}

/// Registry errors. Returned to the caller; registry state is left unmodified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    UnknownScene(SceneId),
    SceneAlreadyExists(SceneId),
    UnknownBuffer(BufferId),
    UnknownDisplay(DisplayId),
    DisplayAlreadyExists(DisplayId),
    PrimaryAlreadyRegistered(DisplayId),
    PrimaryBufferNotRemovable(BufferId),
    BufferInUse(BufferId),
    DisplayInUse(DisplayId),
    DisplayMismatch { buffer: BufferId, display: DisplayId },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::UnknownScene(s) => write!(f, "unknown scene {s}"),
            RegistryError::SceneAlreadyExists(s) => write!(f, "scene {s} already exists"),
            RegistryError::UnknownBuffer(b) => write!(f, "unknown buffer {b}"),
            RegistryError::UnknownDisplay(d) => write!(f, "unknown display {d}"),
            RegistryError::DisplayAlreadyExists(d) => write!(f, "display {d} already exists"),
            RegistryError::PrimaryAlreadyRegistered(d) => write!(f, "display {d} already has a primary buffer"),
            RegistryError::PrimaryBufferNotRemovable(b) => write!(f, "primary buffer {b} is removed with its display"),
            RegistryError::BufferInUse(b) => write!(f, "buffer {b} still has scenes assigned"),
            RegistryError::DisplayInUse(d) => write!(f, "display {d} still has scenes mapped"),
            RegistryError::DisplayMismatch { buffer, display } => {
                write!(f, "buffer {buffer} does not belong to display {display}")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Owner of all scene, display and buffer records.
#[derive(Debug, Default)]
pub struct ContentRegistry {
    pub(crate) scenes: HashMap<SceneId, Scene>,
    pub(crate) buffers: HashMap<BufferId, DisplayBuffer>,
    displays: BTreeMap<DisplayId, Display>,
    next_buffer: u32,
}

impl ContentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Scenes ───

    pub fn create_scene(&mut self, id: SceneId) -> Result<(), RegistryError> {
        if self.scenes.contains_key(&id) {
            return Err(RegistryError::SceneAlreadyExists(id));
        }
        self.scenes.insert(id, Scene::new(id));
        debug!(scene = %id, "scene record created");
        Ok(())
    }

    /// Removes a scene record, unassigning it from its buffer first.
    pub fn destroy_scene(&mut self, id: SceneId) -> Result<(), RegistryError> {
        if !self.scenes.contains_key(&id) {
            return Err(RegistryError::UnknownScene(id));
        }
        self.unassign_scene(id);
        self.scenes.remove(&id);
        debug!(scene = %id, "scene record destroyed");
        Ok(())
    }

    pub fn has_scene(&self, id: SceneId) -> bool {
        self.scenes.contains_key(&id)
    }

    pub fn scene(&self, id: SceneId) -> Option<&Scene> {
        self.scenes.get(&id)
    }

    pub fn scene_count(&self) -> usize {
        self.scenes.len()
    }

    /// Scene ids in ascending order.
    pub fn scene_ids(&self) -> Vec<SceneId> {
        let mut ids: Vec<_> = self.scenes.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn attach_drawable(&mut self, id: SceneId, drawable: Box<dyn Drawable>) -> Result<(), RegistryError> {
        let scene = self.scenes.get_mut(&id).ok_or(RegistryError::UnknownScene(id))?;
        scene.drawable = Some(drawable);
        self.mark_scene_modified(id);
        Ok(())
    }

    pub fn enqueue_flush(&mut self, id: SceneId, flush: PendingFlush) -> Result<(), RegistryError> {
        let scene = self.scenes.get_mut(&id).ok_or(RegistryError::UnknownScene(id))?;
        trace!(scene = %id, version = %flush.version, "flush queued");
        scene.pending_flushes.push_back(flush);
        Ok(())
    }

    pub fn take_pending_flushes(&mut self, id: SceneId) -> VecDeque<PendingFlush> {
        self.scenes
            .get_mut(&id)
            .map(|s| std::mem::take(&mut s.pending_flushes))
            .unwrap_or_default()
    }

    pub fn has_pending_flushes(&self, id: SceneId) -> bool {
        self.scenes.get(&id).is_some_and(|s| !s.pending_flushes.is_empty())
    }

    /// Records applied content and marks the owning buffer for re-render.
    pub fn apply_content(&mut self, id: SceneId, version: VersionTag, payload: Bytes) -> Result<(), RegistryError> {
        let scene = self.scenes.get_mut(&id).ok_or(RegistryError::UnknownScene(id))?;
        scene.applied_version = version;
        scene.content = Some(payload);
        self.mark_scene_modified(id);
        Ok(())
    }

    /// Drops everything received from the content source (used on unsubscribe).
    ///
    /// The drawable belongs to the publication and survives, so a later
    /// subscription renders it again.
    pub fn clear_scene_content(&mut self, id: SceneId) {
        if let Some(scene) = self.scenes.get_mut(&id) {
            scene.pending_flushes.clear();
            scene.content = None;
            scene.applied_version = VersionTag::INVALID;
            scene.content_modified = false;
        }
    }

    pub fn set_mapped_display(&mut self, id: SceneId, display: Option<DisplayId>) {
        if let Some(scene) = self.scenes.get_mut(&id) {
            scene.mapped_display = display;
        }
    }

    pub fn mark_scene_modified(&mut self, id: SceneId) {
        let Some(scene) = self.scenes.get_mut(&id) else {
            return;
        };
        scene.content_modified = true;
        if let Some(assignment) = scene.assignment {
            if let Some(buffer) = self.buffers.get_mut(&assignment.buffer) {
                buffer.needs_rerender = true;
            }
        }
    }

    // ─── Displays and buffers ───

    pub fn add_display(&mut self, id: DisplayId) -> Result<(), RegistryError> {
        if self.displays.contains_key(&id) {
            return Err(RegistryError::DisplayAlreadyExists(id));
        }
        self.displays.insert(
            id,
            Display {
                id,
                primary: None,
                buffers: Vec::new(),
                could_render_last_frame: true,
            },
        );
        Ok(())
    }

    /// Removes a display with all of its buffers.
    pub fn remove_display(&mut self, id: DisplayId) -> Result<Vec<BufferId>, RegistryError> {
        let display = self.displays.get(&id).ok_or(RegistryError::UnknownDisplay(id))?;
        let in_use = display
            .buffers
            .iter()
            .filter_map(|b| self.buffers.get(b))
            .any(|b| !b.assigned.is_empty())
            || self.scenes.values().any(|s| s.mapped_display == Some(id));
        if in_use {
            return Err(RegistryError::DisplayInUse(id));
        }
        let buffers = display.buffers.clone();
        for buffer in &buffers {
            self.buffers.remove(buffer);
        }
        for buffer in self.buffers.values_mut() {
            buffer.consumers.retain(|c| !buffers.contains(c));
        }
        self.displays.remove(&id);
        Ok(buffers)
    }

    pub fn has_display(&self, id: DisplayId) -> bool {
        self.displays.contains_key(&id)
    }

    pub fn display(&self, id: DisplayId) -> Option<&Display> {
        self.displays.get(&id)
    }

    pub(crate) fn display_mut(&mut self, id: DisplayId) -> Option<&mut Display> {
        self.displays.get_mut(&id)
    }

    /// Display ids in registration order.
    pub fn display_ids(&self) -> Vec<DisplayId> {
        self.displays.keys().copied().collect()
    }

    /// Validates a registration before a surface is created for it.
    pub fn check_buffer_registration(&self, display: DisplayId, kind: BufferKind) -> Result<(), RegistryError> {
        let record = self.displays.get(&display).ok_or(RegistryError::UnknownDisplay(display))?;
        if kind == BufferKind::Primary && record.primary.is_some() {
            return Err(RegistryError::PrimaryAlreadyRegistered(display));
        }
        Ok(())
    }

    pub fn reserve_buffer_id(&mut self) -> BufferId {
        let id = BufferId(self.next_buffer);
        self.next_buffer += 1;
        id
    }

    pub fn insert_buffer(
        &mut self,
        id: BufferId,
        display_id: DisplayId,
        kind: BufferKind,
        size: BufferSize,
        clear_color: ClearColor,
        surface: Box<dyn Presentable>,
    ) -> Result<(), RegistryError> {
        self.check_buffer_registration(display_id, kind)?;
        let record = self.displays.get_mut(&display_id).ok_or(RegistryError::UnknownDisplay(display_id))?;
        if kind == BufferKind::Primary {
            record.primary = Some(id);
        }
        record.buffers.push(id);
        self.buffers.insert(
            id,
            DisplayBuffer {
                id,
                display: display_id,
                kind,
                size,
                clear_flags: ClearFlags::ALL,
                clear_color,
                needs_rerender: true,
                unpresented_content: false,
                assigned: Vec::new(),
                consumers: Vec::new(),
                resume_cursor: None,
                mid_pass: false,
                surface,
            },
        );
        debug!(buffer = %id, display = %display_id, ?kind, "buffer registered");
        Ok(())
    }

    pub fn remove_buffer(&mut self, id: BufferId) -> Result<(), RegistryError> {
        let buffer = self.buffers.get(&id).ok_or(RegistryError::UnknownBuffer(id))?;
        if buffer.kind == BufferKind::Primary {
            return Err(RegistryError::PrimaryBufferNotRemovable(id));
        }
        if !buffer.assigned.is_empty() {
            return Err(RegistryError::BufferInUse(id));
        }
        let display = buffer.display;
        self.buffers.remove(&id);
        for other in self.buffers.values_mut() {
            other.consumers.retain(|c| *c != id);
        }
        if let Some(record) = self.displays.get_mut(&display) {
            record.buffers.retain(|b| *b != id);
        }
        Ok(())
    }

    pub fn buffer(&self, id: BufferId) -> Option<&DisplayBuffer> {
        self.buffers.get(&id)
    }

    pub fn has_buffer(&self, id: BufferId) -> bool {
        self.buffers.contains_key(&id)
    }

    pub fn buffer_of_scene(&self, scene: SceneId) -> Option<BufferId> {
        self.scenes.get(&scene)?.assignment.map(|a| a.buffer)
    }

    pub fn set_clear_color(&mut self, id: BufferId, color: ClearColor) -> Result<(), RegistryError> {
        let buffer = self.buffers.get_mut(&id).ok_or(RegistryError::UnknownBuffer(id))?;
        buffer.clear_color = color;
        buffer.needs_rerender = true;
        Ok(())
    }

    pub fn set_clear_flags(&mut self, id: BufferId, flags: ClearFlags) -> Result<(), RegistryError> {
        let buffer = self.buffers.get_mut(&id).ok_or(RegistryError::UnknownBuffer(id))?;
        buffer.clear_flags = flags;
        buffer.needs_rerender = true;
        Ok(())
    }

    pub fn mark_buffer_for_rerender(&mut self, id: BufferId) {
        if let Some(buffer) = self.buffers.get_mut(&id) {
            buffer.needs_rerender = true;
        }
    }

    /// Declares that `consumer` samples the pixels of `provider`.
    pub fn declare_dependency(&mut self, consumer: BufferId, provider: BufferId) -> Result<(), RegistryError> {
        let consumer_display = self.buffers.get(&consumer).ok_or(RegistryError::UnknownBuffer(consumer))?.display;
        let provider = self.buffers.get_mut(&provider).ok_or(RegistryError::UnknownBuffer(provider))?;
        if provider.display != consumer_display {
            return Err(RegistryError::DisplayMismatch {
                buffer: consumer,
                display: provider.display,
            });
        }
        if !provider.consumers.contains(&consumer) {
            provider.consumers.push(consumer);
        }
        Ok(())
    }

    /// Buffers that sample `provider`: its display's primary plus declared consumers.
    pub fn consumers_of(&self, provider: BufferId) -> Vec<BufferId> {
        let Some(buffer) = self.buffers.get(&provider) else {
            return Vec::new();
        };
        let mut consumers = Vec::new();
        if let Some(primary) = self.displays.get(&buffer.display).and_then(|d| d.primary) {
            if primary != provider {
                consumers.push(primary);
            }
        }
        for consumer in &buffer.consumers {
            if !consumers.contains(consumer) {
                consumers.push(*consumer);
            }
        }
        consumers
    }

    // ─── Assignment ───

    /// Assigns a scene to a buffer at the given render order, moving it if needed.
    pub fn assign_scene(&mut self, scene: SceneId, buffer: BufferId, order: i32) -> Result<(), RegistryError> {
        if !self.scenes.contains_key(&scene) {
            return Err(RegistryError::UnknownScene(scene));
        }
        if !self.buffers.contains_key(&buffer) {
            return Err(RegistryError::UnknownBuffer(buffer));
        }
        let shown = self.scenes.get(&scene).is_some_and(|s| s.shown);
        self.unassign_scene(scene);

        let Some(target) = self.buffers.get_mut(&buffer) else {
            return Err(RegistryError::UnknownBuffer(buffer));
        };
        let entry = AssignedScene { scene, order };
        let at = target
            .assigned
            .partition_point(|a| (a.order, a.scene) < (entry.order, entry.scene));
        target.assigned.insert(at, entry);
        if target.mid_pass && shown {
            target.restart_pass();
        }
        target.needs_rerender = true;

        if let Some(record) = self.scenes.get_mut(&scene) {
            record.assignment = Some(BufferAssignment { buffer, order });
            record.content_modified = true;
        }
        debug!(scene = %scene, buffer = %buffer, order, "scene assigned");
        Ok(())
    }

    /// Removes a scene from its buffer, discarding any cursor held for it.
    pub fn unassign_scene(&mut self, scene: SceneId) -> Option<BufferId> {
        let record = self.scenes.get_mut(&scene)?;
        let assignment = record.assignment.take()?;
        let shown = record.shown;
        if let Some(buffer) = self.buffers.get_mut(&assignment.buffer) {
            buffer.assigned.retain(|a| a.scene != scene);
            let held_cursor = buffer.resume_cursor.is_some_and(|(s, _)| s == scene);
            if held_cursor || (buffer.mid_pass && shown) {
                buffer.restart_pass();
            }
            buffer.needs_rerender = true;
        }
        debug!(scene = %scene, buffer = %assignment.buffer, "scene unassigned");
        Some(assignment.buffer)
    }

    pub fn set_scene_shown(&mut self, scene: SceneId, shown: bool) -> Result<(), RegistryError> {
        let record = self.scenes.get_mut(&scene).ok_or(RegistryError::UnknownScene(scene))?;
        if record.shown == shown {
            return Ok(());
        }
        record.shown = shown;
        if let Some(assignment) = record.assignment {
            if let Some(buffer) = self.buffers.get_mut(&assignment.buffer) {
                if buffer.mid_pass {
                    buffer.restart_pass();
                }
                buffer.needs_rerender = true;
            }
        }
        Ok(())
    }

    /// Shown scenes of a buffer in ascending render order.
    pub fn shown_scenes(&self, buffer: BufferId) -> Vec<SceneId> {
        let Some(record) = self.buffers.get(&buffer) else {
            return Vec::new();
        };
        record
            .assigned
            .iter()
            .filter(|a| self.scenes.get(&a.scene).is_some_and(|s| s.shown))
            .map(|a| a.scene)
            .collect()
    }

    /// Whether the buffer itself or any scene assigned to it changed.
    pub fn buffer_has_changes(&self, buffer: BufferId) -> bool {
        let Some(record) = self.buffers.get(&buffer) else {
            return false;
        };
        record.needs_rerender
            || record
                .assigned
                .iter()
                .any(|a| self.scenes.get(&a.scene).is_some_and(|s| s.content_modified))
    }

    pub(crate) fn clear_change_flags(&mut self, buffer: BufferId) {
        let Some(record) = self.buffers.get_mut(&buffer) else {
            return;
        };
        record.needs_rerender = false;
        for assigned in &record.assigned {
            if let Some(scene) = self.scenes.get_mut(&assigned.scene) {
                scene.content_modified = false;
            }
        }
    }

    /// Whether any interruptible buffer holds an unfinished pass.
    pub fn has_interrupted_rendering(&self) -> bool {
        self.buffers.values().any(|b| b.mid_pass)
    }

    /// Discards every stored cursor and partial pass.
    pub fn reset_interrupt_state(&mut self) {
        for buffer in self.buffers.values_mut().filter(|b| b.is_interruptible()) {
            if buffer.mid_pass {
                buffer.restart_pass();
            }
        }
    }
}
