//! Scene lifecycle state machine.
//!
//! Every request is checked against a fixed legality table keyed by
//! (current state, transition). A legal request updates the state and emits its
//! positive events; an illegal one leaves the state untouched and emits exactly
//! one `*Failed` event.
//!
//! Teardown from deep states (unpublish, forced unsubscribe) synthesizes the
//! full chain of indirect events so observers always see matching teardown
//! notifications, in order: hide, unmap, unsubscribe, unpublish.

use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    event::{EventCollector, SceneEventKind},
    ids::{DisplayId, SceneId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SceneState {
    #[default]
    Unknown,
    Published,
    SubscriptionRequested,
    SubscriptionPending,
    Subscribed,
    MapRequested,
    MappingAndUploading,
    Mapped,
    RenderRequested,
    Rendered,
}

impl SceneState {
    /// States in which the scene holds received content.
    pub fn is_subscribed(self) -> bool {
        matches!(
            self,
            SceneState::Subscribed
                | SceneState::MapRequested
                | SceneState::MappingAndUploading
                | SceneState::Mapped
                | SceneState::RenderRequested
                | SceneState::Rendered
        )
    }

    /// States that accept content flushes.
    pub fn accepts_flushes(self) -> bool {
        self == SceneState::SubscriptionPending || self.is_subscribed()
    }

    /// States in which the scene may be drawn.
    pub fn is_mapped(self) -> bool {
        matches!(self, SceneState::Mapped | SceneState::RenderRequested | SceneState::Rendered)
    }
}

/// One edge of the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SceneTransition {
    Publish,
    Unpublish,
    Subscribe,
    /// The content source started sending the scene.
    ReceiveScene,
    /// First content flush arrived.
    CompleteSubscription,
    Unsubscribe,
    /// Unsubscribe caused by an error; tears down mapping and rendering.
    ForceUnsubscribe,
    Map(DisplayId),
    BeginUpload,
    CompleteMap,
    Unmap,
    Show,
    /// The scene was drawn after a show request.
    CompleteRender,
    Hide,
}

impl SceneTransition {
    fn failure_event(self) -> SceneEventKind {
        match self {
            SceneTransition::Publish => SceneEventKind::PublishFailed,
            SceneTransition::Unpublish => SceneEventKind::UnpublishFailed,
            SceneTransition::Subscribe | SceneTransition::ReceiveScene | SceneTransition::CompleteSubscription => {
                SceneEventKind::SubscribeFailed
            }
            SceneTransition::Unsubscribe | SceneTransition::ForceUnsubscribe => SceneEventKind::UnsubscribeFailed,
            SceneTransition::Map(_) | SceneTransition::BeginUpload | SceneTransition::CompleteMap => {
                SceneEventKind::MapFailed
            }
            SceneTransition::Unmap => SceneEventKind::UnmapFailed,
            SceneTransition::Show | SceneTransition::CompleteRender => SceneEventKind::ShowFailed,
            SceneTransition::Hide => SceneEventKind::HideFailed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    UnknownScene(SceneId),
    UnknownDisplay { scene: SceneId, display: DisplayId },
    Illegal {
        scene: SceneId,
        state: SceneState,
        transition: SceneTransition,
    },
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionError::UnknownScene(scene) => write!(f, "unknown scene {scene}"),
            TransitionError::UnknownDisplay { scene, display } => {
                write!(f, "scene {scene} cannot be mapped to missing display {display}")
            }
            TransitionError::Illegal {
                scene,
                state,
                transition,
            } => write!(f, "scene {scene} cannot {transition:?} while {state:?}"),
        }
    }
}

impl std::error::Error for TransitionError {}

/// Result of a legal transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub previous: SceneState,
    pub current: SceneState,
    /// Events emitted, in order.
    pub events: Vec<SceneEventKind>,
}

/// Target state of a legal transition, `None` when illegal.
fn legal_target(from: SceneState, transition: SceneTransition) -> Option<SceneState> {
    use SceneState as S;
    use SceneTransition as T;

    match (from, transition) {
        (S::Unknown, T::Publish) => Some(S::Published),
        (S::Unknown, T::Unpublish) => None,
        (_, T::Unpublish) => Some(S::Unknown),
        (S::Published, T::Subscribe) => Some(S::SubscriptionRequested),
        (S::SubscriptionRequested, T::ReceiveScene) => Some(S::SubscriptionPending),
        (S::SubscriptionPending, T::CompleteSubscription) => Some(S::Subscribed),
        (S::SubscriptionRequested | S::SubscriptionPending | S::Subscribed, T::Unsubscribe) => Some(S::Published),
        (from, T::ForceUnsubscribe) if from.accepts_flushes() || from == S::SubscriptionRequested => {
            Some(S::Published)
        }
        (S::Subscribed, T::Map(_)) => Some(S::MapRequested),
        (S::MapRequested, T::BeginUpload) => Some(S::MappingAndUploading),
        (S::MappingAndUploading, T::CompleteMap) => Some(S::Mapped),
        (S::MapRequested | S::MappingAndUploading | S::Mapped, T::Unmap) => Some(S::Subscribed),
        (S::Mapped, T::Show) => Some(S::RenderRequested),
        (S::RenderRequested, T::CompleteRender) => Some(S::Rendered),
        (S::RenderRequested | S::Rendered, T::Hide) => Some(S::Mapped),
        _ => None,
    }
}

/// Indirect events taking a scene from `from` down to `Published`.
fn teardown_to_published(from: SceneState, forced: bool) -> Vec<SceneEventKind> {
    use SceneEventKind as E;
    use SceneState as S;

    let unsubscribed = if forced { E::UnsubscribedIndirect } else { E::Unsubscribed };
    match from {
        S::Unknown | S::Published => vec![],
        S::SubscriptionRequested | S::SubscriptionPending => {
            if forced {
                vec![E::SubscribeFailed]
            } else {
                vec![E::SubscribeFailed, E::Unsubscribed]
            }
        }
        S::Subscribed => vec![unsubscribed],
        S::MapRequested | S::MappingAndUploading => vec![E::MapFailed, E::UnsubscribedIndirect],
        S::Mapped => vec![E::UnmappedIndirect, E::UnsubscribedIndirect],
        S::RenderRequested => vec![E::ShowFailed, E::UnmappedIndirect, E::UnsubscribedIndirect],
        S::Rendered => vec![E::HiddenIndirect, E::UnmappedIndirect, E::UnsubscribedIndirect],
    }
}

fn success_events(from: SceneState, transition: SceneTransition) -> Vec<SceneEventKind> {
    use SceneEventKind as E;
    use SceneTransition as T;

    match transition {
        T::Publish => vec![E::Published],
        T::Unpublish => {
            let mut events = teardown_to_published(from, true);
            events.push(E::Unpublished);
            events
        }
        T::Unsubscribe => teardown_to_published(from, false),
        T::ForceUnsubscribe => teardown_to_published(from, true),
        T::CompleteSubscription => vec![E::Subscribed],
        T::CompleteMap => vec![E::Mapped],
        T::Unmap => vec![E::Unmapped],
        T::CompleteRender => vec![E::Shown],
        T::Hide => vec![E::Hidden],
        T::Subscribe | T::ReceiveScene | T::Map(_) | T::BeginUpload | T::Show => vec![],
    }
}

/// Lifecycle state of every known scene.
#[derive(Debug, Default)]
pub struct SceneLifecycle {
    states: HashMap<SceneId, SceneState>,
}

impl SceneLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, scene: SceneId) -> SceneState {
        self.states.get(&scene).copied().unwrap_or_default()
    }

    /// Scenes currently in `state`, ascending.
    pub fn scenes_in(&self, state: SceneState) -> Vec<SceneId> {
        let mut scenes: Vec<_> = self
            .states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(id, _)| *id)
            .collect();
        scenes.sort();
        scenes
    }

    pub fn known_scenes(&self) -> usize {
        self.states.len()
    }

    /// Whether the content source may start sending `scene`.
    ///
    /// Unlike every other check this one declines silently.
    pub fn can_be_subscription_pending(&self, scene: SceneId) -> bool {
        self.state(scene) == SceneState::SubscriptionRequested
    }

    /// Validates and performs one transition.
    ///
    /// `display_exists` is consulted for map requests only.
    pub fn apply(
        &mut self,
        scene: SceneId,
        transition: SceneTransition,
        display_exists: impl Fn(DisplayId) -> bool,
        events: &mut EventCollector,
    ) -> Result<TransitionOutcome, TransitionError> {
        let from = self.state(scene);

        if from == SceneState::Unknown && transition != SceneTransition::Publish {
            if transition != SceneTransition::ReceiveScene {
                events.scene(scene, transition.failure_event());
            }
            warn!(scene = %scene, ?transition, "transition requested for unknown scene");
            return Err(TransitionError::UnknownScene(scene));
        }

        let Some(target) = legal_target(from, transition) else {
            events.scene(scene, transition.failure_event());
            warn!(scene = %scene, state = ?from, ?transition, "illegal scene transition");
            return Err(TransitionError::Illegal {
                scene,
                state: from,
                transition,
            });
        };

        if let SceneTransition::Map(display_id) = transition {
            if !display_exists(display_id) {
                events.scene(scene, transition.failure_event());
                warn!(scene = %scene, display = %display_id, "map requested without display");
                return Err(TransitionError::UnknownDisplay { scene, display: display_id });
            }
        }

        let emitted = success_events(from, transition);
        for kind in &emitted {
            events.scene(scene, *kind);
        }
        if target == SceneState::Unknown {
            self.states.remove(&scene);
        } else {
            self.states.insert(scene, target);
        }
        info!(scene = %scene, from = ?from, to = ?target, ?transition, "scene transition");

        Ok(TransitionOutcome {
            previous: from,
            current: target,
            events: emitted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SceneEvent;

    const SCENE: SceneId = SceneId(7);
    const DISPLAY: DisplayId = DisplayId(0);

    fn any_display(_: DisplayId) -> bool {
        true
    }

    fn no_display(_: DisplayId) -> bool {
        false
    }

    fn drive(lifecycle: &mut SceneLifecycle, events: &mut EventCollector, path: &[SceneTransition]) {
        for transition in path {
            lifecycle.apply(SCENE, *transition, any_display, events).unwrap();
        }
        events.drain::<SceneEvent>();
    }

    fn kinds(events: &mut EventCollector) -> Vec<SceneEventKind> {
        events.drain::<SceneEvent>().into_iter().map(|e| e.kind).collect()
    }

    const TO_RENDERED: [SceneTransition; 8] = [
        SceneTransition::Publish,
        SceneTransition::Subscribe,
        SceneTransition::ReceiveScene,
        SceneTransition::CompleteSubscription,
        SceneTransition::Map(DISPLAY),
        SceneTransition::BeginUpload,
        SceneTransition::CompleteMap,
        SceneTransition::Show,
    ];

    fn path_to(state: SceneState) -> Vec<SceneTransition> {
        let len = match state {
            SceneState::Unknown => 0,
            SceneState::Published => 1,
            SceneState::SubscriptionRequested => 2,
            SceneState::SubscriptionPending => 3,
            SceneState::Subscribed => 4,
            SceneState::MapRequested => 5,
            SceneState::MappingAndUploading => 6,
            SceneState::Mapped => 7,
            SceneState::RenderRequested => 8,
            SceneState::Rendered => 9,
        };
        let mut path: Vec<_> = TO_RENDERED.iter().copied().take(len).collect();
        if len == 9 {
            path.push(SceneTransition::CompleteRender);
        }
        path
    }

    // =============================================================================
    // LFC-001: Happy path
    // =============================================================================

    #[test]
    fn lfc_001_full_lifecycle_emits_positive_events() {
        let mut lifecycle = SceneLifecycle::new();
        let mut events = EventCollector::new();
        for transition in path_to(SceneState::Rendered) {
            lifecycle.apply(SCENE, transition, any_display, &mut events).unwrap();
        }
        assert_eq!(lifecycle.state(SCENE), SceneState::Rendered);
        assert_eq!(
            kinds(&mut events),
            vec![
                SceneEventKind::Published,
                SceneEventKind::Subscribed,
                SceneEventKind::Mapped,
                SceneEventKind::Shown
            ]
        );
    }

    #[test]
    fn lfc_001_hide_from_render_requested_and_rendered() {
        for state in [SceneState::RenderRequested, SceneState::Rendered] {
            let mut lifecycle = SceneLifecycle::new();
            let mut events = EventCollector::new();
            drive(&mut lifecycle, &mut events, &path_to(state));
            lifecycle.apply(SCENE, SceneTransition::Hide, any_display, &mut events).unwrap();
            assert_eq!(lifecycle.state(SCENE), SceneState::Mapped);
            assert_eq!(kinds(&mut events), vec![SceneEventKind::Hidden]);
        }
    }

    #[test]
    fn lfc_001_unmap_allowed_while_mapping() {
        for state in [SceneState::MapRequested, SceneState::MappingAndUploading, SceneState::Mapped] {
            let mut lifecycle = SceneLifecycle::new();
            let mut events = EventCollector::new();
            drive(&mut lifecycle, &mut events, &path_to(state));
            lifecycle.apply(SCENE, SceneTransition::Unmap, any_display, &mut events).unwrap();
            assert_eq!(lifecycle.state(SCENE), SceneState::Subscribed);
            assert_eq!(kinds(&mut events), vec![SceneEventKind::Unmapped]);
        }
    }

    #[test]
    fn lfc_001_republish_after_unpublish() {
        let mut lifecycle = SceneLifecycle::new();
        let mut events = EventCollector::new();
        drive(&mut lifecycle, &mut events, &[SceneTransition::Publish, SceneTransition::Unpublish]);
        assert_eq!(lifecycle.known_scenes(), 0);
        lifecycle.apply(SCENE, SceneTransition::Publish, any_display, &mut events).unwrap();
        assert_eq!(kinds(&mut events), vec![SceneEventKind::Published]);
    }

    // =============================================================================
    // LFC-002: Cascading teardown
    // =============================================================================

    #[test]
    fn lfc_002_unpublish_chains_from_every_state() {
        use SceneEventKind as E;
        let expected = [
            (SceneState::Published, vec![E::Unpublished]),
            (SceneState::SubscriptionRequested, vec![E::SubscribeFailed, E::Unpublished]),
            (SceneState::SubscriptionPending, vec![E::SubscribeFailed, E::Unpublished]),
            (SceneState::Subscribed, vec![E::UnsubscribedIndirect, E::Unpublished]),
            (SceneState::MapRequested, vec![E::MapFailed, E::UnsubscribedIndirect, E::Unpublished]),
            (SceneState::MappingAndUploading, vec![E::MapFailed, E::UnsubscribedIndirect, E::Unpublished]),
            (SceneState::Mapped, vec![E::UnmappedIndirect, E::UnsubscribedIndirect, E::Unpublished]),
            (
                SceneState::RenderRequested,
                vec![E::ShowFailed, E::UnmappedIndirect, E::UnsubscribedIndirect, E::Unpublished],
            ),
            (
                SceneState::Rendered,
                vec![E::HiddenIndirect, E::UnmappedIndirect, E::UnsubscribedIndirect, E::Unpublished],
            ),
        ];
        for (state, chain) in expected {
            let mut lifecycle = SceneLifecycle::new();
            let mut events = EventCollector::new();
            drive(&mut lifecycle, &mut events, &path_to(state));
            let outcome = lifecycle
                .apply(SCENE, SceneTransition::Unpublish, any_display, &mut events)
                .unwrap();
            assert_eq!(outcome.previous, state);
            assert_eq!(lifecycle.state(SCENE), SceneState::Unknown);
            assert_eq!(kinds(&mut events), chain, "unpublish from {state:?}");
        }
    }

    #[test]
    fn lfc_002_unsubscribe_while_pending_reports_failed_subscription() {
        let mut lifecycle = SceneLifecycle::new();
        let mut events = EventCollector::new();
        drive(&mut lifecycle, &mut events, &path_to(SceneState::SubscriptionPending));
        lifecycle
            .apply(SCENE, SceneTransition::Unsubscribe, any_display, &mut events)
            .unwrap();
        assert_eq!(lifecycle.state(SCENE), SceneState::Published);
        assert_eq!(
            kinds(&mut events),
            vec![SceneEventKind::SubscribeFailed, SceneEventKind::Unsubscribed]
        );
    }

    #[test]
    fn lfc_002_forced_unsubscribe_from_rendered() {
        let mut lifecycle = SceneLifecycle::new();
        let mut events = EventCollector::new();
        drive(&mut lifecycle, &mut events, &path_to(SceneState::Rendered));
        lifecycle
            .apply(SCENE, SceneTransition::ForceUnsubscribe, any_display, &mut events)
            .unwrap();
        assert_eq!(lifecycle.state(SCENE), SceneState::Published);
        assert_eq!(
            kinds(&mut events),
            vec![
                SceneEventKind::HiddenIndirect,
                SceneEventKind::UnmappedIndirect,
                SceneEventKind::UnsubscribedIndirect
            ]
        );
    }

    // =============================================================================
    // LFC-003: Illegal requests
    // =============================================================================

    #[test]
    fn lfc_003_illegal_request_is_a_no_op_with_one_failure() {
        let all = [
            SceneTransition::Publish,
            SceneTransition::Subscribe,
            SceneTransition::CompleteSubscription,
            SceneTransition::Unsubscribe,
            SceneTransition::Map(DISPLAY),
            SceneTransition::BeginUpload,
            SceneTransition::CompleteMap,
            SceneTransition::Unmap,
            SceneTransition::Show,
            SceneTransition::CompleteRender,
            SceneTransition::Hide,
        ];
        for state in [
            SceneState::Published,
            SceneState::SubscriptionRequested,
            SceneState::SubscriptionPending,
            SceneState::Subscribed,
            SceneState::MapRequested,
            SceneState::MappingAndUploading,
            SceneState::Mapped,
            SceneState::RenderRequested,
            SceneState::Rendered,
        ] {
            for transition in all {
                if legal_target(state, transition).is_some() {
                    continue;
                }
                let mut lifecycle = SceneLifecycle::new();
                let mut events = EventCollector::new();
                drive(&mut lifecycle, &mut events, &path_to(state));

                let err = lifecycle.apply(SCENE, transition, any_display, &mut events).unwrap_err();
                assert!(matches!(err, TransitionError::Illegal { .. }));
                assert_eq!(lifecycle.state(SCENE), state);
                let emitted = kinds(&mut events);
                assert_eq!(emitted.len(), 1, "{transition:?} from {state:?}");
                assert!(emitted[0].is_failure());
            }
        }
    }

    #[test]
    fn lfc_003_unknown_scene_fails_except_receive() {
        let mut lifecycle = SceneLifecycle::new();
        let mut events = EventCollector::new();

        let err = lifecycle
            .apply(SceneId(99), SceneTransition::Unmap, any_display, &mut events)
            .unwrap_err();
        assert_eq!(err, TransitionError::UnknownScene(SceneId(99)));
        assert_eq!(kinds(&mut events), vec![SceneEventKind::UnmapFailed]);

        assert!(!lifecycle.can_be_subscription_pending(SceneId(99)));
        assert!(lifecycle
            .apply(SceneId(99), SceneTransition::ReceiveScene, any_display, &mut events)
            .is_err());
        assert!(kinds(&mut events).is_empty());
    }

    #[test]
    fn lfc_003_map_without_display_fails_like_wrong_state() {
        let mut lifecycle = SceneLifecycle::new();
        let mut events = EventCollector::new();
        drive(&mut lifecycle, &mut events, &path_to(SceneState::Subscribed));

        let err = lifecycle
            .apply(SCENE, SceneTransition::Map(DisplayId(4)), no_display, &mut events)
            .unwrap_err();
        assert_eq!(
            err,
            TransitionError::UnknownDisplay {
                scene: SCENE,
                display: DisplayId(4)
            }
        );
        assert_eq!(lifecycle.state(SCENE), SceneState::Subscribed);
        assert_eq!(kinds(&mut events), vec![SceneEventKind::MapFailed]);
    }

    #[test]
    fn lfc_003_double_publish_fails() {
        let mut lifecycle = SceneLifecycle::new();
        let mut events = EventCollector::new();
        drive(&mut lifecycle, &mut events, &path_to(SceneState::Published));
        assert!(lifecycle
            .apply(SCENE, SceneTransition::Publish, any_display, &mut events)
            .is_err());
        assert_eq!(kinds(&mut events), vec![SceneEventKind::PublishFailed]);
    }
}
