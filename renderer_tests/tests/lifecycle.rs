use std::time::Duration;

use renderer_core::prelude::*;
use renderer_tests::{Harness, T0};

const SCENE: SceneId = SceneId(11);

fn monitored_time() -> FlushTimeInfo {
    FlushTimeInfo::created_at(T0)
        .with_expiration(T0 + Duration::from_secs(60))
        .with_latency_limit(Duration::from_secs(5))
}

/// Nothing of `scene` is left anywhere in the renderer.
fn assert_no_trace(h: &Harness, scene: SceneId) {
    let renderer = &h.renderer;
    assert_eq!(renderer.scene_state(scene), SceneState::Unknown);
    assert!(!renderer.registry().has_scene(scene));
    assert_eq!(renderer.registry().buffer_of_scene(scene), None);
    assert!(!renderer.expiration_monitor().is_monitored(scene));
    assert!(!renderer.latency_monitor().is_monitored(scene));
    assert_eq!(renderer.lifecycle().known_scenes(), 0);
    for display in renderer.registry().display_ids() {
        let buffers = renderer.registry().display(display).map(|d| d.buffers.clone()).unwrap_or_default();
        for buffer in buffers {
            let record = renderer.registry().buffer(buffer).unwrap();
            assert!(record.assigned_scenes().iter().all(|a| a.scene != scene));
            assert_eq!(record.resume_cursor(scene), None);
        }
    }
}

#[test]
fn lifecycle_closure_after_full_bring_up() -> anyhow::Result<()> {
    let mut h = Harness::new(RendererConfig::default())?;
    h.bring_up(SCENE, 4, monitored_time())?;
    assert!(h.renderer.expiration_monitor().is_monitored(SCENE));

    h.renderer.destroy_scene(SCENE)?;
    h.tick();
    assert_no_trace(&h, SCENE);
    Ok(())
}

#[test]
fn lifecycle_closure_with_interrupted_pass() -> anyhow::Result<()> {
    let mut h = Harness::with_element_budget(2)?;
    let interruptible = h.offscreen(BufferKind::InterruptibleOffscreen)?;
    h.bring_up(SCENE, 8, monitored_time())?;
    h.renderer.assign_scene_to_buffer(SCENE, interruptible, 0)?;
    h.tick();
    assert!(h.renderer.registry().has_interrupted_rendering());
    assert!(h.renderer.registry().buffer(interruptible).unwrap().resume_cursor(SCENE).is_some());

    h.renderer.destroy_scene(SCENE)?;
    assert_no_trace(&h, SCENE);
    Ok(())
}

#[test]
fn lifecycle_closure_through_each_step_back() -> anyhow::Result<()> {
    let mut h = Harness::new(RendererConfig::default())?;
    h.bring_up(SCENE, 2, monitored_time())?;

    h.renderer.request_transition(SCENE, SceneTransition::Hide)?;
    h.renderer.request_transition(SCENE, SceneTransition::Unmap)?;
    h.renderer.request_transition(SCENE, SceneTransition::Unsubscribe)?;
    h.renderer.request_transition(SCENE, SceneTransition::Unpublish)?;
    assert_no_trace(&h, SCENE);
    Ok(())
}

#[test]
fn resubscribed_scene_draws_again() -> anyhow::Result<()> {
    let mut h = Harness::new(RendererConfig::default())?;
    let draw = h.bring_up(SCENE, 4, FlushTimeInfo::created_at(T0))?;

    h.renderer.request_transition(SCENE, SceneTransition::Hide)?;
    h.renderer.request_transition(SCENE, SceneTransition::Unmap)?;
    h.renderer.request_transition(SCENE, SceneTransition::Unsubscribe)?;
    h.tick();
    assert!(h.renderer.registry().scene(SCENE).is_some_and(|s| s.has_drawable()));
    assert_eq!(h.renderer.registry().scene(SCENE).and_then(|s| s.content.clone()), None);

    let passes = draw.completed_passes();
    h.subscribe(SCENE, FlushTimeInfo::created_at(T0))?;
    h.map(SCENE)?;
    h.show(SCENE)?;
    assert_eq!(draw.completed_passes(), passes + 1);

    h.flush(SCENE, 2, FlushTimeInfo::created_at(T0))?;
    h.tick();
    assert_eq!(draw.completed_passes(), passes + 2);
    Ok(())
}

#[test]
fn illegal_transitions_are_no_ops_with_one_failure_event() -> anyhow::Result<()> {
    let mut h = Harness::new(RendererConfig::default())?;
    h.publish(SCENE, 2)?;
    h.scene_kinds(SCENE);

    let illegal = [
        (SceneTransition::Show, SceneEventKind::ShowFailed),
        (SceneTransition::Hide, SceneEventKind::HideFailed),
        (SceneTransition::Unmap, SceneEventKind::UnmapFailed),
        (SceneTransition::Map(h.display), SceneEventKind::MapFailed),
        (SceneTransition::Unsubscribe, SceneEventKind::UnsubscribeFailed),
        (SceneTransition::Publish, SceneEventKind::PublishFailed),
    ];
    for (transition, failure) in illegal {
        let result = h.renderer.request_transition(SCENE, transition);
        assert!(result.is_err(), "{transition:?} accepted");
        assert_eq!(h.state(SCENE), SceneState::Published);
        assert_eq!(h.scene_kinds(SCENE), vec![failure], "{transition:?}");
    }
    assert_eq!(h.renderer.registry().buffer_of_scene(SCENE), None);
    Ok(())
}

#[test]
fn requests_for_unknown_scene_fail_without_creating_it() -> anyhow::Result<()> {
    let mut h = Harness::new(RendererConfig::default())?;
    assert!(h.renderer.request_transition(SCENE, SceneTransition::Subscribe).is_err());
    assert!(h.renderer.destroy_scene(SCENE).is_err());
    assert_eq!(
        h.scene_kinds(SCENE),
        vec![SceneEventKind::SubscribeFailed, SceneEventKind::UnpublishFailed]
    );
    assert_no_trace(&h, SCENE);
    Ok(())
}

#[test]
fn cascading_teardown_from_rendered_is_ordered() -> anyhow::Result<()> {
    let mut h = Harness::new(RendererConfig::default())?;
    h.bring_up(SCENE, 3, FlushTimeInfo::created_at(T0))?;
    h.scene_kinds(SCENE);

    h.renderer.submit_signal(LifecycleSignal::SceneUnpublished(SCENE));
    h.tick();
    assert_eq!(
        h.scene_kinds(SCENE),
        vec![
            SceneEventKind::HiddenIndirect,
            SceneEventKind::UnmappedIndirect,
            SceneEventKind::UnsubscribedIndirect,
            SceneEventKind::Unpublished,
        ]
    );
    Ok(())
}

#[test]
fn forced_unsubscribe_keeps_scene_published() -> anyhow::Result<()> {
    let mut h = Harness::new(RendererConfig::default())?;
    h.bring_up(SCENE, 3, monitored_time())?;
    h.scene_kinds(SCENE);

    h.renderer.request_transition(SCENE, SceneTransition::ForceUnsubscribe)?;
    assert_eq!(h.state(SCENE), SceneState::Published);
    assert_eq!(
        h.scene_kinds(SCENE),
        vec![
            SceneEventKind::HiddenIndirect,
            SceneEventKind::UnmappedIndirect,
            SceneEventKind::UnsubscribedIndirect,
        ]
    );
    assert!(h.renderer.registry().has_scene(SCENE));
    assert_eq!(h.renderer.registry().buffer_of_scene(SCENE), None);
    assert!(!h.renderer.latency_monitor().is_monitored(SCENE));

    // Content sent after teardown is dropped.
    h.flush(SCENE, 9, FlushTimeInfo::created_at(T0))?;
    assert!(!h.renderer.registry().has_pending_flushes(SCENE));
    Ok(())
}

#[test]
fn received_scene_without_request_is_declined_silently() -> anyhow::Result<()> {
    let mut h = Harness::new(RendererConfig::default())?;
    h.publish(SCENE, 1)?;
    h.scene_kinds(SCENE);

    h.renderer.submit_signal(LifecycleSignal::SceneReceived(SCENE));
    h.tick();
    assert_eq!(h.state(SCENE), SceneState::Published);
    assert!(h.scene_kinds(SCENE).is_empty());
    Ok(())
}
