//! SLA monitors.
//!
//! Expiration and latency monitoring share one edge-triggered tracker. A record
//! holds a reference timestamp for the last applied and the last rendered
//! content plus a limit; it is exceeded when any reference timestamp plus the
//! limit lies in the past. Expiration references are deadlines with a zero limit;
//! latency references are creation times with the configured limit.
//!
//! Events fire only when the exceeded flag flips.

use std::{collections::BTreeMap, marker::PhantomData, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    event::{EventCollector, SceneEventKind},
    ids::{SceneId, VersionTag},
    registry::ContentRegistry,
    time::{FlushTime, FlushTimeInfo},
};

/// What a monitor watches.
pub trait SlaKind {
    const LABEL: &'static str;
    const ENABLED: SceneEventKind;
    const DISABLED: SceneEventKind;
    const EXCEEDED: SceneEventKind;
    const RECOVERED: SceneEventKind;
    /// Whether a new record starts out as if its applied content was rendered.
    const SEED_RENDERED: bool;

    /// Reference timestamp of a flush that has not been applied yet.
    fn pending_reference(info: &FlushTimeInfo) -> FlushTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Expiration;

impl SlaKind for Expiration {
    const LABEL: &'static str = "expiration";
    const ENABLED: SceneEventKind = SceneEventKind::ExpirationMonitoringEnabled;
    const DISABLED: SceneEventKind = SceneEventKind::ExpirationMonitoringDisabled;
    const EXCEEDED: SceneEventKind = SceneEventKind::Expired;
    const RECOVERED: SceneEventKind = SceneEventKind::RecoveredFromExpiration;
    const SEED_RENDERED: bool = false;

    fn pending_reference(info: &FlushTimeInfo) -> FlushTime {
        info.expiration
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Latency;

impl SlaKind for Latency {
    const LABEL: &'static str = "latency";
    const ENABLED: SceneEventKind = SceneEventKind::LatencyMonitoringEnabled;
    const DISABLED: SceneEventKind = SceneEventKind::LatencyMonitoringDisabled;
    const EXCEEDED: SceneEventKind = SceneEventKind::LatencyExceeded;
    const RECOVERED: SceneEventKind = SceneEventKind::LatencyBackBelowLimit;
    const SEED_RENDERED: bool = true;

    fn pending_reference(info: &FlushTimeInfo) -> FlushTime {
        info.created
    }
}

/// Per-scene monitoring state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaRecord {
    pub applied: FlushTime,
    pub applied_version: VersionTag,
    pub rendered: FlushTime,
    pub rendered_version: VersionTag,
    pub limit: Duration,
    pub exceeded: bool,
}

impl SlaRecord {
    fn is_past(&self, reference: FlushTime, now: FlushTime) -> bool {
        reference.is_valid() && reference + self.limit < now
    }
}

/// Edge-triggered monitor over all scenes with an active record.
#[derive(Debug)]
pub struct SlaMonitor<K: SlaKind> {
    records: BTreeMap<SceneId, SlaRecord>,
    _kind: PhantomData<K>,
}

pub type ExpirationMonitor = SlaMonitor<Expiration>;
pub type LatencyMonitor = SlaMonitor<Latency>;

impl<K: SlaKind> Default for SlaMonitor<K> {
    fn default() -> Self {
        SlaMonitor {
            records: BTreeMap::new(),
            _kind: PhantomData,
        }
    }
}

impl<K: SlaKind> SlaMonitor<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records applied content. `limit == None` disables monitoring for the scene.
    fn apply(
        &mut self,
        scene: SceneId,
        reference: FlushTime,
        limit: Option<Duration>,
        version: VersionTag,
        events: &mut EventCollector,
    ) {
        let Some(limit) = limit else {
            if self.records.remove(&scene).is_some() {
                info!(scene = %scene, monitor = K::LABEL, "monitoring disabled");
                events.scene(scene, K::DISABLED);
            }
            return;
        };

        match self.records.get_mut(&scene) {
            Some(record) => {
                record.applied = reference;
                record.applied_version = version;
                record.limit = limit;
            }
            None => {
                let (rendered, rendered_version) = if K::SEED_RENDERED {
                    (reference, version)
                } else {
                    (FlushTime::INVALID, VersionTag::INVALID)
                };
                self.records.insert(
                    scene,
                    SlaRecord {
                        applied: reference,
                        applied_version: version,
                        rendered,
                        rendered_version,
                        limit,
                        exceeded: false,
                    },
                );
                info!(scene = %scene, monitor = K::LABEL, ?limit, "monitoring enabled");
                events.scene(scene, K::ENABLED);
            }
        }
    }

    /// The last applied content was drawn.
    pub fn on_rendered(&mut self, scene: SceneId) {
        if let Some(record) = self.records.get_mut(&scene) {
            record.rendered = record.applied;
            record.rendered_version = record.applied_version;
        }
    }

    /// Drops a record without an event (scene destroyed).
    pub fn stop_monitoring(&mut self, scene: SceneId) {
        if self.records.remove(&scene).is_some() {
            debug!(scene = %scene, monitor = K::LABEL, "monitoring stopped");
        }
    }

    pub fn is_monitored(&self, scene: SceneId) -> bool {
        self.records.contains_key(&scene)
    }

    pub fn is_exceeded(&self, scene: SceneId) -> bool {
        self.records.get(&scene).is_some_and(|r| r.exceeded)
    }

    pub fn record(&self, scene: SceneId) -> Option<&SlaRecord> {
        self.records.get(&scene)
    }

    /// Reference timestamp of the rendered content, invalid when unmonitored.
    pub fn rendered_timestamp(&self, scene: SceneId) -> FlushTime {
        self.records.get(&scene).map_or(FlushTime::INVALID, |r| r.rendered)
    }

    /// Re-evaluates every record against `now`.
    ///
    /// An invalid `now` marks every record as exceeded.
    pub fn check_at_time(&mut self, now: FlushTime, registry: &ContentRegistry, events: &mut EventCollector) {
        for (scene, record) in self.records.iter_mut() {
            let pending_past = || {
                registry.scene(*scene).is_some_and(|s| {
                    s.pending_flushes()
                        .any(|f| record.is_past(K::pending_reference(&f.time), now))
                })
            };
            let exceeded = !now.is_valid()
                || record.is_past(record.rendered, now)
                || record.is_past(record.applied, now)
                || pending_past();

            match (record.exceeded, exceeded) {
                (false, true) => {
                    warn!(scene = %scene, monitor = K::LABEL, now = %now, "limit exceeded");
                    events.scene(*scene, K::EXCEEDED);
                }
                (true, false) => {
                    info!(scene = %scene, monitor = K::LABEL, now = %now, "back within limit");
                    events.scene(*scene, K::RECOVERED);
                }
                _ => {}
            }
            record.exceeded = exceeded;
        }
    }
}

impl SlaMonitor<Expiration> {
    /// Content with `deadline` was applied; an invalid deadline disables monitoring.
    pub fn on_content_applied(
        &mut self,
        scene: SceneId,
        deadline: FlushTime,
        version: VersionTag,
        events: &mut EventCollector,
    ) {
        let limit = deadline.is_valid().then_some(Duration::ZERO);
        self.apply(scene, deadline, limit, version, events);
    }

    /// The scene is no longer visible; its rendered content cannot expire.
    pub fn on_hidden(&mut self, scene: SceneId) {
        if let Some(record) = self.records.get_mut(&scene) {
            record.rendered = FlushTime::INVALID;
            record.rendered_version = VersionTag::INVALID;
        }
    }
}

impl SlaMonitor<Latency> {
    /// Content created at `created` was applied; a missing or zero limit disables monitoring.
    pub fn on_content_applied(
        &mut self,
        scene: SceneId,
        created: FlushTime,
        limit: Option<Duration>,
        version: VersionTag,
        events: &mut EventCollector,
    ) {
        let limit = limit.filter(|l| !l.is_zero());
        self.apply(scene, created, limit, version, events);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{event::SceneEvent, registry::PendingFlush};

    const S1: SceneId = SceneId(22);
    const S2: SceneId = SceneId(23);
    const T0: FlushTime = FlushTime::from_millis(10_000);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn drained(events: &mut EventCollector) -> Vec<(SceneId, SceneEventKind)> {
        events.drain::<SceneEvent>().into_iter().map(|e| (e.scene, e.kind)).collect()
    }

    fn registry() -> ContentRegistry {
        let mut registry = ContentRegistry::new();
        registry.create_scene(S1).unwrap();
        registry.create_scene(S2).unwrap();
        registry
    }

    // =============================================================================
    // SLA-001: Expiration
    // =============================================================================

    #[test]
    fn sla_001_unmonitored_scene_reports_invalid_timestamp() {
        let monitor = ExpirationMonitor::new();
        assert_eq!(monitor.rendered_timestamp(S1), FlushTime::INVALID);
    }

    #[test]
    fn sla_001_no_event_for_invalid_deadline_without_record() {
        let registry = registry();
        let mut events = EventCollector::new();
        let mut monitor = ExpirationMonitor::new();
        monitor.on_content_applied(S1, FlushTime::INVALID, VersionTag::new(1), &mut events);
        monitor.check_at_time(T0, &registry, &mut events);
        assert!(drained(&mut events).is_empty());
        assert!(!monitor.is_monitored(S1));
    }

    #[test]
    fn sla_001_applied_deadline_becomes_rendered_on_render() {
        let mut events = EventCollector::new();
        let mut monitor = ExpirationMonitor::new();
        monitor.on_content_applied(S1, T0, VersionTag::new(1), &mut events);
        monitor.on_content_applied(S1, T0 + Duration::from_secs(3600), VersionTag::new(2), &mut events);
        assert_eq!(drained(&mut events), vec![(S1, SceneEventKind::ExpirationMonitoringEnabled)]);
        assert_eq!(monitor.rendered_timestamp(S1), FlushTime::INVALID);

        monitor.on_rendered(S1);
        assert_eq!(monitor.rendered_timestamp(S1), T0 + Duration::from_secs(3600));
        assert_eq!(monitor.record(S1).unwrap().rendered_version, VersionTag::new(2));

        monitor.on_hidden(S1);
        assert_eq!(monitor.rendered_timestamp(S1), FlushTime::INVALID);
        monitor.on_rendered(S1);
        assert_eq!(monitor.rendered_timestamp(S1), T0 + Duration::from_secs(3600));
    }

    #[test]
    fn sla_001_expires_once_and_recovers_once() {
        let registry = registry();
        let mut events = EventCollector::new();
        let mut monitor = ExpirationMonitor::new();
        monitor.on_content_applied(S1, T0 + ms(1), VersionTag::new(1), &mut events);
        monitor.on_rendered(S1);
        drained(&mut events);

        monitor.check_at_time(T0, &registry, &mut events);
        assert!(drained(&mut events).is_empty());

        monitor.check_at_time(T0 + ms(2), &registry, &mut events);
        assert_eq!(drained(&mut events), vec![(S1, SceneEventKind::Expired)]);
        monitor.check_at_time(T0 + ms(3), &registry, &mut events);
        assert!(drained(&mut events).is_empty());

        monitor.on_content_applied(S1, T0 + ms(100), VersionTag::new(2), &mut events);
        monitor.on_rendered(S1);
        monitor.check_at_time(T0 + ms(3), &registry, &mut events);
        assert_eq!(drained(&mut events), vec![(S1, SceneEventKind::RecoveredFromExpiration)]);
    }

    #[test]
    fn sla_001_hidden_scene_does_not_expire_from_rendered_content() {
        let registry = registry();
        let mut events = EventCollector::new();
        let mut monitor = ExpirationMonitor::new();
        monitor.on_content_applied(S1, T0 + ms(1), VersionTag::new(1), &mut events);
        monitor.on_rendered(S1);
        monitor.on_content_applied(S1, T0 + ms(50), VersionTag::new(2), &mut events);
        monitor.on_hidden(S1);
        drained(&mut events);

        monitor.check_at_time(T0 + ms(10), &registry, &mut events);
        assert!(drained(&mut events).is_empty());
    }

    #[test]
    fn sla_001_pending_flush_deadline_counts() {
        let mut registry = registry();
        let mut events = EventCollector::new();
        let mut monitor = ExpirationMonitor::new();
        monitor.on_content_applied(S1, T0 + ms(100), VersionTag::new(1), &mut events);
        monitor.on_rendered(S1);
        registry
            .enqueue_flush(
                S1,
                PendingFlush {
                    version: VersionTag::new(2),
                    time: FlushTimeInfo::created_at(T0).with_expiration(T0 + ms(5)),
                    payload: Bytes::new(),
                },
            )
            .unwrap();
        drained(&mut events);

        monitor.check_at_time(T0 + ms(10), &registry, &mut events);
        assert_eq!(drained(&mut events), vec![(S1, SceneEventKind::Expired)]);
    }

    #[test]
    fn sla_001_invalid_clock_forces_every_record_exceeded() {
        let registry = registry();
        let mut events = EventCollector::new();
        let mut monitor = ExpirationMonitor::new();
        monitor.on_content_applied(S1, T0 + Duration::from_secs(3600), VersionTag::new(1), &mut events);
        monitor.on_content_applied(S2, T0 + Duration::from_secs(3600), VersionTag::new(1), &mut events);
        drained(&mut events);

        monitor.check_at_time(FlushTime::INVALID, &registry, &mut events);
        assert_eq!(
            drained(&mut events),
            vec![(S1, SceneEventKind::Expired), (S2, SceneEventKind::Expired)]
        );
        monitor.check_at_time(T0, &registry, &mut events);
        assert_eq!(
            drained(&mut events),
            vec![
                (S1, SceneEventKind::RecoveredFromExpiration),
                (S2, SceneEventKind::RecoveredFromExpiration)
            ]
        );
    }

    // =============================================================================
    // SLA-002: Monitoring lifecycle
    // =============================================================================

    #[test]
    fn sla_002_invalid_deadline_disables_and_resets_query() {
        let registry = registry();
        let mut events = EventCollector::new();
        let mut monitor = ExpirationMonitor::new();
        monitor.on_content_applied(S1, T0, VersionTag::new(1), &mut events);
        monitor.on_rendered(S1);
        monitor.on_content_applied(S1, FlushTime::INVALID, VersionTag::new(2), &mut events);
        assert_eq!(
            drained(&mut events),
            vec![
                (S1, SceneEventKind::ExpirationMonitoringEnabled),
                (S1, SceneEventKind::ExpirationMonitoringDisabled)
            ]
        );
        assert_eq!(monitor.rendered_timestamp(S1), FlushTime::INVALID);

        monitor.check_at_time(T0 + Duration::from_secs(10), &registry, &mut events);
        assert!(drained(&mut events).is_empty());
    }

    #[test]
    fn sla_002_stop_monitoring_is_silent() {
        let mut events = EventCollector::new();
        let mut monitor = LatencyMonitor::new();
        monitor.on_content_applied(S1, T0, Some(ms(5)), VersionTag::new(1), &mut events);
        drained(&mut events);
        monitor.stop_monitoring(S1);
        assert!(!monitor.is_monitored(S1));
        assert!(drained(&mut events).is_empty());
    }

    // =============================================================================
    // SLA-003: Latency
    // =============================================================================

    #[test]
    fn sla_003_edge_scenario() {
        let registry = registry();
        let mut events = EventCollector::new();
        let mut monitor = LatencyMonitor::new();
        monitor.on_content_applied(S1, T0, Some(ms(1)), VersionTag::new(1), &mut events);
        monitor.on_rendered(S1);
        assert_eq!(drained(&mut events), vec![(S1, SceneEventKind::LatencyMonitoringEnabled)]);

        monitor.check_at_time(T0 + ms(2), &registry, &mut events);
        assert_eq!(drained(&mut events), vec![(S1, SceneEventKind::LatencyExceeded)]);

        monitor.check_at_time(T0 + ms(3), &registry, &mut events);
        assert!(drained(&mut events).is_empty());

        monitor.on_content_applied(S1, T0, Some(ms(10_000)), VersionTag::new(2), &mut events);
        monitor.on_rendered(S1);
        monitor.check_at_time(T0 + ms(3), &registry, &mut events);
        assert_eq!(drained(&mut events), vec![(S1, SceneEventKind::LatencyBackBelowLimit)]);
    }

    #[test]
    fn sla_003_zero_limit_disables() {
        let mut events = EventCollector::new();
        let mut monitor = LatencyMonitor::new();
        monitor.on_content_applied(S1, T0, Some(ms(0)), VersionTag::new(1), &mut events);
        assert!(!monitor.is_monitored(S1));

        monitor.on_content_applied(S1, T0, Some(ms(3)), VersionTag::new(1), &mut events);
        monitor.on_content_applied(S1, T0, None, VersionTag::new(2), &mut events);
        assert_eq!(
            drained(&mut events),
            vec![
                (S1, SceneEventKind::LatencyMonitoringEnabled),
                (S1, SceneEventKind::LatencyMonitoringDisabled)
            ]
        );
    }

    #[test]
    fn sla_003_new_record_counts_as_rendered() {
        let monitor = {
            let mut events = EventCollector::new();
            let mut monitor = LatencyMonitor::new();
            monitor.on_content_applied(S1, T0, Some(ms(5)), VersionTag::new(1), &mut events);
            monitor
        };
        assert_eq!(monitor.rendered_timestamp(S1), T0);
    }

    #[test]
    fn sla_003_stale_pending_flush_exceeds_latency() {
        let mut registry = registry();
        let mut events = EventCollector::new();
        let mut monitor = LatencyMonitor::new();
        monitor.on_content_applied(S1, T0 + ms(20), Some(ms(10)), VersionTag::new(1), &mut events);
        registry
            .enqueue_flush(
                S1,
                PendingFlush {
                    version: VersionTag::new(2),
                    time: FlushTimeInfo::created_at(T0).with_latency_limit(ms(10)),
                    payload: Bytes::new(),
                },
            )
            .unwrap();
        drained(&mut events);

        monitor.check_at_time(T0 + ms(15), &registry, &mut events);
        assert_eq!(drained(&mut events), vec![(S1, SceneEventKind::LatencyExceeded)]);
    }
}
