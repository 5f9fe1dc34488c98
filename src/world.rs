use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::base::{BaseServices, MilitaryBase};
use crate::capture::{FrameOutcome, SeizingZone, ZoneContext};
use crate::clock::ServerTimestamp;
use crate::config::{ConfigError, MajorityCaptureSettings, ServerSettings};
use crate::faction::FactionRegistry;
use crate::replication::{ReplicationMessage, TransitionNotifier};
use crate::types::{EntityId, FactionIndex, Occupant, SeizedZone, ZoneView};

pub trait OccupancyQuery {
    fn entities_inside(&mut self, zone: &str, now: ServerTimestamp) -> Vec<Occupant>;

    fn despawn(&mut self, entity: EntityId);

    // Paused zones are only queried again once this reports a change.
    fn has_pending_changes(&mut self, zone: &str, now: ServerTimestamp) -> bool;
}

#[derive(Debug, Error)]
pub enum WorldError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unknown zone {0}")]
    UnknownZone(String),
    #[error("unknown faction {0}")]
    UnknownFaction(String),
    #[error("unknown base {0}")]
    UnknownBase(String),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickReport {
    pub queried: usize,
    pub skipped: usize,
    pub despawned: Vec<EntityId>,
    pub seized: Vec<SeizedZone>,
}

pub struct CaptureWorld {
    settings: MajorityCaptureSettings,
    factions: FactionRegistry,
    bases: HashMap<String, MilitaryBase>,
    zones: Vec<SeizingZone>,
    notifier: TransitionNotifier,
}

impl CaptureWorld {
    pub fn from_settings(settings: &ServerSettings) -> Result<Self, WorldError> {
        settings.validate()?;

        let factions = FactionRegistry::new(settings.factions.clone());
        let bases = settings
            .bases
            .iter()
            .map(|config| (config.id.clone(), MilitaryBase::from_config(config)))
            .collect::<HashMap<_, _>>();

        let mut notifier = TransitionNotifier::new();
        let mut zones = Vec::with_capacity(settings.zones.len());
        for config in &settings.zones {
            let controller = match config.controller.as_deref() {
                Some(key) => Some(
                    factions
                        .index_of(key)
                        .ok_or_else(|| WorldError::UnknownFaction(key.to_string()))?,
                ),
                None => None,
            };
            let mut zone = SeizingZone::new(config, controller, &settings.majority_capture);
            zone.publish(&mut notifier);
            zones.push(zone);
        }

        info!(
            zones = zones.len(),
            factions = factions.len(),
            bases = bases.len(),
            enabled = settings.majority_capture.enabled,
            "capture world ready"
        );

        Ok(Self {
            settings: settings.majority_capture.clone(),
            factions,
            bases,
            zones,
            notifier,
        })
    }

    pub fn settings(&self) -> &MajorityCaptureSettings {
        &self.settings
    }

    pub fn factions(&self) -> &FactionRegistry {
        &self.factions
    }

    pub fn notifier(&self) -> &TransitionNotifier {
        &self.notifier
    }

    pub fn zones(&self) -> impl Iterator<Item = &SeizingZone> {
        self.zones.iter()
    }

    pub fn zone(&self, name: &str) -> Option<&SeizingZone> {
        self.zones.iter().find(|zone| zone.name() == name)
    }

    pub fn zone_views(&self) -> Vec<ZoneView> {
        self.zones.iter().map(SeizingZone::view).collect()
    }

    pub fn base_mut(&mut self, id: &str) -> Option<&mut MilitaryBase> {
        self.bases.get_mut(id)
    }

    pub fn subscribe(&mut self, capacity: usize) -> (u64, mpsc::Receiver<ReplicationMessage>) {
        self.notifier.subscribe(capacity)
    }

    pub fn unsubscribe(&mut self, id: u64) -> bool {
        self.notifier.unsubscribe(id)
    }

    pub fn tick(&mut self, now: ServerTimestamp, occupancy: &mut dyn OccupancyQuery) -> TickReport {
        let mut report = TickReport::default();
        let Self {
            factions,
            bases,
            zones,
            notifier,
            ..
        } = self;

        for zone in zones.iter_mut() {
            if zone.is_paused() && occupancy.has_pending_changes(zone.name(), now) {
                debug!(zone = zone.name(), "occupancy changed, waking paused zone");
                zone.request_evaluation();
            }

            let base = zone
                .base_id()
                .and_then(|id| bases.get(id))
                .map(|base| base as &dyn BaseServices);
            let mut ctx = ZoneContext {
                now,
                factions: &*factions,
                base,
                notifier: &mut *notifier,
            };

            match zone.frame(&mut ctx) {
                FrameOutcome::Skipped => report.skipped += 1,
                FrameOutcome::Idle => {}
                FrameOutcome::QueryDue => {
                    let occupants = occupancy.entities_inside(zone.name(), now);
                    for entity in zone.on_query_finished(&occupants, &mut ctx) {
                        occupancy.despawn(entity);
                        report.despawned.push(entity);
                    }
                    report.queried += 1;
                }
                FrameOutcome::Seized(seized) => report.seized.push(seized),
            }
        }

        report
    }

    pub fn set_zone_controller(
        &mut self,
        zone_name: &str,
        faction_key: Option<&str>,
        now: ServerTimestamp,
    ) -> Result<(), WorldError> {
        let controller = self.resolve_faction(faction_key)?;
        let zone = self
            .zones
            .iter_mut()
            .find(|zone| zone.name() == zone_name)
            .ok_or_else(|| WorldError::UnknownZone(zone_name.to_string()))?;
        let base = zone
            .base_id()
            .and_then(|id| self.bases.get(id))
            .map(|base| base as &dyn BaseServices);
        let mut ctx = ZoneContext {
            now,
            factions: &self.factions,
            base,
            notifier: &mut self.notifier,
        };
        zone.set_controller(controller, &mut ctx);
        Ok(())
    }

    pub fn wake_zone(&mut self, zone_name: &str) -> Result<(), WorldError> {
        let zone = self
            .zones
            .iter_mut()
            .find(|zone| zone.name() == zone_name)
            .ok_or_else(|| WorldError::UnknownZone(zone_name.to_string()))?;
        zone.request_evaluation();
        Ok(())
    }

    fn resolve_faction(&self, key: Option<&str>) -> Result<Option<FactionIndex>, WorldError> {
        match key {
            None => Ok(None),
            Some(key) => self
                .factions
                .index_of(key)
                .map(Some)
                .ok_or_else(|| WorldError::UnknownFaction(key.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::types::{TimerPhase, TransitionKind};

    const US: FactionIndex = FactionIndex(0);
    const USSR: FactionIndex = FactionIndex(1);

    #[derive(Default)]
    struct StubOccupancy {
        inside: HashMap<String, Vec<Occupant>>,
        pending: HashSet<String>,
        despawned: Vec<EntityId>,
        queries: usize,
    }

    impl StubOccupancy {
        fn fill(&mut self, zone: &str, groups: &[(FactionIndex, u64)]) {
            let mut occupants = Vec::new();
            let mut next = 0;
            for (faction, count) in groups {
                for _ in 0..*count {
                    next += 1;
                    occupants.push(Occupant::soldier(EntityId(next), *faction));
                }
            }
            self.inside.insert(zone.to_string(), occupants);
            self.pending.insert(zone.to_string());
        }
    }

    impl OccupancyQuery for StubOccupancy {
        fn entities_inside(&mut self, zone: &str, _now: ServerTimestamp) -> Vec<Occupant> {
            self.queries += 1;
            self.pending.remove(zone);
            self.inside.get(zone).cloned().unwrap_or_default()
        }

        fn despawn(&mut self, entity: EntityId) {
            self.despawned.push(entity);
            for occupants in self.inside.values_mut() {
                occupants.retain(|occupant| occupant.entity != entity);
            }
        }

        fn has_pending_changes(&mut self, zone: &str, _now: ServerTimestamp) -> bool {
            self.pending.contains(zone)
        }
    }

    fn at(ms: u64) -> ServerTimestamp {
        ServerTimestamp::from_millis(ms)
    }

    fn quick_settings() -> ServerSettings {
        let mut settings = ServerSettings::default();
        settings.majority_capture.majority_debounce_seconds = 0.0;
        settings
    }

    #[test]
    fn builds_zones_from_default_settings() {
        let world = CaptureWorld::from_settings(&ServerSettings::default())
            .expect("default settings should build");
        let views = world.zone_views();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].controller, Some(US));
        assert_eq!(views[0].revision, 1);
        assert_eq!(
            world.zone("levie").map(SeizingZone::evaluator_name),
            Some("majority")
        );
        assert!(world.notifier().local().zone("morton").is_some());
    }

    #[test]
    fn disabled_feature_uses_default_evaluator() {
        let mut settings = ServerSettings::default();
        settings.majority_capture.enabled = false;
        let world = CaptureWorld::from_settings(&settings).expect("settings should build");
        assert!(world.zones().all(|zone| zone.evaluator_name() == "default"));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut settings = ServerSettings::default();
        settings.zones[0].controller = Some("NATO".to_string());
        assert!(matches!(
            CaptureWorld::from_settings(&settings),
            Err(WorldError::Config(_))
        ));
    }

    #[test]
    fn sustained_attack_seizes_zone_once() {
        let mut world =
            CaptureWorld::from_settings(&ServerSettings::default()).expect("settings should build");
        let mut occupancy = StubOccupancy::default();
        occupancy.fill("levie", &[(USSR, 5)]);

        let mut seized = Vec::new();
        for tick in 0..4_000u64 {
            let report = world.tick(at(1 + tick * 50), &mut occupancy);
            seized.extend(report.seized);
        }

        assert_eq!(seized.len(), 1);
        assert_eq!(seized[0].zone, "levie");
        assert_eq!(seized[0].faction, USSR);
        // 5 seizers with two services and one US radio: 1.25 * (180 - 480/7) s
        assert_eq!(seized[0].at_ms, at(140_301));
        assert_eq!(world.zone("levie").and_then(SeizingZone::controller), Some(USSR));

        let replica = world.notifier().local().zone("levie").expect("zone should be tracked");
        assert_eq!(replica.starts_observed, 1);
        assert_eq!(replica.interrupts_observed, 0);
    }

    #[test]
    fn paused_zone_wakes_on_occupancy_change() {
        let mut world =
            CaptureWorld::from_settings(&quick_settings()).expect("settings should build");
        let mut occupancy = StubOccupancy::default();

        occupancy.fill("levie", &[(USSR, 5)]);
        world.tick(at(1), &mut occupancy);
        occupancy.fill("levie", &[(USSR, 5), (US, 3)]);
        world.tick(at(251), &mut occupancy);
        assert!(world.zone("levie").is_some_and(SeizingZone::is_paused));

        let queries = occupancy.queries;
        let report = world.tick(at(600), &mut occupancy);
        assert_eq!(report.skipped, 1);
        assert_eq!(occupancy.queries, queries + 1);

        occupancy.fill("levie", &[(USSR, 6)]);
        let report = world.tick(at(650), &mut occupancy);
        assert_eq!(report.skipped, 0);
        let view = world.zone("levie").map(SeizingZone::view).expect("zone should exist");
        assert_eq!(view.phase, TimerPhase::Running);
    }

    struct SnapshotOccupancy {
        inside: Vec<Occupant>,
    }

    impl SnapshotOccupancy {
        fn set(&mut self, groups: &[(FactionIndex, u64)]) {
            self.inside.clear();
            for (faction, count) in groups {
                for _ in 0..*count {
                    let entity = EntityId(self.inside.len() as u64 + 1);
                    self.inside.push(Occupant::soldier(entity, *faction));
                }
            }
        }
    }

    impl OccupancyQuery for SnapshotOccupancy {
        fn entities_inside(&mut self, zone: &str, _now: ServerTimestamp) -> Vec<Occupant> {
            if zone == "levie" {
                self.inside.clone()
            } else {
                Vec::new()
            }
        }

        fn despawn(&mut self, _entity: EntityId) {}

        fn has_pending_changes(&mut self, _zone: &str, _now: ServerTimestamp) -> bool {
            true
        }
    }

    #[test]
    fn untracked_occupancy_never_leaves_a_capture_paused() {
        let mut world =
            CaptureWorld::from_settings(&quick_settings()).expect("settings should build");
        let mut occupancy = SnapshotOccupancy { inside: Vec::new() };

        occupancy.set(&[(USSR, 5)]);
        world.tick(at(1), &mut occupancy);
        occupancy.set(&[(USSR, 5), (US, 3)]);
        world.tick(at(251), &mut occupancy);
        assert!(world.zone("levie").is_some_and(SeizingZone::is_paused));

        occupancy.set(&[(USSR, 8)]);
        let report = world.tick(at(301), &mut occupancy);
        assert_eq!(report.skipped, 0);
        let view = world.zone("levie").map(SeizingZone::view).expect("zone should exist");
        assert_eq!(view.phase, TimerPhase::Running);
        assert_eq!(view.seizing, 8);
    }

    #[test]
    fn disabled_ai_is_despawned_through_the_query() {
        let mut world =
            CaptureWorld::from_settings(&ServerSettings::default()).expect("settings should build");
        let mut occupancy = StubOccupancy::default();
        occupancy.inside.insert(
            "morton".to_string(),
            vec![Occupant {
                entity: EntityId(42),
                faction: Some(US),
                alive: true,
                disabled_ai: true,
            }],
        );
        let report = world.tick(at(1), &mut occupancy);
        assert_eq!(report.despawned, vec![EntityId(42)]);
        assert_eq!(occupancy.despawned, vec![EntityId(42)]);
    }

    #[test]
    fn controller_change_reaches_subscribers() {
        let mut world =
            CaptureWorld::from_settings(&quick_settings()).expect("settings should build");
        let (_, mut rx) = world.subscribe(32);
        let mut occupancy = StubOccupancy::default();
        occupancy.fill("levie", &[(USSR, 5)]);
        world.tick(at(1), &mut occupancy);

        world
            .set_zone_controller("levie", Some("USSR"), at(100))
            .expect("zone and faction should exist");

        let mut kinds = Vec::new();
        let mut last_view = None;
        while let Ok(message) = rx.try_recv() {
            match message {
                ReplicationMessage::Transition { event } => kinds.push(event.kind),
                ReplicationMessage::ZoneSync { zone } => last_view = Some(zone),
            }
        }
        assert_eq!(kinds, vec![TransitionKind::Start, TransitionKind::Interrupt]);
        let last_view = last_view.expect("a sync should follow the interrupt");
        assert_eq!(last_view.controller, Some(USSR));
        assert_eq!(last_view.phase, TimerPhase::Paused);
    }

    #[test]
    fn unknown_zone_and_faction_are_errors() {
        let mut world =
            CaptureWorld::from_settings(&ServerSettings::default()).expect("settings should build");
        assert!(matches!(
            world.wake_zone("nowhere"),
            Err(WorldError::UnknownZone(_))
        ));
        assert!(matches!(
            world.set_zone_controller("levie", Some("NATO"), at(1)),
            Err(WorldError::UnknownFaction(_))
        ));
        assert!(world.set_zone_controller("levie", None, at(1)).is_ok());
    }
}
