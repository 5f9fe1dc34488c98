pub mod debounce;
pub mod evaluator;
pub mod tally;
pub mod timer;

use tracing::info;

use crate::base::BaseServices;
use crate::clock::{seconds_to_millis, ServerTimestamp};
use crate::config::{MajorityCaptureSettings, SeizingLimits, ZoneConfig};
use crate::faction::FactionRegistry;
use crate::replication::TransitionNotifier;
use crate::types::{EntityId, FactionIndex, Occupant, SeizedZone, TallyResult, ZoneView};

use evaluator::{select_evaluator, OccupancyEvaluator};
use tally::{tally_occupants, TallyRules};
use timer::CaptureTimer;

pub struct ZoneContext<'a> {
    pub now: ServerTimestamp,
    pub factions: &'a FactionRegistry,
    pub base: Option<&'a dyn BaseServices>,
    pub notifier: &'a mut TransitionNotifier,
}

#[derive(Clone, Debug)]
pub struct ZoneState {
    pub name: String,
    pub controller: Option<FactionIndex>,
    pub tally: TallyResult,
    pub timer: CaptureTimer,
    pub limits: SeizingLimits,
    revision: u64,
    dirty: bool,
}

impl ZoneState {
    pub fn new(name: &str, controller: Option<FactionIndex>, limits: SeizingLimits) -> Self {
        Self {
            name: name.to_string(),
            controller,
            tally: TallyResult::NONE,
            timer: CaptureTimer::default(),
            limits,
            revision: 0,
            dirty: true,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn take_dirty(&mut self) -> bool {
        if !self.dirty {
            return false;
        }
        self.dirty = false;
        self.revision += 1;
        true
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn view(&self) -> ZoneView {
        ZoneView {
            zone: self.name.clone(),
            revision: self.revision,
            controller: self.controller,
            prevailing: self.tally.prevailing,
            seizing: self.tally.seizing,
            capturing_faction: self.timer.capturing(),
            start_ms: self.timer.start_timestamp(),
            end_ms: self.timer.end_timestamp(),
            phase: self.timer.phase(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FrameOutcome {
    Skipped,
    Idle,
    QueryDue,
    Seized(SeizedZone),
}

pub struct SeizingZone {
    state: ZoneState,
    base_id: Option<String>,
    rules: TallyRules,
    evaluator: Box<dyn OccupancyEvaluator>,
    query_interval_ms: u64,
    next_query_at: ServerTimestamp,
    wake_requested: bool,
}

impl SeizingZone {
    pub fn new(
        config: &ZoneConfig,
        controller: Option<FactionIndex>,
        settings: &MajorityCaptureSettings,
    ) -> Self {
        let evaluator = select_evaluator(settings);
        if settings.enabled {
            info!(zone = %config.name, "majority capture initialized");
        } else {
            info!(zone = %config.name, "majority capture disabled in config, using default capture");
        }
        Self::with_evaluator(config, controller, evaluator)
    }

    pub fn with_evaluator(
        config: &ZoneConfig,
        controller: Option<FactionIndex>,
        evaluator: Box<dyn OccupancyEvaluator>,
    ) -> Self {
        Self {
            state: ZoneState::new(&config.name, controller, config.limits.clone()),
            base_id: config.base.clone(),
            rules: TallyRules {
                ignore_non_playable_attackers: config.ignore_non_playable_attackers,
                ignore_non_playable_defenders: config.ignore_non_playable_defenders,
                max_seizing_characters: config.limits.max_seizing_characters,
            },
            evaluator,
            query_interval_ms: seconds_to_millis(config.query_interval_seconds),
            next_query_at: ServerTimestamp::ZERO,
            wake_requested: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn base_id(&self) -> Option<&str> {
        self.base_id.as_deref()
    }

    pub fn controller(&self) -> Option<FactionIndex> {
        self.state.controller
    }

    pub fn state(&self) -> &ZoneState {
        &self.state
    }

    pub fn evaluator_name(&self) -> &'static str {
        self.evaluator.name()
    }

    pub fn view(&self) -> ZoneView {
        self.state.view()
    }

    pub fn is_paused(&self) -> bool {
        self.state.timer.is_paused()
    }

    pub fn request_evaluation(&mut self) {
        self.wake_requested = true;
    }

    pub fn frame(&mut self, ctx: &mut ZoneContext<'_>) -> FrameOutcome {
        if !self.wake_requested && self.evaluator.skips_frame(&self.state) {
            return FrameOutcome::Skipped;
        }

        if self.state.timer.is_complete(ctx.now) {
            if let Some(seized) = self.complete(ctx) {
                return FrameOutcome::Seized(seized);
            }
        }

        if self.wake_requested || ctx.now >= self.next_query_at {
            self.wake_requested = false;
            self.next_query_at = ctx.now.plus_millis(self.query_interval_ms);
            return FrameOutcome::QueryDue;
        }
        FrameOutcome::Idle
    }

    pub fn on_query_finished(
        &mut self,
        occupants: &[Occupant],
        ctx: &mut ZoneContext<'_>,
    ) -> Vec<EntityId> {
        let tally = tally_occupants(occupants, ctx.factions, self.rules);
        let previous = self.state.tally;
        let changed = previous != tally.result;
        if changed {
            info!(
                zone = %self.state.name,
                from = ctx.factions.display_key(previous.prevailing),
                to = ctx.factions.display_key(tally.result.prevailing),
                seizers_from = previous.seizing,
                seizers_to = tally.result.seizing,
                "occupancy state changed"
            );
            self.state.mark_dirty();
        }
        self.state.tally = tally.result;

        self.evaluator.on_tally(&mut self.state, changed, ctx);
        self.publish(ctx.notifier);
        tally.despawn
    }

    pub fn set_controller(&mut self, controller: Option<FactionIndex>, ctx: &mut ZoneContext<'_>) {
        if self.state.controller == controller {
            return;
        }
        info!(
            zone = %self.state.name,
            from = ctx.factions.display_key(self.state.controller),
            to = ctx.factions.display_key(controller),
            "controller changed"
        );
        self.state.controller = controller;
        self.state.mark_dirty();
        self.evaluator.refresh_timer(&mut self.state, ctx);
        self.publish(ctx.notifier);
    }

    pub fn publish(&mut self, notifier: &mut TransitionNotifier) {
        if self.state.take_dirty() {
            notifier.sync_zone(self.state.view());
        }
    }

    fn complete(&mut self, ctx: &mut ZoneContext<'_>) -> Option<SeizedZone> {
        let faction = self.state.timer.capturing()?;
        let previous_controller = self.state.controller;
        info!(
            zone = %self.state.name,
            from = ctx.factions.display_key(previous_controller),
            to = ctx.factions.display_key(Some(faction)),
            "zone seized"
        );
        self.state.controller = Some(faction);
        self.state.timer.reset();
        self.state.mark_dirty();
        self.evaluator.on_capture_finished();
        self.publish(ctx.notifier);
        Some(SeizedZone {
            zone: self.state.name.clone(),
            faction,
            previous_controller,
            at_ms: ctx.now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::MilitaryBase;
    use crate::faction::Faction;
    use crate::replication::ReplicationMessage;
    use crate::types::{TimerPhase, TransitionKind};

    const US: FactionIndex = FactionIndex(0);
    const USSR: FactionIndex = FactionIndex(1);

    fn at(ms: u64) -> ServerTimestamp {
        ServerTimestamp::from_millis(ms)
    }

    fn zone_config() -> ZoneConfig {
        ZoneConfig {
            limits: SeizingLimits {
                min_seizing_time: 10.0,
                max_seizing_time: 40.0,
                max_seizing_characters: 8,
                extra_time_per_service: 0.0,
                extra_time_per_radio_connection: 0.0,
            },
            query_interval_seconds: 0.25,
            ..ZoneConfig::named("levie")
        }
    }

    fn settings() -> MajorityCaptureSettings {
        MajorityCaptureSettings {
            enabled: true,
            required_seizing_majority: 4,
            majority_debounce_seconds: 1.0,
        }
    }

    fn crowd(groups: &[(FactionIndex, u64)]) -> Vec<Occupant> {
        let mut next = 0;
        let mut occupants = Vec::new();
        for (faction, count) in groups {
            for _ in 0..*count {
                next += 1;
                occupants.push(Occupant::soldier(EntityId(next), *faction));
            }
        }
        occupants
    }

    struct Fixture {
        factions: FactionRegistry,
        base: MilitaryBase,
        notifier: TransitionNotifier,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                factions: FactionRegistry::new(vec![
                    Faction::new("US", true, "us-net"),
                    Faction::new("USSR", true, "ussr-net"),
                ]),
                base: MilitaryBase::new("levie"),
                notifier: TransitionNotifier::new(),
            }
        }

        fn ctx(&mut self, now: u64) -> ZoneContext<'_> {
            ZoneContext {
                now: at(now),
                factions: &self.factions,
                base: Some(&self.base),
                notifier: &mut self.notifier,
            }
        }

        fn starts(&self) -> u32 {
            self.notifier
                .local()
                .zone("levie")
                .map(|zone| zone.starts_observed)
                .unwrap_or(0)
        }
    }

    #[test]
    fn sustained_majority_starts_once_after_debounce() {
        let mut fixture = Fixture::new();
        let mut zone = SeizingZone::new(&zone_config(), Some(US), &settings());
        let (_, mut rx) = fixture.notifier.subscribe(64);
        let occupants = crowd(&[(USSR, 5), (US, 1)]);

        for tick in 0..=30u64 {
            let now = 1 + tick * 50;
            zone.on_query_finished(&occupants, &mut fixture.ctx(now));
        }

        assert_eq!(fixture.starts(), 1);
        assert_eq!(zone.state().tally.seizing, 4);
        let mut starts = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let ReplicationMessage::Transition { event } = message {
                starts.push((event.kind, event.faction, event.at_ms));
            }
        }
        assert_eq!(starts, vec![(TransitionKind::Start, USSR, at(1_001))]);
    }

    #[test]
    fn brief_contest_never_starts_capture() {
        let mut fixture = Fixture::new();
        let mut zone = SeizingZone::new(&zone_config(), Some(US), &settings());
        let attackers = crowd(&[(USSR, 5)]);
        let contested = crowd(&[(USSR, 3), (US, 3)]);

        for tick in 0..40u64 {
            let occupants = if tick % 10 == 9 { &contested } else { &attackers };
            zone.on_query_finished(occupants, &mut fixture.ctx(1 + tick * 100));
        }
        assert_eq!(fixture.starts(), 0);
        assert_eq!(zone.state().timer.phase(), TimerPhase::Inactive);
    }

    #[test]
    fn empty_zone_resets_debounce() {
        let mut fixture = Fixture::new();
        let mut zone = SeizingZone::new(&zone_config(), Some(US), &settings());
        let attackers = crowd(&[(USSR, 4)]);

        zone.on_query_finished(&attackers, &mut fixture.ctx(1));
        zone.on_query_finished(&attackers, &mut fixture.ctx(900));
        zone.on_query_finished(&[], &mut fixture.ctx(950));
        zone.on_query_finished(&attackers, &mut fixture.ctx(1_100));
        assert_eq!(fixture.starts(), 0);
    }

    #[test]
    fn paused_zone_skips_frames_until_woken() {
        let mut fixture = Fixture::new();
        let settings = MajorityCaptureSettings {
            majority_debounce_seconds: 0.0,
            ..settings()
        };
        let mut zone = SeizingZone::new(&zone_config(), Some(US), &settings);

        assert_eq!(zone.frame(&mut fixture.ctx(1)), FrameOutcome::QueryDue);
        zone.on_query_finished(&crowd(&[(USSR, 4)]), &mut fixture.ctx(1));
        assert_eq!(zone.frame(&mut fixture.ctx(100)), FrameOutcome::Idle);
        assert_eq!(zone.frame(&mut fixture.ctx(251)), FrameOutcome::QueryDue);
        zone.on_query_finished(&crowd(&[(USSR, 2)]), &mut fixture.ctx(251));
        assert!(zone.is_paused());

        assert_eq!(zone.frame(&mut fixture.ctx(600)), FrameOutcome::Skipped);
        zone.request_evaluation();
        assert_eq!(zone.frame(&mut fixture.ctx(650)), FrameOutcome::QueryDue);
        zone.on_query_finished(&crowd(&[(USSR, 4)]), &mut fixture.ctx(650));
        assert!(!zone.is_paused());
        assert_eq!(fixture.starts(), 2);
    }

    #[test]
    fn running_capture_completes_and_flips_controller() {
        let mut fixture = Fixture::new();
        let settings = MajorityCaptureSettings {
            majority_debounce_seconds: 0.0,
            ..settings()
        };
        let mut zone = SeizingZone::new(&zone_config(), Some(US), &settings);
        zone.on_query_finished(&crowd(&[(USSR, 8)]), &mut fixture.ctx(1));

        // eight seizers reach the minimum time of 10 s
        assert_eq!(zone.view().end_ms, at(10_001));
        let outcome = zone.frame(&mut fixture.ctx(10_001));
        let FrameOutcome::Seized(seized) = outcome else {
            panic!("expected the zone to be seized, got {outcome:?}");
        };
        assert_eq!(seized.faction, USSR);
        assert_eq!(seized.previous_controller, Some(US));
        assert_eq!(zone.controller(), Some(USSR));
        assert_eq!(zone.view().phase, TimerPhase::Inactive);

        let replica = fixture.notifier.local().zone("levie").expect("zone should be synced");
        let view = replica.view.as_ref().expect("view should be synced");
        assert_eq!(view.controller, Some(USSR));
        assert_eq!(replica.capturing, None);
    }

    #[test]
    fn controller_change_interrupts_running_capture() {
        let mut fixture = Fixture::new();
        let settings = MajorityCaptureSettings {
            majority_debounce_seconds: 0.0,
            ..settings()
        };
        let mut zone = SeizingZone::new(&zone_config(), Some(US), &settings);
        zone.on_query_finished(&crowd(&[(USSR, 5)]), &mut fixture.ctx(1));
        assert_eq!(zone.view().phase, TimerPhase::Running);

        zone.set_controller(Some(USSR), &mut fixture.ctx(500));
        assert_eq!(zone.view().phase, TimerPhase::Paused);
        let replica = fixture.notifier.local().zone("levie").expect("zone should be synced");
        assert_eq!(replica.interrupts_observed, 1);
    }

    #[test]
    fn disabled_ai_is_reported_for_despawn() {
        let mut fixture = Fixture::new();
        let mut zone = SeizingZone::new(&zone_config(), Some(US), &settings());
        let mut occupants = crowd(&[(USSR, 1)]);
        occupants.push(Occupant {
            entity: EntityId(99),
            faction: Some(USSR),
            alive: true,
            disabled_ai: true,
        });
        let despawn = zone.on_query_finished(&occupants, &mut fixture.ctx(1));
        assert_eq!(despawn, vec![EntityId(99)]);
    }

    #[test]
    fn revision_only_moves_when_state_changes() {
        let mut fixture = Fixture::new();
        let mut zone = SeizingZone::new(&zone_config(), Some(US), &settings());
        zone.publish(&mut fixture.notifier);
        assert_eq!(zone.view().revision, 1);

        zone.on_query_finished(&[], &mut fixture.ctx(1));
        assert_eq!(zone.view().revision, 1);
        zone.on_query_finished(&crowd(&[(USSR, 1)]), &mut fixture.ctx(2));
        assert_eq!(zone.view().revision, 2);
    }
}
