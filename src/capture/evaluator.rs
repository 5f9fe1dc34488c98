use tracing::{debug, info};

use crate::base::{count_active_services, count_radio_connections};
use crate::config::MajorityCaptureSettings;
use crate::types::{FactionIndex, InterruptReason, TallyResult, TransitionKind};

use super::debounce::{DebounceDecision, MajorityDebouncer};
use super::timer::{compute_duration, DurationBreakdown, DurationInputs};
use super::{ZoneContext, ZoneState};

pub trait OccupancyEvaluator: Send {
    fn name(&self) -> &'static str;

    fn on_tally(&mut self, zone: &mut ZoneState, changed: bool, ctx: &mut ZoneContext<'_>);

    fn refresh_timer(&mut self, zone: &mut ZoneState, ctx: &mut ZoneContext<'_>);

    fn skips_frame(&self, zone: &ZoneState) -> bool;

    fn on_capture_finished(&mut self) {}
}

pub fn select_evaluator(settings: &MajorityCaptureSettings) -> Box<dyn OccupancyEvaluator> {
    if settings.enabled {
        Box::new(MajorityEvaluator::new(settings))
    } else {
        Box::new(DefaultEvaluator)
    }
}

pub struct MajorityEvaluator {
    required_majority: u32,
    debouncer: MajorityDebouncer,
}

impl MajorityEvaluator {
    pub fn new(settings: &MajorityCaptureSettings) -> Self {
        Self {
            required_majority: settings.required_seizing_majority,
            debouncer: MajorityDebouncer::new(
                settings.required_seizing_majority,
                settings.majority_debounce_seconds,
            ),
        }
    }

    pub fn debouncer(&self) -> &MajorityDebouncer {
        &self.debouncer
    }
}

fn interrupt_reason(tally: TallyResult, controller: Option<FactionIndex>) -> InterruptReason {
    if tally.prevailing.is_some() && tally.prevailing == controller {
        InterruptReason::DefendersRegainedControl
    } else if tally.prevailing.is_none() {
        InterruptReason::NoPrevailingFaction
    } else {
        InterruptReason::MajorityLost
    }
}

impl OccupancyEvaluator for MajorityEvaluator {
    fn name(&self) -> &'static str {
        "majority"
    }

    fn on_tally(&mut self, zone: &mut ZoneState, changed: bool, ctx: &mut ZoneContext<'_>) {
        if zone.timer.is_active() {
            if changed {
                self.refresh_timer(zone, ctx);
            }
            return;
        }

        let DebounceDecision::StartCapture { faction, held_ms } =
            self.debouncer.observe(zone.tally, zone.controller, ctx.now)
        else {
            return;
        };

        info!(
            zone = %zone.name,
            faction = ctx.factions.display_key(Some(faction)),
            held_ms,
            "majority held, starting capture"
        );
        zone.timer.start(ctx.now, faction);
        self.refresh_timer(zone, ctx);
        ctx.notifier
            .apply_transition(&zone.name, TransitionKind::Start, faction, ctx.now);
    }

    fn refresh_timer(&mut self, zone: &mut ZoneState, ctx: &mut ZoneContext<'_>) {
        if !zone.timer.is_active() {
            return;
        }

        let tally = zone.tally;
        let has_majority = tally.prevailing.is_some() && tally.seizing >= self.required_majority;
        let prevailing = match tally.prevailing {
            Some(faction) if has_majority && tally.prevailing != zone.controller => faction,
            _ => {
                if !zone.timer.is_paused() {
                    let reason = interrupt_reason(tally, zone.controller);
                    info!(zone = %zone.name, %reason, "capture interrupted");
                    zone.timer.pause(ctx.now);
                    // Replicas learn who broke the capture, else who was capturing.
                    if let Some(faction) = tally.prevailing.or(zone.timer.capturing()) {
                        ctx.notifier.apply_transition(
                            &zone.name,
                            TransitionKind::Interrupt,
                            faction,
                            ctx.now,
                        );
                    }
                }
                zone.mark_dirty();
                return;
            }
        };

        if zone.timer.is_paused() {
            info!(
                zone = %zone.name,
                faction = ctx.factions.display_key(Some(prevailing)),
                "capture resumed"
            );
            zone.timer.resume(ctx.now, prevailing);
            ctx.notifier
                .apply_transition(&zone.name, TransitionKind::Start, prevailing, ctx.now);
        } else {
            zone.timer.set_capturing(prevailing);
        }

        recompute_duration(zone, ctx);
        zone.mark_dirty();
    }

    fn skips_frame(&self, zone: &ZoneState) -> bool {
        zone.timer.is_paused()
    }

    fn on_capture_finished(&mut self) {
        self.debouncer.reset();
    }
}

pub struct DefaultEvaluator;

impl DefaultEvaluator {
    fn attacker(zone: &ZoneState) -> Option<FactionIndex> {
        zone.tally
            .prevailing
            .filter(|faction| zone.tally.seizing > 0 && Some(*faction) != zone.controller)
    }

    fn settle(&mut self, zone: &mut ZoneState, recompute: bool, ctx: &mut ZoneContext<'_>) {
        let attacker = Self::attacker(zone);
        let capturing = zone.timer.capturing().filter(|_| zone.timer.is_active());

        match (attacker, capturing) {
            (Some(attacker), Some(current)) if attacker == current => {
                if recompute {
                    recompute_duration(zone, ctx);
                    zone.mark_dirty();
                }
            }
            (Some(attacker), current) => {
                if let Some(current) = current {
                    ctx.notifier
                        .apply_transition(&zone.name, TransitionKind::Interrupt, current, ctx.now);
                }
                info!(
                    zone = %zone.name,
                    faction = ctx.factions.display_key(Some(attacker)),
                    "starting capture"
                );
                zone.timer.start(ctx.now, attacker);
                recompute_duration(zone, ctx);
                zone.mark_dirty();
                ctx.notifier
                    .apply_transition(&zone.name, TransitionKind::Start, attacker, ctx.now);
            }
            (None, Some(current)) => {
                info!(zone = %zone.name, "capture reset");
                zone.timer.reset();
                zone.mark_dirty();
                ctx.notifier
                    .apply_transition(&zone.name, TransitionKind::Interrupt, current, ctx.now);
            }
            (None, None) => {}
        }
    }
}

impl OccupancyEvaluator for DefaultEvaluator {
    fn name(&self) -> &'static str {
        "default"
    }

    fn on_tally(&mut self, zone: &mut ZoneState, changed: bool, ctx: &mut ZoneContext<'_>) {
        self.settle(zone, changed, ctx);
    }

    fn refresh_timer(&mut self, zone: &mut ZoneState, ctx: &mut ZoneContext<'_>) {
        self.settle(zone, true, ctx);
    }

    fn skips_frame(&self, _zone: &ZoneState) -> bool {
        false
    }
}

pub(crate) fn recompute_duration(zone: &mut ZoneState, ctx: &ZoneContext<'_>) -> DurationBreakdown {
    if ctx.base.is_none() {
        debug!(zone = %zone.name, "no base linked, services and radios count as zero");
    }
    let controller = zone.controller.and_then(|faction| ctx.factions.get(faction));
    let inputs = DurationInputs {
        seizing: zone.tally.seizing,
        services: count_active_services(ctx.base),
        radio_connections: count_radio_connections(ctx.base, controller),
    };
    let breakdown = compute_duration(&zone.limits, inputs);
    zone.timer.apply_duration(breakdown.final_seconds);

    info!(
        zone = %zone.name,
        seizers = inputs.seizing,
        services = inputs.services,
        radios = inputs.radio_connections,
        deduction = breakdown.deduction,
        multiplier = breakdown.multiplier,
        final_seconds = breakdown.final_seconds,
        "recalculated seize timer"
    );
    breakdown
}
