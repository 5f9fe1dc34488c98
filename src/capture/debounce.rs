use crate::clock::{seconds_to_millis, ServerTimestamp};
use crate::types::{FactionIndex, TallyResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DebounceDecision {
    Hold,
    StartCapture { faction: FactionIndex, held_ms: u64 },
}

#[derive(Clone, Debug)]
pub struct MajorityDebouncer {
    required_majority: u32,
    threshold_ms: u64,
    candidate: Option<FactionIndex>,
    held_ms: u64,
    last_tick: Option<ServerTimestamp>,
}

impl MajorityDebouncer {
    pub fn new(required_majority: u32, debounce_seconds: f64) -> Self {
        Self {
            required_majority,
            threshold_ms: seconds_to_millis(debounce_seconds),
            candidate: None,
            held_ms: 0,
            last_tick: None,
        }
    }

    pub fn required_majority(&self) -> u32 {
        self.required_majority
    }

    pub fn candidate(&self) -> Option<FactionIndex> {
        self.candidate
    }

    pub fn held_ms(&self) -> u64 {
        self.held_ms
    }

    pub fn meets_majority(&self, tally: TallyResult, controller: Option<FactionIndex>) -> bool {
        tally.prevailing.is_some()
            && tally.seizing >= self.required_majority
            && tally.prevailing != controller
    }

    pub fn observe(
        &mut self,
        tally: TallyResult,
        controller: Option<FactionIndex>,
        now: ServerTimestamp,
    ) -> DebounceDecision {
        let delta_ms = self
            .last_tick
            .map(|last| now.diff_millis(last))
            .unwrap_or(0);
        self.last_tick = Some(now);

        if !self.meets_majority(tally, controller) {
            self.candidate = None;
            self.held_ms = 0;
            return DebounceDecision::Hold;
        }

        if self.candidate != tally.prevailing {
            self.candidate = tally.prevailing;
            self.held_ms = delta_ms;
        } else {
            self.held_ms = self.held_ms.saturating_add(delta_ms);
        }

        match self.candidate {
            Some(faction) if self.held_ms >= self.threshold_ms => {
                let held_ms = self.held_ms;
                self.reset();
                DebounceDecision::StartCapture { faction, held_ms }
            }
            _ => DebounceDecision::Hold,
        }
    }

    pub fn reset(&mut self) {
        self.candidate = None;
        self.held_ms = 0;
        self.last_tick = None;
    }
}
