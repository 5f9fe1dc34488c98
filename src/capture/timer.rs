use crate::clock::{seconds_to_millis, ServerTimestamp};
use crate::config::SeizingLimits;
use crate::constants::MIN_CAPTURE_DURATION_MS;
use crate::types::{FactionIndex, TimerPhase};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DurationInputs {
    pub seizing: u32,
    pub services: u32,
    pub radio_connections: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DurationBreakdown {
    pub range: f64,
    pub deduction: f64,
    pub multiplier: f64,
    pub final_seconds: f64,
}

pub fn compute_duration(limits: &SeizingLimits, inputs: DurationInputs) -> DurationBreakdown {
    let range = limits.max_seizing_time - limits.min_seizing_time;

    let deduction = if limits.max_seizing_characters > 1 {
        let per_seizer = range / f64::from(limits.max_seizing_characters - 1);
        per_seizer * (f64::from(inputs.seizing) - 1.0)
    } else {
        0.0
    };

    let mut multiplier = 1.0;
    if range > 0.0 {
        multiplier += f64::from(inputs.services) * (limits.extra_time_per_service / range);
        multiplier +=
            f64::from(inputs.radio_connections) * (limits.extra_time_per_radio_connection / range);
    }

    DurationBreakdown {
        range,
        deduction,
        multiplier,
        final_seconds: multiplier * (limits.max_seizing_time - deduction),
    }
}

/// `start == 0` is inactive and `end == start` (with a non-zero start) is
/// paused. Replicas only ever see the `(start, end)` pair.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CaptureTimer {
    start: ServerTimestamp,
    end: ServerTimestamp,
    interrupted_at: ServerTimestamp,
    interrupted_elapsed_ms: u64,
    capturing: Option<FactionIndex>,
}

impl CaptureTimer {
    pub fn phase(&self) -> TimerPhase {
        if self.start.is_zero() {
            TimerPhase::Inactive
        } else if self.end == self.start {
            TimerPhase::Paused
        } else {
            TimerPhase::Running
        }
    }

    pub fn is_active(&self) -> bool {
        !self.start.is_zero()
    }

    pub fn is_paused(&self) -> bool {
        self.phase() == TimerPhase::Paused
    }

    pub fn start_timestamp(&self) -> ServerTimestamp {
        self.start
    }

    pub fn end_timestamp(&self) -> ServerTimestamp {
        self.end
    }

    pub fn capturing(&self) -> Option<FactionIndex> {
        self.capturing
    }

    pub fn interrupted_at(&self) -> ServerTimestamp {
        self.interrupted_at
    }

    pub fn interrupted_elapsed_ms(&self) -> u64 {
        self.interrupted_elapsed_ms
    }

    pub fn start(&mut self, now: ServerTimestamp, faction: FactionIndex) {
        self.start = now;
        self.end = ServerTimestamp::ZERO;
        self.interrupted_at = ServerTimestamp::ZERO;
        self.interrupted_elapsed_ms = 0;
        self.capturing = Some(faction);
    }

    pub fn pause(&mut self, now: ServerTimestamp) -> bool {
        if !self.is_active() {
            return false;
        }
        let was_paused = self.is_paused();
        if !was_paused {
            self.interrupted_at = now;
            self.interrupted_elapsed_ms = now.diff_millis(self.start);
        }
        self.end = self.start;
        !was_paused
    }

    pub fn resume(&mut self, now: ServerTimestamp, faction: FactionIndex) {
        let start = now.minus_millis(self.interrupted_elapsed_ms);
        self.start = if start.is_zero() {
            ServerTimestamp::from_millis(1)
        } else {
            start
        };
        self.interrupted_elapsed_ms = 0;
        self.capturing = Some(faction);
    }

    pub fn set_capturing(&mut self, faction: FactionIndex) {
        self.capturing = Some(faction);
    }

    pub fn apply_duration(&mut self, seconds: f64) {
        let millis = seconds_to_millis(seconds).max(MIN_CAPTURE_DURATION_MS);
        self.end = self.start.plus_millis(millis);
    }

    pub fn is_complete(&self, now: ServerTimestamp) -> bool {
        self.phase() == TimerPhase::Running && now >= self.end
    }

    pub fn remaining_ms(&self, now: ServerTimestamp) -> Option<u64> {
        match self.phase() {
            TimerPhase::Running => Some(self.end.diff_millis(now)),
            TimerPhase::Paused | TimerPhase::Inactive => None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
