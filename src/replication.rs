use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::clock::ServerTimestamp;
use crate::types::{FactionIndex, TimerPhase, TransitionEvent, TransitionKind, ZoneView};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplicationMessage {
    Transition { event: TransitionEvent },
    ZoneSync { zone: ZoneView },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplicaZone {
    pub last_seq: u64,
    pub capturing: Option<FactionIndex>,
    pub interrupted: bool,
    pub starts_observed: u32,
    pub interrupts_observed: u32,
    pub view: Option<ZoneView>,
}

impl ReplicaZone {
    pub fn remaining_ms(&self, now: ServerTimestamp) -> Option<u64> {
        let view = self.view.as_ref()?;
        if view.phase != TimerPhase::Running {
            return None;
        }
        Some(view.end_ms.diff_millis(now))
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplicaState {
    zones: HashMap<String, ReplicaZone>,
}

impl ReplicaState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn zone(&self, name: &str) -> Option<&ReplicaZone> {
        self.zones.get(name)
    }

    pub fn zone_names(&self) -> impl Iterator<Item = &str> {
        self.zones.keys().map(String::as_str)
    }

    pub fn apply(&mut self, message: &ReplicationMessage) -> bool {
        match message {
            ReplicationMessage::Transition { event } => self.apply_transition(event),
            ReplicationMessage::ZoneSync { zone } => self.apply_sync(zone),
        }
    }

    fn apply_transition(&mut self, event: &TransitionEvent) -> bool {
        let zone = self.zones.entry(event.zone.clone()).or_default();
        if event.seq <= zone.last_seq {
            return false;
        }
        zone.last_seq = event.seq;
        match event.kind {
            TransitionKind::Start => {
                zone.capturing = Some(event.faction);
                zone.interrupted = false;
                zone.starts_observed += 1;
            }
            TransitionKind::Interrupt => {
                zone.interrupted = true;
                zone.interrupts_observed += 1;
            }
        }
        true
    }

    fn apply_sync(&mut self, view: &ZoneView) -> bool {
        let zone = self.zones.entry(view.zone.clone()).or_default();
        if let Some(current) = zone.view.as_ref() {
            if view.revision <= current.revision {
                return false;
            }
        }
        if view.phase == TimerPhase::Inactive {
            zone.capturing = None;
            zone.interrupted = false;
        }
        zone.view = Some(view.clone());
        true
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<ReplicationMessage>,
}

pub struct TransitionNotifier {
    local: ReplicaState,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
    next_seq: HashMap<String, u64>,
    dropped: u64,
}

impl TransitionNotifier {
    pub fn new() -> Self {
        Self {
            local: ReplicaState::new(),
            subscribers: Vec::new(),
            next_subscriber_id: 1,
            next_seq: HashMap::new(),
            dropped: 0,
        }
    }

    pub fn subscribe(&mut self, capacity: usize) -> (u64, mpsc::Receiver<ReplicationMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_subscriber_id;
        self.next_subscriber_id += 1;
        self.subscribers.push(Subscriber { id, tx });
        debug!(subscriber = id, "replica subscribed");
        (id, rx)
    }

    pub fn unsubscribe(&mut self, id: u64) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|subscriber| subscriber.id != id);
        before != self.subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn dropped_messages(&self) -> u64 {
        self.dropped
    }

    pub fn local(&self) -> &ReplicaState {
        &self.local
    }

    pub fn apply_transition(
        &mut self,
        zone: &str,
        kind: TransitionKind,
        faction: FactionIndex,
        at: ServerTimestamp,
    ) -> TransitionEvent {
        let seq = self.next_seq.entry(zone.to_string()).or_insert(0);
        *seq += 1;
        let event = TransitionEvent {
            zone: zone.to_string(),
            seq: *seq,
            kind,
            faction,
            at_ms: at,
        };
        self.publish(ReplicationMessage::Transition {
            event: event.clone(),
        });
        event
    }

    pub fn sync_zone(&mut self, view: ZoneView) {
        self.publish(ReplicationMessage::ZoneSync { zone: view });
    }

    fn publish(&mut self, message: ReplicationMessage) {
        self.local.apply(&message);

        let mut closed = Vec::new();
        for subscriber in &self.subscribers {
            match subscriber.tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped += 1;
                    warn!(subscriber = subscriber.id, "replica queue full, message dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(subscriber.id),
            }
        }
        if !closed.is_empty() {
            self.subscribers
                .retain(|subscriber| !closed.contains(&subscriber.id));
        }
    }
}

impl Default for TransitionNotifier {
    fn default() -> Self {
        Self::new()
    }
}
