use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::clock::ServerTimestamp;
use crate::config::ServerSettings;
use crate::faction::FactionRegistry;
use crate::types::{EntityId, Occupant, ServicePointType};
use crate::world::{CaptureWorld, OccupancyQuery, WorldError};

pub const BUILTIN_SCENARIO: &str = include_str!("data/contested_outpost.json");

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to read scenario {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse scenario: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("scenario jitter {0} is outside 0..=1")]
    InvalidJitter(f64),
    #[error("phase {phase} targets unknown zone {zone}")]
    UnknownZone { phase: usize, zone: String },
    #[error("phase {phase} references unknown faction {faction}")]
    UnknownFaction { phase: usize, faction: String },
    #[error("phase {phase} ends before it starts")]
    InvalidWindow { phase: usize },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioPhase {
    pub zone: String,
    pub from_seconds: f64,
    pub until_seconds: f64,
    #[serde(default)]
    pub presence: BTreeMap<String, u32>,
    #[serde(default)]
    pub disabled_ai: BTreeMap<String, u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScenarioAction {
    BuildService {
        base: String,
        service: ServicePointType,
    },
    DestroyService {
        base: String,
        service: ServicePointType,
    },
    SetRadios {
        base: String,
        #[serde(rename = "radioKey")]
        radio_key: String,
        count: u32,
    },
    SetController {
        zone: String,
        faction: Option<String>,
    },
}

impl ScenarioAction {
    pub fn apply(&self, world: &mut CaptureWorld, now: ServerTimestamp) -> Result<(), WorldError> {
        match self {
            Self::BuildService { base, service } => {
                let target = world
                    .base_mut(base)
                    .ok_or_else(|| WorldError::UnknownBase(base.clone()))?;
                target.build_service(*service);
            }
            Self::DestroyService { base, service } => {
                let target = world
                    .base_mut(base)
                    .ok_or_else(|| WorldError::UnknownBase(base.clone()))?;
                target.destroy_service(*service);
            }
            Self::SetRadios {
                base,
                radio_key,
                count,
            } => {
                let target = world
                    .base_mut(base)
                    .ok_or_else(|| WorldError::UnknownBase(base.clone()))?;
                target.set_radios_in_range(radio_key, *count);
            }
            Self::SetController { zone, faction } => {
                world.set_zone_controller(zone, faction.as_deref(), now)?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimedAction {
    #[serde(rename = "atSeconds")]
    pub at_seconds: f64,
    #[serde(flatten)]
    pub action: ScenarioAction,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub name: String,
    pub duration_seconds: f64,
    #[serde(default)]
    pub jitter: f64,
    #[serde(default)]
    pub phases: Vec<ScenarioPhase>,
    #[serde(default)]
    pub actions: Vec<TimedAction>,
}

impl Scenario {
    pub fn builtin() -> Result<Self, ScenarioError> {
        Self::from_json_str(BUILTIN_SCENARIO)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ScenarioError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ScenarioError> {
        let raw = fs::read_to_string(path).map_err(|source| ScenarioError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self, settings: &ServerSettings) -> Result<(), ScenarioError> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ScenarioError::InvalidJitter(self.jitter));
        }
        let zones: HashSet<&str> = settings.zones.iter().map(|zone| zone.name.as_str()).collect();
        let factions: HashSet<&str> = settings
            .factions
            .iter()
            .map(|faction| faction.key.as_str())
            .collect();

        for (index, phase) in self.phases.iter().enumerate() {
            if !zones.contains(phase.zone.as_str()) {
                return Err(ScenarioError::UnknownZone {
                    phase: index,
                    zone: phase.zone.clone(),
                });
            }
            if phase.until_seconds < phase.from_seconds {
                return Err(ScenarioError::InvalidWindow { phase: index });
            }
            let unknown = phase
                .presence
                .keys()
                .chain(phase.disabled_ai.keys())
                .find(|key| !factions.contains(key.as_str()));
            if let Some(faction) = unknown {
                return Err(ScenarioError::UnknownFaction {
                    phase: index,
                    faction: faction.clone(),
                });
            }
        }
        Ok(())
    }
}

pub struct ScriptedOccupancy {
    scenario: Scenario,
    factions: FactionRegistry,
    origin: ServerTimestamp,
    rng: StdRng,
    despawned: HashSet<EntityId>,
    last_phases: HashMap<String, Vec<usize>>,
    next_action: usize,
}

impl ScriptedOccupancy {
    pub fn new(scenario: Scenario, factions: FactionRegistry, seed: u64, origin: ServerTimestamp) -> Self {
        let mut actions = scenario.actions.clone();
        actions.sort_by(|a, b| a.at_seconds.total_cmp(&b.at_seconds));
        Self {
            scenario: Scenario {
                actions,
                ..scenario
            },
            factions,
            origin,
            rng: StdRng::seed_from_u64(seed),
            despawned: HashSet::new(),
            last_phases: HashMap::new(),
            next_action: 0,
        }
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    pub fn elapsed_seconds(&self, now: ServerTimestamp) -> f64 {
        now.diff_seconds(self.origin)
    }

    pub fn is_finished(&self, now: ServerTimestamp) -> bool {
        self.elapsed_seconds(now) >= self.scenario.duration_seconds
    }

    pub fn despawned_count(&self) -> usize {
        self.despawned.len()
    }

    pub fn take_due_actions(&mut self, now: ServerTimestamp) -> Vec<ScenarioAction> {
        let elapsed = self.elapsed_seconds(now);
        let mut due = Vec::new();
        while let Some(timed) = self.scenario.actions.get(self.next_action) {
            if timed.at_seconds > elapsed {
                break;
            }
            due.push(timed.action.clone());
            self.next_action += 1;
        }
        due
    }

    fn active_phases(&self, zone: &str, now: ServerTimestamp) -> Vec<usize> {
        let elapsed = self.elapsed_seconds(now);
        self.scenario
            .phases
            .iter()
            .enumerate()
            .filter(|(_, phase)| {
                phase.zone == zone && phase.from_seconds <= elapsed && elapsed < phase.until_seconds
            })
            .map(|(index, _)| index)
            .collect()
    }

    fn entity_id(phase: usize, faction: usize, slot: u32, disabled: bool) -> EntityId {
        let kind = if disabled { 1 } else { 0 };
        EntityId(((phase as u64 + 1) << 32) | ((faction as u64) << 20) | (kind << 19) | u64::from(slot))
    }
}

impl OccupancyQuery for ScriptedOccupancy {
    fn entities_inside(&mut self, zone: &str, now: ServerTimestamp) -> Vec<Occupant> {
        let phases = self.active_phases(zone, now);
        let jitter = self.scenario.jitter;
        let mut occupants = Vec::new();

        for &index in &phases {
            let phase = &self.scenario.phases[index];
            let groups = phase
                .presence
                .iter()
                .map(|(key, count)| (key, *count, false))
                .chain(phase.disabled_ai.iter().map(|(key, count)| (key, *count, true)));
            for (key, count, disabled) in groups {
                let Some(faction) = self.factions.index_of(key) else {
                    continue;
                };
                for slot in 0..count {
                    let entity = Self::entity_id(index, faction.0, slot, disabled);
                    if self.despawned.contains(&entity) {
                        continue;
                    }
                    if !disabled && jitter > 0.0 && self.rng.random_bool(jitter) {
                        continue;
                    }
                    occupants.push(Occupant {
                        entity,
                        faction: Some(faction),
                        alive: true,
                        disabled_ai: disabled,
                    });
                }
            }
        }

        self.last_phases.insert(zone.to_string(), phases);
        occupants
    }

    fn despawn(&mut self, entity: EntityId) {
        if self.despawned.insert(entity) {
            info!(%entity, "despawned disabled unit");
        }
    }

    fn has_pending_changes(&mut self, zone: &str, now: ServerTimestamp) -> bool {
        let current = self.active_phases(zone, now);
        self.last_phases
            .get(zone)
            .map(|last| *last != current)
            .unwrap_or(true)
    }
}
