use std::fmt;

use serde::{Deserialize, Serialize};

use crate::clock::ServerTimestamp;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FactionIndex(pub usize);

impl fmt::Display for FactionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity_{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Occupant {
    pub entity: EntityId,
    pub faction: Option<FactionIndex>,
    pub alive: bool,
    pub disabled_ai: bool,
}

impl Occupant {
    pub fn soldier(entity: EntityId, faction: FactionIndex) -> Self {
        Self {
            entity,
            faction: Some(faction),
            alive: true,
            disabled_ai: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyResult {
    pub prevailing: Option<FactionIndex>,
    pub seizing: u32,
}

impl TallyResult {
    pub const NONE: Self = Self {
        prevailing: None,
        seizing: 0,
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Start,
    Interrupt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    MajorityLost,
    DefendersRegainedControl,
    NoPrevailingFaction,
}

impl InterruptReason {
    pub fn label(self) -> &'static str {
        match self {
            Self::MajorityLost => "majority lost",
            Self::DefendersRegainedControl => "defenders regained control",
            Self::NoPrevailingFaction => "no prevailing faction",
        }
    }
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerPhase {
    Inactive,
    Running,
    Paused,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServicePointType {
    Armory,
    Helipad,
    Barracks,
    RadioAntenna,
    FieldHospital,
    LightVehicleDepot,
    HeavyVehicleDepot,
}

impl ServicePointType {
    pub const COUNTED: [Self; 7] = [
        Self::Armory,
        Self::Helipad,
        Self::Barracks,
        Self::RadioAntenna,
        Self::FieldHospital,
        Self::LightVehicleDepot,
        Self::HeavyVehicleDepot,
    ];
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZoneView {
    pub zone: String,
    pub revision: u64,
    pub controller: Option<FactionIndex>,
    pub prevailing: Option<FactionIndex>,
    pub seizing: u32,
    #[serde(rename = "capturingFaction")]
    pub capturing_faction: Option<FactionIndex>,
    #[serde(rename = "startMs")]
    pub start_ms: ServerTimestamp,
    #[serde(rename = "endMs")]
    pub end_ms: ServerTimestamp,
    pub phase: TimerPhase,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub zone: String,
    pub seq: u64,
    pub kind: TransitionKind,
    pub faction: FactionIndex,
    #[serde(rename = "atMs")]
    pub at_ms: ServerTimestamp,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SeizedZone {
    pub zone: String,
    pub faction: FactionIndex,
    #[serde(rename = "previousController")]
    pub previous_controller: Option<FactionIndex>,
    #[serde(rename = "atMs")]
    pub at_ms: ServerTimestamp,
}
