use serde::{Deserialize, Serialize};

use crate::types::FactionIndex;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Faction {
    pub key: String,
    #[serde(default = "default_playable")]
    pub playable: bool,
    #[serde(rename = "radioKey", default)]
    pub radio_key: String,
}

fn default_playable() -> bool {
    true
}

impl Faction {
    pub fn new(key: &str, playable: bool, radio_key: &str) -> Self {
        Self {
            key: key.to_string(),
            playable,
            radio_key: radio_key.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FactionRegistry {
    factions: Vec<Faction>,
}

impl FactionRegistry {
    pub fn new(factions: Vec<Faction>) -> Self {
        Self { factions }
    }

    pub fn get(&self, index: FactionIndex) -> Option<&Faction> {
        self.factions.get(index.0)
    }

    pub fn index_of(&self, key: &str) -> Option<FactionIndex> {
        self.factions
            .iter()
            .position(|faction| faction.key == key)
            .map(FactionIndex)
    }

    pub fn is_playable(&self, index: FactionIndex) -> bool {
        self.get(index).map(|faction| faction.playable).unwrap_or(false)
    }

    pub fn display_key(&self, index: Option<FactionIndex>) -> &str {
        index
            .and_then(|index| self.get(index))
            .map(|faction| faction.key.as_str())
            .unwrap_or("null")
    }

    pub fn len(&self) -> usize {
        self.factions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FactionIndex, &Faction)> {
        self.factions
            .iter()
            .enumerate()
            .map(|(index, faction)| (FactionIndex(index), faction))
    }
}
