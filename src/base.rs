use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::faction::Faction;
use crate::types::ServicePointType;

pub trait BaseServices {
    fn has_service(&self, kind: ServicePointType) -> bool;

    /// Radios of the given network within range of the base, or `None` when
    /// the base has no radio coverage component at all.
    fn radios_in_range(&self, radio_key: &str) -> Option<u32>;
}

pub fn count_active_services(base: Option<&dyn BaseServices>) -> u32 {
    let Some(base) = base else {
        return 0;
    };
    ServicePointType::COUNTED
        .iter()
        .filter(|kind| base.has_service(**kind))
        .count() as u32
}

pub fn count_radio_connections(base: Option<&dyn BaseServices>, faction: Option<&Faction>) -> u32 {
    let (Some(base), Some(faction)) = (base, faction) else {
        return 0;
    };
    if !faction.playable {
        return 0;
    }
    base.radios_in_range(&faction.radio_key).unwrap_or(0)
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseConfig {
    pub id: String,
    #[serde(default)]
    pub services: Vec<ServicePointType>,
    #[serde(rename = "radioCoverage", default)]
    pub radio_coverage: Option<HashMap<String, u32>>,
}

#[derive(Clone, Debug)]
pub struct MilitaryBase {
    id: String,
    services: BTreeSet<ServicePointType>,
    radio_coverage: Option<HashMap<String, u32>>,
}

impl MilitaryBase {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            services: BTreeSet::new(),
            radio_coverage: None,
        }
    }

    pub fn from_config(config: &BaseConfig) -> Self {
        Self {
            id: config.id.clone(),
            services: config.services.iter().copied().collect(),
            radio_coverage: config.radio_coverage.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn build_service(&mut self, kind: ServicePointType) -> bool {
        self.services.insert(kind)
    }

    pub fn destroy_service(&mut self, kind: ServicePointType) -> bool {
        self.services.remove(&kind)
    }

    pub fn set_radios_in_range(&mut self, radio_key: &str, count: u32) {
        self.radio_coverage
            .get_or_insert_with(HashMap::new)
            .insert(radio_key.to_string(), count);
    }

    pub fn remove_radio_coverage(&mut self) {
        self.radio_coverage = None;
    }
}

impl BaseServices for MilitaryBase {
    fn has_service(&self, kind: ServicePointType) -> bool {
        self.services.contains(&kind)
    }

    fn radios_in_range(&self, radio_key: &str) -> Option<u32> {
        let coverage = self.radio_coverage.as_ref()?;
        Some(coverage.get(radio_key).copied().unwrap_or(0))
    }
}
