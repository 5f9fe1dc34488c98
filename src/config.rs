use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::base::BaseConfig;
use crate::constants::{
    DEFAULT_EXTRA_TIME_PER_RADIO_CONNECTION, DEFAULT_EXTRA_TIME_PER_SERVICE,
    DEFAULT_MAJORITY_DEBOUNCE_SECONDS, DEFAULT_MAX_SEIZING_CHARACTERS, DEFAULT_MAX_SEIZING_TIME,
    DEFAULT_MIN_SEIZING_TIME, DEFAULT_QUERY_INTERVAL_SECONDS, DEFAULT_REQUIRED_SEIZING_MAJORITY,
    SETTINGS_VERSION,
};
use crate::faction::Faction;
use crate::types::ServicePointType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write settings file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("unsupported settings version {0}")]
    UnsupportedVersion(u8),
    #[error("zone `{zone}` references unknown faction `{faction}`")]
    UnknownFaction { zone: String, faction: String },
    #[error("zone `{zone}` references unknown base `{base}`")]
    UnknownBase { zone: String, base: String },
    #[error("zone `{0}` is declared more than once")]
    DuplicateZone(String),
    #[error("faction `{0}` is declared more than once")]
    DuplicateFaction(String),
    #[error("zone `{zone}` has invalid seizing limits: {reason}")]
    InvalidLimits { zone: String, reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MajorityCaptureSettings {
    pub enabled: bool,
    pub required_seizing_majority: u32,
    pub majority_debounce_seconds: f64,
}

impl Default for MajorityCaptureSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            required_seizing_majority: DEFAULT_REQUIRED_SEIZING_MAJORITY,
            majority_debounce_seconds: DEFAULT_MAJORITY_DEBOUNCE_SECONDS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SeizingLimits {
    pub min_seizing_time: f64,
    pub max_seizing_time: f64,
    pub max_seizing_characters: u32,
    pub extra_time_per_service: f64,
    pub extra_time_per_radio_connection: f64,
}

impl Default for SeizingLimits {
    fn default() -> Self {
        Self {
            min_seizing_time: DEFAULT_MIN_SEIZING_TIME,
            max_seizing_time: DEFAULT_MAX_SEIZING_TIME,
            max_seizing_characters: DEFAULT_MAX_SEIZING_CHARACTERS,
            extra_time_per_service: DEFAULT_EXTRA_TIME_PER_SERVICE,
            extra_time_per_radio_connection: DEFAULT_EXTRA_TIME_PER_RADIO_CONNECTION,
        }
    }
}

impl SeizingLimits {
    fn validate(&self, zone: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidLimits {
            zone: zone.to_string(),
            reason: reason.to_string(),
        };
        let times = [
            self.min_seizing_time,
            self.max_seizing_time,
            self.extra_time_per_service,
            self.extra_time_per_radio_connection,
        ];
        if times.iter().any(|value| !value.is_finite() || *value < 0.0) {
            return Err(invalid("times must be finite and non-negative"));
        }
        if self.max_seizing_time < self.min_seizing_time {
            return Err(invalid("maxSeizingTime is below minSeizingTime"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ZoneConfig {
    pub name: String,
    pub base: Option<String>,
    pub controller: Option<String>,
    pub ignore_non_playable_attackers: bool,
    pub ignore_non_playable_defenders: bool,
    pub query_interval_seconds: f64,
    pub limits: SeizingLimits,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            base: None,
            controller: None,
            ignore_non_playable_attackers: true,
            ignore_non_playable_defenders: false,
            query_interval_seconds: DEFAULT_QUERY_INTERVAL_SECONDS,
            limits: SeizingLimits::default(),
        }
    }
}

impl ZoneConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettings {
    pub version: u8,
    #[serde(default)]
    pub majority_capture: MajorityCaptureSettings,
    #[serde(default)]
    pub factions: Vec<Faction>,
    #[serde(default)]
    pub bases: Vec<BaseConfig>,
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            majority_capture: MajorityCaptureSettings::default(),
            factions: vec![
                Faction::new("US", true, "us-net"),
                Faction::new("USSR", true, "ussr-net"),
                Faction::new("FIA", false, "fia-net"),
            ],
            bases: vec![
                BaseConfig {
                    id: "levie".to_string(),
                    services: vec![ServicePointType::Armory, ServicePointType::FieldHospital],
                    radio_coverage: Some(HashMap::from([
                        ("us-net".to_string(), 1),
                        ("ussr-net".to_string(), 2),
                    ])),
                },
                BaseConfig {
                    id: "morton".to_string(),
                    services: vec![ServicePointType::Barracks],
                    radio_coverage: None,
                },
            ],
            zones: vec![
                ZoneConfig {
                    base: Some("levie".to_string()),
                    controller: Some("US".to_string()),
                    ..ZoneConfig::named("levie")
                },
                ZoneConfig {
                    base: Some("morton".to_string()),
                    controller: Some("USSR".to_string()),
                    ..ZoneConfig::named("morton")
                },
            ],
        }
    }
}

impl ServerSettings {
    pub fn from_json_str(json: &str, path: &Path) -> Result<Self, ConfigError> {
        let settings: ServerSettings =
            serde_json::from_str(json).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents, path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != SETTINGS_VERSION {
            return Err(ConfigError::UnsupportedVersion(self.version));
        }

        let mut faction_keys = HashSet::new();
        for faction in &self.factions {
            if !faction_keys.insert(faction.key.as_str()) {
                return Err(ConfigError::DuplicateFaction(faction.key.clone()));
            }
        }
        let base_ids: HashSet<&str> = self.bases.iter().map(|base| base.id.as_str()).collect();

        let mut zone_names = HashSet::new();
        for zone in &self.zones {
            if !zone_names.insert(zone.name.as_str()) {
                return Err(ConfigError::DuplicateZone(zone.name.clone()));
            }
            if let Some(controller) = zone.controller.as_deref() {
                if !faction_keys.contains(controller) {
                    return Err(ConfigError::UnknownFaction {
                        zone: zone.name.clone(),
                        faction: controller.to_string(),
                    });
                }
            }
            if let Some(base) = zone.base.as_deref() {
                if !base_ids.contains(base) {
                    return Err(ConfigError::UnknownBase {
                        zone: zone.name.clone(),
                        base: base.to_string(),
                    });
                }
            }
            zone.limits.validate(&zone.name)?;
        }
        Ok(())
    }

    pub fn to_pretty_json(&self) -> Result<String, ConfigError> {
        let mut buffer = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
        self.serialize(&mut serializer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let text = self.to_pretty_json()?;
        fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load_or_create(path: &Path) -> Self {
        match Self::from_file(path) {
            Ok(settings) => {
                info!(path = %path.display(), "loaded capture settings");
                return settings;
            }
            Err(ConfigError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "settings file not found, creating defaults");
            }
            Err(err) => {
                error!(%err, "failed to load capture settings, using defaults");
            }
        }

        let settings = Self::default();
        if let Err(err) = settings.save(path) {
            error!(%err, "failed to write default capture settings");
        }
        settings
    }
}
