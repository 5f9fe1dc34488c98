pub const TICK_RATE: u32 = 20;
pub const TICK_MS: u64 = 1000 / TICK_RATE as u64;

pub const SETTINGS_VERSION: u8 = 1;
pub const DEFAULT_SETTINGS_PATH: &str = ".data/capture_settings.json";

pub const DEFAULT_REQUIRED_SEIZING_MAJORITY: u32 = 4;
pub const DEFAULT_MAJORITY_DEBOUNCE_SECONDS: f64 = 1.0;

pub const DEFAULT_MIN_SEIZING_TIME: f64 = 60.0;
pub const DEFAULT_MAX_SEIZING_TIME: f64 = 180.0;
pub const DEFAULT_MAX_SEIZING_CHARACTERS: u32 = 8;
pub const DEFAULT_EXTRA_TIME_PER_SERVICE: f64 = 10.0;
pub const DEFAULT_EXTRA_TIME_PER_RADIO_CONNECTION: f64 = 10.0;
pub const DEFAULT_QUERY_INTERVAL_SECONDS: f64 = 0.25;

pub const REPLICA_QUEUE_CAPACITY: usize = 256;

/// Seizing a zone takes at least this long even when limits compute zero, so
/// the end timestamp never equals the start (the paused encoding).
pub const MIN_CAPTURE_DURATION_MS: u64 = 1;
