pub mod base;
pub mod capture;
pub mod clock;
pub mod config;
pub mod constants;
pub mod faction;
pub mod replication;
pub mod scenario;
pub mod server_protocol;
pub mod server_utils;
pub mod types;
pub mod world;
