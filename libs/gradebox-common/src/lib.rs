pub mod config;
pub mod redis;
pub mod status;
pub mod types;
