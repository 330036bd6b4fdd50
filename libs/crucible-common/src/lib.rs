pub mod config;
pub mod languages;
pub mod redis;
pub mod types;
