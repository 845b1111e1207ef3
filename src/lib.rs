pub mod types;
pub mod config;
pub mod data;
pub mod processing;
pub mod render;
pub mod server;
