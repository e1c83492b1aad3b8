pub mod commands;
pub mod config;
pub mod engine;
pub mod logging;
pub mod registry;
pub mod store;
