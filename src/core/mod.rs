pub mod agent;
pub mod config;
pub mod lifecycle;
pub mod orchestrator;
pub mod status;
pub mod store;
pub mod tasks;
pub mod terminal;
pub mod webhook;
