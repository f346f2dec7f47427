//! Self-tuning maintenance agents, a priority task queue with bounded
//! dispatch, and the control API and client that sit in front of them.

pub mod cli;
pub mod client;
pub mod core;
pub mod interfaces;
mod logging;
pub mod platform;
