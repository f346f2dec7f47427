pub mod agents;
pub mod status;
pub mod tasks;
pub mod webhooks;
