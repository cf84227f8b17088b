//! Fleet Provisioner Library
//!
//! Provisioning orchestration for messaging-bot gateway instances across
//! container backends.

pub mod app;
pub mod errors;
pub mod logs;
pub mod models;
pub mod providers;
pub mod provisioning;
pub mod server;
pub mod settings;
pub mod targets;
pub mod utils;
pub mod workers;
