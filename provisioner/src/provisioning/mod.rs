//! Provisioning orchestration
//!
//! - `catalog`: per-backend step lists
//! - `progress`: the per-run record and its transitions
//! - `orchestrator`: in-memory tracker with timeout and eviction timers
//! - `hub`: push channel with log replay
//! - `runner`: drives a target through its catalog
//! - `status`: progress lookup with a persisted-status fallback

pub mod catalog;
pub mod hub;
pub mod orchestrator;
pub mod progress;
pub mod runner;
pub mod status;
