//! Data models

pub mod instance;
