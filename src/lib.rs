#![forbid(unsafe_code)]

//! Channel video synchronization and presentation filters for the TubeIntel
//! dashboard.

pub mod config;
pub mod error;
pub mod filters;
pub mod library;
pub mod logging;
pub mod models;
pub mod store;
pub mod sync;
pub mod youtube;
