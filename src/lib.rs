//! Worker Pool: lease-based task dispatch for remote workers.

pub mod auth;
pub mod catalog;
pub mod config;
pub mod directory;
pub mod error;
pub mod http;
pub mod lease;
pub mod model;
pub mod pool;
pub mod reconciler;
pub mod recorder;
pub mod store;
