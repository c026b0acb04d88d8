//! MuseStudio API Library
//!
//! This crate contains the API server components for MuseStudio: the access,
//! intent, and usage endpoints plus the Redis-backed realtime change feed.

pub mod auth;
pub mod config;
pub mod error;
pub mod realtime;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
