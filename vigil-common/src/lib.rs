//! # Vigil Common Library
//!
//! Shared code for the Vigil threat-scan services:
//! - Error type shared across crates
//! - TOML bootstrap configuration and resolution order
//! - Alert/scan event types and the topic-aware EventBus
//! - Time helpers (quota periods, digest windows)

pub mod config;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
pub use events::{AlertEvent, EventBus, GeoPoint, ThreatEvent, Tier, Topic, WORK_TOPICS};
