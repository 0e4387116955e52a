//! # LeadPilot Core
//!
//! Shared data model, error taxonomy, configuration and the trait boundaries
//! (datastore, composer, outbound sender) used by the engine crates.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{BusinessHours, LeadPilotConfig, ProgressionMode};
pub use error::{LeadPilotError, Result};
