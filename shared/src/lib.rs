//! Shared types and models for the AidFlow aid-logistics platform
//!
//! This crate contains the domain model, the pure business-rule helpers and
//! the typed permission model shared between the backend and its tests.

pub mod models;
pub mod permissions;
pub mod types;
pub mod validation;

pub use models::*;
pub use permissions::*;
pub use types::*;
pub use validation::*;
