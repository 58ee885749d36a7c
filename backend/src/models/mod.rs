//! Data models shared with the `shared` crate

pub use shared::models::*;
