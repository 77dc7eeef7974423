//! Kiln Core
//!
//! Core domain types, traits, and error handling for Kiln.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates.

pub mod build;
pub mod builder;
pub mod capability;
pub mod change;
pub mod error;
pub mod events;
pub mod ids;
pub mod ports;
pub mod protocol;
pub mod worker;

pub use error::{Error, Result};
pub use ids::*;
