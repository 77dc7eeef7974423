//! Request handlers organized by resource.

pub mod badge;
pub mod builders;
pub mod changes;
pub mod health;
pub mod requests;
pub mod workers;
