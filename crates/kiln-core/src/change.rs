//! Change types.

use crate::ids::ChangeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A change notification exactly as the hook sender posted it, before
/// validation. Every field is optional here; ingest decides what is missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawChange {
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
}

/// A validated source mutation. Immutable once minted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    pub branch: String,
    pub revision: String,
    pub timestamp: DateTime<Utc>,
    pub author: Option<String>,
    pub comments: Option<String>,
    pub received_at: DateTime<Utc>,
}
