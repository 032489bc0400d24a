// Path: crates/types/src/event.rs

//! Tag-routed event records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single event on the in-process bus.
///
/// Tags are forward-slash-delimited paths (`herd/job/<jid>/new`);
/// subscribers match on literal tags, prefixes, or globs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    /// The routing tag.
    pub tag: String,
    /// Arbitrary event payload.
    pub data: Map<String, Value>,
    /// When the event was fired.
    #[serde(rename = "_stamp")]
    pub stamp: DateTime<Utc>,
}

impl Event {
    /// Builds an event stamped with the current instant.
    pub fn new(tag: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            tag: tag.into(),
            data,
            stamp: Utc::now(),
        }
    }

    /// Builds an event whose payload is a single key/value pair.
    pub fn single(tag: impl Into<String>, key: &str, value: Value) -> Self {
        let mut data = Map::new();
        data.insert(key.to_string(), value);
        Self::new(tag, data)
    }
}
