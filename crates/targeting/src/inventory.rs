// Path: crates/targeting/src/inventory.rs
//! The inventory view the matchers evaluate against.

use herd_types::MinionId;
use serde_json::{Map, Value};
use std::net::IpAddr;

/// Which metadata domain a matcher needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FactsDomain {
    /// Static per-minion grain data.
    Grains,
    /// Per-minion pillar data.
    Pillar,
    /// Minion-reported addresses.
    Addresses,
}

/// Everything known about one minion for matching purposes.
#[derive(Clone, Debug, Default)]
pub struct MinionFacts {
    /// Grain data; empty when the master has not seen any.
    pub grains: Map<String, Value>,
    /// Pillar data; empty when none is compiled for this minion.
    pub pillar: Map<String, Value>,
    /// Addresses the minion reported.
    pub addrs: Vec<IpAddr>,
}

/// What target resolution needs from the master: the known minion ids,
/// their facts, the nodegroup table, and which caches are populated at
/// all. A master that holds no pillar cache reports it missing and grain
/// targets degrade to broadcast rather than silently matching nothing.
pub trait InventoryView: Send + Sync {
    /// Every minion id eligible for targeting (the accepted set).
    fn minion_ids(&self) -> Vec<MinionId>;

    /// Facts for one minion; `None` when nothing has been cached.
    fn facts(&self, id: &MinionId) -> Option<MinionFacts>;

    /// Looks up a named target group from config.
    fn nodegroup(&self, name: &str) -> Option<String>;

    /// Whether the master holds the given metadata domain at all.
    fn has_cache(&self, domain: FactsDomain) -> bool {
        let _ = domain;
        true
    }
}
