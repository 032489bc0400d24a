// Path: crates/master/src/inventory.rs
//! The master's view of its minions: who is accepted, who is alive, and
//! the grain/pillar/address caches the targeting engine pre-filters on.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use herd_pki::{KeyState, KeyStore};
use herd_targeting::{FactsDomain, InventoryView, MinionFacts};
use herd_types::MinionId;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

struct LiveEntry {
    facts: MinionFacts,
    last_seen: DateTime<Utc>,
}

/// Liveness view plus metadata caches, fed by auth completions and
/// heartbeats. Reads dominate: every publication resolves targets against
/// this.
pub struct MasterInventory {
    keystore: Arc<KeyStore>,
    nodegroups: HashMap<String, String>,
    live: RwLock<HashMap<MinionId, LiveEntry>>,
}

impl MasterInventory {
    /// Builds the inventory over the key store and the configured
    /// nodegroup table.
    pub fn new(keystore: Arc<KeyStore>, nodegroups: HashMap<String, String>) -> Self {
        Self {
            keystore,
            nodegroups,
            live: RwLock::new(HashMap::new()),
        }
    }

    /// Records a heartbeat: refreshes `last_seen`, the grain cache, and
    /// the minion's reported address.
    pub fn observe_heartbeat(
        &self,
        id: &MinionId,
        grains: Map<String, Value>,
        addr: Option<IpAddr>,
    ) {
        let mut live = self.live.write();
        let entry = live.entry(id.clone()).or_insert_with(|| LiveEntry {
            facts: MinionFacts::default(),
            last_seen: Utc::now(),
        });
        entry.last_seen = Utc::now();
        if !grains.is_empty() {
            entry.facts.grains = grains;
        }
        if let Some(addr) = addr {
            if !entry.facts.addrs.contains(&addr) {
                entry.facts.addrs.push(addr);
            }
        }
    }

    /// Refreshes `last_seen` without new metadata (e.g. on a return).
    pub fn mark_seen(&self, id: &MinionId) {
        let mut live = self.live.write();
        if let Some(entry) = live.get_mut(id) {
            entry.last_seen = Utc::now();
        }
    }

    /// Installs pillar data for a minion. The core never compiles pillar
    /// itself; an external feed (or a test) populates this cache, and
    /// pillar targeting degrades to broadcast until one does.
    pub fn set_pillar(&self, id: &MinionId, pillar: Map<String, Value>) {
        let mut live = self.live.write();
        let entry = live.entry(id.clone()).or_insert_with(|| LiveEntry {
            facts: MinionFacts::default(),
            last_seen: Utc::now(),
        });
        entry.facts.pillar = pillar;
    }

    /// Minions seen within `window`.
    pub fn up(&self, window: ChronoDuration) -> Vec<MinionId> {
        let cutoff = Utc::now() - window;
        let live = self.live.read();
        let mut out: Vec<MinionId> = live
            .iter()
            .filter(|(_, e)| e.last_seen >= cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        out.sort();
        out
    }

    /// Accepted minions not seen within `window`.
    pub fn down(&self, window: ChronoDuration) -> Vec<MinionId> {
        let up = self.up(window);
        let mut out: Vec<MinionId> = self
            .minion_ids()
            .into_iter()
            .filter(|id| !up.contains(id))
            .collect();
        out.sort();
        out
    }

    /// Drops the liveness entry (quarantine / key deletion path).
    pub fn forget(&self, id: &MinionId) {
        self.live.write().remove(id);
    }
}

impl InventoryView for MasterInventory {
    fn minion_ids(&self) -> Vec<MinionId> {
        self.keystore
            .list_by_state(KeyState::Accepted)
            .unwrap_or_default()
    }

    fn facts(&self, id: &MinionId) -> Option<MinionFacts> {
        self.live.read().get(id).map(|e| e.facts.clone())
    }

    fn nodegroup(&self, name: &str) -> Option<String> {
        self.nodegroups.get(name).cloned()
    }

    fn has_cache(&self, domain: FactsDomain) -> bool {
        let live = self.live.read();
        match domain {
            FactsDomain::Grains => live.values().any(|e| !e.facts.grains.is_empty()),
            FactsDomain::Pillar => live.values().any(|e| !e.facts.pillar.is_empty()),
            FactsDomain::Addresses => live.values().any(|e| !e.facts.addrs.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, Arc<KeyStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(KeyStore::open(dir.path()).unwrap());
        (dir, store)
    }

    #[test]
    fn test_heartbeat_feeds_grain_cache() {
        let (_dir, keystore) = store();
        let inv = MasterInventory::new(keystore, HashMap::new());
        assert!(!inv.has_cache(FactsDomain::Grains));

        let grains = json!({"os": "Linux"}).as_object().cloned().unwrap();
        inv.observe_heartbeat(&MinionId::new("m1"), grains, Some("10.0.0.1".parse().unwrap()));

        assert!(inv.has_cache(FactsDomain::Grains));
        assert!(inv.has_cache(FactsDomain::Addresses));
        assert!(!inv.has_cache(FactsDomain::Pillar));
        let facts = inv.facts(&MinionId::new("m1")).unwrap();
        assert_eq!(facts.grains["os"], json!("Linux"));
    }

    #[test]
    fn test_up_down_split() {
        let (_dir, keystore) = store();
        keystore
            .enroll_pending(&MinionId::new("m1"), "PEM")
            .unwrap();
        keystore.accept(&MinionId::new("m1")).unwrap();
        keystore
            .enroll_pending(&MinionId::new("m2"), "PEM")
            .unwrap();
        keystore.accept(&MinionId::new("m2")).unwrap();

        let inv = MasterInventory::new(keystore, HashMap::new());
        inv.observe_heartbeat(&MinionId::new("m1"), Map::new(), None);

        let window = ChronoDuration::seconds(60);
        assert_eq!(inv.up(window), vec![MinionId::new("m1")]);
        assert_eq!(inv.down(window), vec![MinionId::new("m2")]);
    }
}
