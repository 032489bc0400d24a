// Path: crates/targeting/src/lib.rs
//! # Herd Targeting
//!
//! Evaluates target expressions against the minion inventory. The same
//! matcher code runs in two places: the master pre-filters a publication's
//! target set where it holds the required metadata, and every minion
//! re-evaluates the raw expression locally as the soundness backstop.
#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::indexing_slicing
    )
)]

pub mod compound;
pub mod inventory;
pub mod matchers;

pub use compound::expand_nodegroups;
pub use inventory::{FactsDomain, InventoryView, MinionFacts};
pub use matchers::matches;

use herd_types::error::UserError;
use herd_types::target::{MatcherKind, TargetSpec};
use herd_types::MinionId;
use std::collections::BTreeSet;

/// The outcome of server-side target resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The candidate minion set.
    pub minions: BTreeSet<MinionId>,
    /// True when the set was pre-filtered from master-held metadata.
    /// False means the master lacks a required cache and the publication
    /// degrades to broadcast with minion-side filtering; `minions` then
    /// holds every known minion as the upper bound.
    pub exact: bool,
}

/// Resolves a target expression against the master's inventory.
///
/// Nodegroup references are expanded first, so the returned spec (and the
/// publication built from it) never leaks a master-only indirection to
/// minions that cannot resolve it.
pub fn resolve(
    view: &dyn InventoryView,
    spec: &TargetSpec,
) -> Result<(TargetSpec, Resolution), UserError> {
    let spec = expand_spec(view, spec)?;
    let required = matchers::required_domains(&spec)?;
    let exact = required.iter().all(|d| view.has_cache(*d));

    let ids = view.minion_ids();
    if !exact {
        return Ok((
            spec,
            Resolution {
                minions: ids.into_iter().collect(),
                exact: false,
            },
        ));
    }

    let empty = MinionFacts::default();
    let mut minions = BTreeSet::new();
    for id in ids {
        let facts = view.facts(&id);
        let facts = facts.as_ref().unwrap_or(&empty);
        if matchers::matches(&id, facts, &spec)? {
            minions.insert(id);
        }
    }
    Ok((spec, Resolution { minions, exact: true }))
}

fn expand_spec(view: &dyn InventoryView, spec: &TargetSpec) -> Result<TargetSpec, UserError> {
    match spec.kind {
        MatcherKind::NodeGroup => {
            let expanded = view
                .nodegroup(&spec.expr)
                .ok_or_else(|| UserError::InvalidTarget(format!("unknown nodegroup: {}", spec.expr)))?;
            let expanded = expand_nodegroups(&expanded, &|n| view.nodegroup(n), 0)?;
            Ok(TargetSpec::new(expanded, MatcherKind::Compound))
        }
        MatcherKind::Compound => {
            let expanded = expand_nodegroups(&spec.expr, &|n| view.nodegroup(n), 0)?;
            Ok(TargetSpec::new(expanded, MatcherKind::Compound))
        }
        _ => Ok(spec.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    struct FixedView {
        facts: HashMap<MinionId, MinionFacts>,
        ids: Vec<MinionId>,
        groups: HashMap<String, String>,
        missing: Vec<FactsDomain>,
    }

    impl InventoryView for FixedView {
        fn minion_ids(&self) -> Vec<MinionId> {
            self.ids.clone()
        }
        fn facts(&self, id: &MinionId) -> Option<MinionFacts> {
            self.facts.get(id).cloned()
        }
        fn nodegroup(&self, name: &str) -> Option<String> {
            self.groups.get(name).cloned()
        }
        fn has_cache(&self, domain: FactsDomain) -> bool {
            !self.missing.contains(&domain)
        }
    }

    fn linux_facts() -> MinionFacts {
        MinionFacts {
            grains: json!({"os": "Linux"}).as_object().cloned().unwrap_or_default(),
            ..Default::default()
        }
    }

    fn view() -> FixedView {
        let ids: Vec<MinionId> = ["m1", "m2", "m3", "m4", "m5"]
            .iter()
            .map(|s| MinionId::new(*s))
            .collect();
        let mut facts = HashMap::new();
        // m3 has no grain data at all; the rest are Linux.
        for id in ["m1", "m2", "m4"] {
            facts.insert(MinionId::new(id), linux_facts());
        }
        facts.insert(MinionId::new("m5"), MinionFacts::default());
        FixedView {
            facts,
            ids,
            groups: HashMap::new(),
            missing: vec![],
        }
    }

    #[test]
    fn test_compound_prefilter() {
        // The S5 shape: grains held for m1, m2, m4; list pins m1, m2.
        let spec = TargetSpec::new("G@os:Linux and L@m1,m2", MatcherKind::Compound);
        let (_, res) = resolve(&view(), &spec).unwrap();
        assert!(res.exact);
        let got: Vec<&str> = res.minions.iter().map(|m| m.as_str()).collect();
        assert_eq!(got, vec!["m1", "m2"]);
    }

    #[test]
    fn test_missing_cache_degrades_to_broadcast() {
        let mut v = view();
        v.missing.push(FactsDomain::Grains);
        let spec = TargetSpec::new("G@os:Linux", MatcherKind::Grain);
        let (_, res) = resolve(&v, &spec).unwrap();
        assert!(!res.exact);
        assert_eq!(res.minions.len(), 5);
    }

    #[test]
    fn test_nodegroup_expands_before_publication() {
        let mut v = view();
        v.groups
            .insert("web".to_string(), "G@os:Linux and L@m1,m2".to_string());
        let spec = TargetSpec::new("web", MatcherKind::NodeGroup);
        let (expanded, res) = resolve(&v, &spec).unwrap();
        assert_eq!(expanded.kind, MatcherKind::Compound);
        assert!(!expanded.expr.contains("N@"));
        assert_eq!(res.minions.len(), 2);
    }

    #[test]
    fn test_glob_needs_no_facts() {
        let spec = TargetSpec::glob("m*");
        let (_, res) = resolve(&view(), &spec).unwrap();
        assert_eq!(res.minions.len(), 5);
    }

    #[test]
    fn test_unknown_nodegroup_is_user_error() {
        let spec = TargetSpec::new("nope", MatcherKind::NodeGroup);
        assert!(matches!(
            resolve(&view(), &spec),
            Err(UserError::InvalidTarget(_))
        ));
    }
}
