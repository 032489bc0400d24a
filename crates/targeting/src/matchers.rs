// Path: crates/targeting/src/matchers.rs
//! The matcher implementations.
//!
//! `matches` is the single entry point: given one minion's id and facts,
//! does the target select it? Grain and pillar expressions use
//! colon-delimited paths with the split point probed at every depth, so
//! `ec2:tags:role:web*` matches whether `role` is a leaf or a subtree key.

use crate::compound;
use crate::inventory::{FactsDomain, MinionFacts};
use herd_types::error::UserError;
use herd_types::target::{MatcherKind, TargetSpec};
use herd_types::MinionId;
use ipnet::IpNet;
use serde_json::{Map, Value};

fn bad(expr: &str, why: impl std::fmt::Display) -> UserError {
    UserError::InvalidTarget(format!("{:?}: {}", expr, why))
}

/// Evaluates one target spec against one minion.
pub fn matches(id: &MinionId, facts: &MinionFacts, spec: &TargetSpec) -> Result<bool, UserError> {
    match spec.kind {
        MatcherKind::Glob => match_glob(id, &spec.expr),
        MatcherKind::List => Ok(match_list(id, &spec.expr)),
        MatcherKind::Pcre => match_pcre(id, &spec.expr),
        MatcherKind::Grain => subdict_match(&facts.grains, &spec.expr, false),
        MatcherKind::GrainPcre => subdict_match(&facts.grains, &spec.expr, true),
        MatcherKind::Pillar => subdict_match(&facts.pillar, &spec.expr, false),
        MatcherKind::PillarPcre => subdict_match(&facts.pillar, &spec.expr, true),
        MatcherKind::IpCidr => match_ipcidr(facts, &spec.expr),
        MatcherKind::NodeGroup => Err(bad(
            &spec.expr,
            "nodegroups must be expanded before evaluation",
        )),
        MatcherKind::Compound => compound::matches(id, facts, &spec.expr),
    }
}

/// The metadata domains a spec needs for server-side pre-filtering.
pub fn required_domains(spec: &TargetSpec) -> Result<Vec<FactsDomain>, UserError> {
    let kinds = match spec.kind {
        MatcherKind::Compound => compound::leaf_kinds(&spec.expr)?,
        kind => vec![kind],
    };
    let mut out = Vec::new();
    for kind in kinds {
        let domain = match kind {
            MatcherKind::Grain | MatcherKind::GrainPcre => Some(FactsDomain::Grains),
            MatcherKind::Pillar | MatcherKind::PillarPcre => Some(FactsDomain::Pillar),
            MatcherKind::IpCidr => Some(FactsDomain::Addresses),
            _ => None,
        };
        if let Some(domain) = domain {
            if !out.contains(&domain) {
                out.push(domain);
            }
        }
    }
    Ok(out)
}

pub(crate) fn match_glob(id: &MinionId, expr: &str) -> Result<bool, UserError> {
    let pattern = glob::Pattern::new(expr).map_err(|e| bad(expr, e))?;
    Ok(pattern.matches(id.as_str()))
}

pub(crate) fn match_list(id: &MinionId, expr: &str) -> bool {
    expr.split(',').any(|part| part.trim() == id.as_str())
}

pub(crate) fn match_pcre(id: &MinionId, expr: &str) -> Result<bool, UserError> {
    let re = regex::Regex::new(expr).map_err(|e| bad(expr, e))?;
    Ok(re.is_match(id.as_str()))
}

pub(crate) fn match_ipcidr(facts: &MinionFacts, expr: &str) -> Result<bool, UserError> {
    if let Ok(net) = expr.parse::<IpNet>() {
        return Ok(facts.addrs.iter().any(|a| net.contains(a)));
    }
    if let Ok(addr) = expr.parse::<std::net::IpAddr>() {
        return Ok(facts.addrs.contains(&addr));
    }
    Err(bad(expr, "not a CIDR block or address"))
}

/// Matches `key[:key...]:pattern` against nested data, probing the split
/// point at every depth.
pub(crate) fn subdict_match(
    data: &Map<String, Value>,
    expr: &str,
    regex_match: bool,
) -> Result<bool, UserError> {
    let parts: Vec<&str> = expr.split(':').collect();
    if parts.len() < 2 {
        return Err(bad(expr, "expected key:pattern"));
    }
    for split in 1..parts.len() {
        let Some(path) = parts.get(..split) else { break };
        let Some(rest) = parts.get(split..) else { break };
        let pattern = rest.join(":");
        if let Some(value) = traverse(data, path) {
            if value_matches(value, &pattern, regex_match)? {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn traverse<'a>(data: &'a Map<String, Value>, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = data.get(*first)?;
    for key in rest {
        current = current.as_object()?.get(*key)?;
    }
    Some(current)
}

fn value_matches(value: &Value, pattern: &str, regex_match: bool) -> Result<bool, UserError> {
    match value {
        Value::Array(items) => {
            for item in items {
                if value_matches(item, pattern, regex_match)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::Object(_) => Ok(false),
        Value::Null => Ok(false),
        Value::String(s) => scalar_matches(s, pattern, regex_match),
        other => scalar_matches(&other.to_string(), pattern, regex_match),
    }
}

fn scalar_matches(value: &str, pattern: &str, regex_match: bool) -> Result<bool, UserError> {
    if regex_match {
        let re = regex::Regex::new(pattern).map_err(|e| bad(pattern, e))?;
        Ok(re.is_match(value))
    } else {
        let p = glob::Pattern::new(pattern).map_err(|e| bad(pattern, e))?;
        Ok(p.matches(value))
    }
}
