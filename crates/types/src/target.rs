// Path: crates/types/src/target.rs

//! Target expressions and matcher kinds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The matcher used to evaluate a target expression against the minion
/// inventory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherKind {
    /// Shell glob against the minion id.
    Glob,
    /// Comma- or list-delimited exact ids.
    List,
    /// Perl-compatible regex against the minion id.
    Pcre,
    /// Match on static per-minion grain data.
    Grain,
    /// Regex match on grain data.
    GrainPcre,
    /// Match on per-minion pillar data.
    Pillar,
    /// Regex match on pillar data.
    PillarPcre,
    /// CIDR match against minion-reported addresses.
    #[serde(rename = "ipcidr")]
    IpCidr,
    /// Indirection through a named group defined in master config.
    #[serde(rename = "nodegroup")]
    NodeGroup,
    /// Boolean expression over the other matchers.
    Compound,
}

impl FromStr for MatcherKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "glob" => Ok(Self::Glob),
            "list" => Ok(Self::List),
            "pcre" => Ok(Self::Pcre),
            "grain" => Ok(Self::Grain),
            "grain_pcre" => Ok(Self::GrainPcre),
            "pillar" => Ok(Self::Pillar),
            "pillar_pcre" => Ok(Self::PillarPcre),
            "ipcidr" => Ok(Self::IpCidr),
            "nodegroup" => Ok(Self::NodeGroup),
            "compound" => Ok(Self::Compound),
            other => Err(format!("unknown matcher kind: {}", other)),
        }
    }
}

impl fmt::Display for MatcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Glob => "glob",
            Self::List => "list",
            Self::Pcre => "pcre",
            Self::Grain => "grain",
            Self::GrainPcre => "grain_pcre",
            Self::Pillar => "pillar",
            Self::PillarPcre => "pillar_pcre",
            Self::IpCidr => "ipcidr",
            Self::NodeGroup => "nodegroup",
            Self::Compound => "compound",
        };
        f.write_str(s)
    }
}

/// A user-supplied predicate selecting which minions a job applies to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    /// The raw expression.
    pub expr: String,
    /// How to interpret it.
    pub kind: MatcherKind,
}

impl TargetSpec {
    /// Builds a target spec.
    pub fn new(expr: impl Into<String>, kind: MatcherKind) -> Self {
        Self {
            expr: expr.into(),
            kind,
        }
    }

    /// Shorthand for the default glob matcher.
    pub fn glob(expr: impl Into<String>) -> Self {
        Self::new(expr, MatcherKind::Glob)
    }
}
