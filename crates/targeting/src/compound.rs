// Path: crates/targeting/src/compound.rs
//! The compound matcher: a boolean expression over the other matchers.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! or_expr  := and_expr ( "or" and_expr )*
//! and_expr := not_expr ( "and" not_expr )*
//! not_expr := "not" not_expr | primary
//! primary  := "(" or_expr ")" | leaf
//! ```
//!
//! A leaf is a single word, optionally prefixed to pick its matcher:
//! `G@` grain, `E@` pcre, `P@` grain-pcre, `L@` list, `I@` pillar,
//! `J@` pillar-pcre, `S@` ipcidr, `N@` nodegroup; a bare word is a glob.
//! Nodegroup references are expanded server-side before a publication is
//! built, so `N@` never reaches minion-side evaluation.

use crate::inventory::MinionFacts;
use crate::matchers;
use herd_types::error::UserError;
use herd_types::target::MatcherKind;
use herd_types::MinionId;

const MAX_NODEGROUP_DEPTH: usize = 8;

fn bad(expr: &str, why: impl std::fmt::Display) -> UserError {
    UserError::InvalidTarget(format!("{:?}: {}", expr, why))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open,
    Close,
    And,
    Or,
    Not,
    Leaf(String),
}

fn lex(expr: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for word in expr.split_whitespace() {
        let mut rest = word;
        let mut pending_close = 0usize;
        while let Some(stripped) = rest.strip_prefix('(') {
            tokens.push(Token::Open);
            rest = stripped;
        }
        while let Some(stripped) = rest.strip_suffix(')') {
            pending_close += 1;
            rest = stripped;
        }
        match rest {
            "" => {}
            "and" => tokens.push(Token::And),
            "or" => tokens.push(Token::Or),
            "not" => tokens.push(Token::Not),
            leaf => tokens.push(Token::Leaf(leaf.to_string())),
        }
        for _ in 0..pending_close {
            tokens.push(Token::Close);
        }
    }
    tokens
}

#[derive(Debug, Clone)]
enum Expr {
    Leaf(MatcherKind, String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_or(&mut self) -> Result<Expr, UserError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, UserError> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, UserError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, UserError> {
        match self.next().cloned() {
            Some(Token::Open) => {
                let inner = self.parse_or()?;
                if self.next() != Some(&Token::Close) {
                    return Err(bad(self.source, "unbalanced parenthesis"));
                }
                Ok(inner)
            }
            Some(Token::Leaf(word)) => {
                let (kind, expr) = split_leaf(&word);
                Ok(Expr::Leaf(kind, expr))
            }
            other => Err(bad(self.source, format!("unexpected token {:?}", other))),
        }
    }
}

fn split_leaf(word: &str) -> (MatcherKind, String) {
    let kind = match word.get(..2) {
        Some("G@") => MatcherKind::Grain,
        Some("E@") => MatcherKind::Pcre,
        Some("P@") => MatcherKind::GrainPcre,
        Some("L@") => MatcherKind::List,
        Some("I@") => MatcherKind::Pillar,
        Some("J@") => MatcherKind::PillarPcre,
        Some("S@") => MatcherKind::IpCidr,
        Some("N@") => MatcherKind::NodeGroup,
        _ => return (MatcherKind::Glob, word.to_string()),
    };
    (kind, word.get(2..).unwrap_or_default().to_string())
}

fn parse(expr: &str) -> Result<Expr, UserError> {
    let tokens = lex(expr);
    if tokens.is_empty() {
        return Err(bad(expr, "empty compound expression"));
    }
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        source: expr,
    };
    let ast = parser.parse_or()?;
    if parser.pos != tokens.len() {
        return Err(bad(expr, "trailing tokens"));
    }
    Ok(ast)
}

fn eval(id: &MinionId, facts: &MinionFacts, expr: &Expr) -> Result<bool, UserError> {
    match expr {
        Expr::Leaf(kind, leaf) => matchers::matches(
            id,
            facts,
            &herd_types::target::TargetSpec::new(leaf.clone(), *kind),
        ),
        Expr::Not(inner) => Ok(!eval(id, facts, inner)?),
        Expr::And(a, b) => Ok(eval(id, facts, a)? && eval(id, facts, b)?),
        Expr::Or(a, b) => Ok(eval(id, facts, a)? || eval(id, facts, b)?),
    }
}

/// Evaluates a compound expression against one minion.
pub fn matches(id: &MinionId, facts: &MinionFacts, expr: &str) -> Result<bool, UserError> {
    eval(id, facts, &parse(expr)?)
}

/// The matcher kinds appearing as leaves, for cache-requirement checks.
pub fn leaf_kinds(expr: &str) -> Result<Vec<MatcherKind>, UserError> {
    fn walk(expr: &Expr, out: &mut Vec<MatcherKind>) {
        match expr {
            Expr::Leaf(kind, _) => out.push(*kind),
            Expr::Not(inner) => walk(inner, out),
            Expr::And(a, b) | Expr::Or(a, b) => {
                walk(a, out);
                walk(b, out);
            }
        }
    }
    let mut out = Vec::new();
    walk(&parse(expr)?, &mut out);
    Ok(out)
}

/// Rewrites every `N@group` leaf to the group's parenthesised definition.
///
/// Runs to fixpoint so groups may reference groups, bounded to refuse
/// definition cycles.
pub fn expand_nodegroups(
    expr: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
    depth: usize,
) -> Result<String, UserError> {
    if depth >= MAX_NODEGROUP_DEPTH {
        return Err(bad(expr, "nodegroup nesting too deep (cycle?)"));
    }
    let mut expanded = false;
    let mut words = Vec::new();
    for word in expr.split_whitespace() {
        let trimmed_front = word.trim_start_matches('(');
        let open_count = word.len() - trimmed_front.len();
        let core = trimmed_front.trim_end_matches(')');
        let close_count = trimmed_front.len() - core.len();
        if let Some(name) = core.strip_prefix("N@") {
            let definition = lookup(name)
                .ok_or_else(|| UserError::InvalidTarget(format!("unknown nodegroup: {}", name)))?;
            words.push(format!(
                "{}( {} ){}",
                "(".repeat(open_count),
                definition,
                ")".repeat(close_count)
            ));
            expanded = true;
        } else {
            words.push(word.to_string());
        }
    }
    let joined = words.join(" ");
    if expanded {
        expand_nodegroups(&joined, lookup, depth + 1)
    } else {
        Ok(joined)
    }
}
