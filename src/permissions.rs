//! Declarative permission rules for traffic crossing the bridge.
//!
//! Two independent rule lists govern the two directions of travel. Rules
//! are evaluated in declared order and the first match wins; an empty list
//! rejects everything, and a single empty rule accepts everything.

use dashmap::DashMap;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Direction of travel for a message being checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Client to bus.
    Inbound,
    /// Bus to client.
    Outbound,
}

/// A single permission rule.
///
/// At most one of `address` and `address_re` should be set; when both are
/// present the literal address takes precedence. Absence of both matches
/// any address. `match` constrains top-level body fields by deep equality
/// and only applies to JSON object bodies; other body kinds skip the
/// structural check rather than failing it.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PermittedRule {
    /// Literal address to match.
    pub address: Option<String>,
    /// Regular expression the whole address must match.
    pub address_re: Option<String>,
    /// Required top-level body fields.
    #[serde(rename = "match")]
    pub match_fields: Option<Map<String, Value>>,
    /// Whether messages admitted by this rule need an authorised session.
    #[serde(default)]
    pub requires_auth: bool,
}

impl PermittedRule {
    /// Rule matching the given literal address with no body constraints.
    #[must_use]
    pub fn literal(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }
}

/// Outcome of a rule check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Match {
    /// Whether any rule admitted the message.
    pub does_match: bool,
    /// Whether the admitting rule demands authorisation.
    pub requires_auth: bool,
}

impl Match {
    pub(crate) const REJECTED: Self = Self {
        does_match: false,
        requires_auth: false,
    };

    /// Unconditional acceptance used for whitelisted reply traffic.
    pub(crate) const REPLY: Self = Self {
        does_match: true,
        requires_auth: false,
    };
}

/// Ordered inbound and outbound rule lists with a memoised regex cache.
///
/// Rules are immutable after construction, so compiled expressions are
/// cached for the lifetime of the bridge and never invalidated.
#[derive(Debug, Default)]
pub struct RuleSet {
    inbound: Vec<PermittedRule>,
    outbound: Vec<PermittedRule>,
    compiled: DashMap<String, Regex>,
}

impl RuleSet {
    /// Build a rule set from the two permitted lists.
    #[must_use]
    pub fn new(inbound: Vec<PermittedRule>, outbound: Vec<PermittedRule>) -> Self {
        Self {
            inbound,
            outbound,
            compiled: DashMap::new(),
        }
    }

    /// Check `address` and `body` against the rules for `direction`.
    #[must_use]
    pub fn check(&self, direction: Direction, address: &str, body: &Value) -> Match {
        let rules = match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        };
        for rule in rules {
            if self.address_matches(rule, address) && body_matches(rule, body) {
                return Match {
                    does_match: true,
                    requires_auth: rule.requires_auth,
                };
            }
        }
        Match::REJECTED
    }

    fn address_matches(&self, rule: &PermittedRule, address: &str) -> bool {
        if let Some(literal) = &rule.address {
            return literal == address;
        }
        match &rule.address_re {
            Some(pattern) => self.regex_matches(pattern, address),
            None => true,
        }
    }

    /// Whole-address regex match, compiling on first use.
    fn regex_matches(&self, pattern: &str, address: &str) -> bool {
        if let Some(re) = self.compiled.get(pattern) {
            return re.is_match(address);
        }
        match Regex::new(&format!("^(?:{pattern})$")) {
            Ok(re) => {
                let matched = re.is_match(address);
                self.compiled.insert(pattern.to_owned(), re);
                matched
            }
            Err(err) => {
                log::warn!("invalid address_re {pattern:?} treated as non-matching: {err}");
                false
            }
        }
    }
}

fn body_matches(rule: &PermittedRule, body: &Value) -> bool {
    let (Some(fields), Some(object)) = (&rule.match_fields, body.as_object()) else {
        return true;
    };
    fields
        .iter()
        .all(|(key, expected)| object.get(key) == Some(expected))
}
