//! Rule values and named rule sets.

use std::collections::btree_map;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A rule value stored under a name in a remote collection.
///
/// The name is the map key of a [`RuleSet`]; equality on the value compares
/// every other field. Values are never mutated in place, a change is a new
/// value.
pub trait Rule: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Check the value the same way a single-rule create would.
    fn validate(&self, name: &str) -> Result<(), ValidationError>;

    /// Remote identity of a rule name. Two names with the same identity
    /// address the same remote rule.
    fn identity(name: &str) -> String {
        name.to_ascii_lowercase()
    }
}

/// Firewall rule admitting an inclusive IP address range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub start_address: String,
    pub end_address: String,
}

impl FirewallRule {
    pub fn new(start_address: impl Into<String>, end_address: impl Into<String>) -> Self {
        Self {
            start_address: start_address.into(),
            end_address: end_address.into(),
        }
    }

    /// Rule admitting exactly one address.
    pub fn single(address: impl Into<String>) -> Self {
        let address = address.into();
        Self::new(address.clone(), address)
    }
}

fn parse_address(name: &str, field: &'static str, value: &str) -> Result<IpAddr, ValidationError> {
    value
        .parse::<IpAddr>()
        .map_err(|_| ValidationError::InvalidAddress {
            name: name.to_string(),
            field,
            value: value.to_string(),
        })
}

impl Rule for FirewallRule {
    fn validate(&self, name: &str) -> Result<(), ValidationError> {
        let start = parse_address(name, "start_address", &self.start_address)?;
        let end = parse_address(name, "end_address", &self.end_address)?;

        let inverted = match (start, end) {
            (IpAddr::V4(s), IpAddr::V4(e)) => s > e,
            (IpAddr::V6(s), IpAddr::V6(e)) => s > e,
            _ => {
                return Err(ValidationError::AddressFamilyMismatch {
                    name: name.to_string(),
                })
            }
        };

        if inverted {
            return Err(ValidationError::InvertedRange {
                name: name.to_string(),
                start: self.start_address.clone(),
                end: self.end_address.clone(),
            });
        }
        Ok(())
    }
}

/// A mapping from rule name to rule, ordered by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet<R> {
    rules: BTreeMap<String, R>,
}

impl<R> Default for RuleSet<R> {
    fn default() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }
}

impl<R: Rule> RuleSet<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing map without checking it. Use [`RuleSet::validate`]
    /// before trusting it as desired input.
    pub fn from_map(rules: BTreeMap<String, R>) -> Self {
        Self { rules }
    }

    /// Insert a rule, rejecting empty names, duplicates and names that
    /// collide with an existing one on remote identity.
    pub fn insert(&mut self, name: impl Into<String>, rule: R) -> Result<(), ValidationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.rules.contains_key(&name) {
            return Err(ValidationError::DuplicateName(name));
        }
        let identity = R::identity(&name);
        if let Some(existing) = self.rules.keys().find(|n| R::identity(n) == identity) {
            return Err(ValidationError::NameCollision {
                first: existing.clone(),
                second: name,
            });
        }
        self.rules.insert(name, rule);
        Ok(())
    }

    /// Check every name and every rule value.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut identities: HashMap<String, &str> = HashMap::with_capacity(self.rules.len());
        for (name, rule) in &self.rules {
            if name.is_empty() {
                return Err(ValidationError::EmptyName);
            }
            if let Some(first) = identities.insert(R::identity(name), name.as_str()) {
                return Err(ValidationError::NameCollision {
                    first: first.to_string(),
                    second: name.clone(),
                });
            }
            rule.validate(name)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&R> {
        self.rules.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, R> {
        self.rules.iter()
    }

    pub fn as_map(&self) -> &BTreeMap<String, R> {
        &self.rules
    }

    pub fn into_map(self) -> BTreeMap<String, R> {
        self.rules
    }
}

impl<'a, R> IntoIterator for &'a RuleSet<R> {
    type Item = (&'a String, &'a R);
    type IntoIter = btree_map::Iter<'a, String, R>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.iter()
    }
}
