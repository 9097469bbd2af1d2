//! Three-way diff between a desired and an observed rule collection.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::rule::Rule;

/// Mutation applied to a single rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Names to create, update, delete and leave alone. Each list is sorted and
/// the four lists are pairwise disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleDiff {
    pub to_create: Vec<String>,
    pub to_update: Vec<String>,
    pub to_delete: Vec<String>,
    pub unchanged: Vec<String>,
}

impl RuleDiff {
    pub fn compute<R: Rule>(
        desired: &BTreeMap<String, R>,
        observed: &BTreeMap<String, R>,
    ) -> Self {
        let mut diff = RuleDiff::default();

        for (name, want) in desired {
            match observed.get(name) {
                None => diff.to_create.push(name.clone()),
                Some(have) if have != want => diff.to_update.push(name.clone()),
                Some(_) => diff.unchanged.push(name.clone()),
            }
        }

        diff.to_delete = observed
            .keys()
            .filter(|name| !desired.contains_key(*name))
            .cloned()
            .collect();

        diff
    }

    /// True when nothing needs to change.
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    /// Number of mutating calls this diff requires.
    pub fn changes(&self) -> usize {
        self.to_create.len() + self.to_update.len() + self.to_delete.len()
    }

    /// Every mutation as `(name, action)`, deletes first.
    pub fn actions(&self) -> impl Iterator<Item = (&str, Action)> {
        let deletes = self.to_delete.iter().map(|n| (n.as_str(), Action::Delete));
        let creates = self.to_create.iter().map(|n| (n.as_str(), Action::Create));
        let updates = self.to_update.iter().map(|n| (n.as_str(), Action::Update));
        deletes.chain(creates).chain(updates)
    }
}
