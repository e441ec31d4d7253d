//! Permission index
//!
//! Derived lookup structure keyed by (user, snap, app, permission). Each leaf
//! maps a path pattern to the ID of the one rule which claims it. The index
//! is never authoritative: the rule database can rebuild it from the rule set
//! at any time.

use std::collections::HashMap;

use crate::core::{AccessRuleError, RuleResult};

use super::pattern::PatternMatcher;
use super::rule::{AccessRule, Permission};

/// Address of one index leaf
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexKey {
    /// User ID
    pub user: u32,
    /// Snap name
    pub snap: String,
    /// App name
    pub app: String,
    /// Permission
    pub permission: Permission,
}

impl IndexKey {
    /// Build a key from its parts
    pub fn new(user: u32, snap: impl Into<String>, app: impl Into<String>, permission: Permission) -> Self {
        Self {
            user,
            snap: snap.into(),
            app: app.into(),
            permission,
        }
    }

    /// Key of the leaf holding `rule` for `permission`
    pub fn for_rule(rule: &AccessRule, permission: Permission) -> Self {
        Self::new(rule.user, rule.snap.as_str(), rule.app.as_str(), permission)
    }
}

/// Conflict found while inserting a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConflict {
    /// Rule which already holds the pattern
    pub rule_id: String,
    /// Permission for which the conflict occurred
    pub permission: Permission,
}

impl From<IndexConflict> for AccessRuleError {
    fn from(conflict: IndexConflict) -> Self {
        AccessRuleError::PatternConflict {
            conflicting_id: conflict.rule_id,
            permission: conflict.permission,
        }
    }
}

/// Pattern-to-rule-ID maps for every (user, snap, app, permission)
#[derive(Debug, Clone, Default)]
pub struct PermissionIndex {
    leaves: HashMap<IndexKey, HashMap<String, String>>,
}

impl PermissionIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `pattern` as owned by `rule_id` at `key`.
    ///
    /// Re-inserting the same pattern for the same rule is a no-op; a pattern
    /// held by another rule is a conflict naming that rule.
    pub fn insert(&mut self, key: &IndexKey, pattern: &str, rule_id: &str) -> Result<(), IndexConflict> {
        let leaf = self.leaves.entry(key.clone()).or_default();
        match leaf.get(pattern) {
            Some(existing) if existing != rule_id => Err(IndexConflict {
                rule_id: existing.clone(),
                permission: key.permission,
            }),
            Some(_) => Ok(()),
            None => {
                leaf.insert(pattern.to_string(), rule_id.to_string());
                Ok(())
            }
        }
    }

    /// Remove `pattern` from `key`, provided it is owned by `expected_id`
    pub fn remove(&mut self, key: &IndexKey, pattern: &str, expected_id: &str) -> RuleResult<()> {
        let leaf = self.leaves.get_mut(key).ok_or(AccessRuleError::PatternMissing)?;
        match leaf.get(pattern) {
            None => return Err(AccessRuleError::PatternMissing),
            Some(id) if id != expected_id => return Err(AccessRuleError::RuleIdMismatch),
            Some(_) => {}
        }
        leaf.remove(pattern);
        if leaf.is_empty() {
            self.leaves.remove(key);
        }
        Ok(())
    }

    /// Patterns at `key` which match `path`
    pub fn candidates_matching(&self, key: &IndexKey, path: &str, matcher: &dyn PatternMatcher) -> Vec<&str> {
        let Some(leaf) = self.leaves.get(key) else {
            return Vec::new();
        };
        leaf.keys()
            .filter(|pattern| matcher.matches(pattern, path))
            .map(String::as_str)
            .collect()
    }

    /// Rule ID owning `pattern` at `key`
    pub fn rule_id(&self, key: &IndexKey, pattern: &str) -> Option<&str> {
        self.leaves.get(key)?.get(pattern).map(String::as_str)
    }

    /// Insert the rule's pattern for each of its permissions, in order.
    ///
    /// Either every permission is inserted or, on the first conflict, the
    /// insertions already made for this rule are undone and the conflict is
    /// returned.
    pub fn insert_rule(&mut self, rule: &AccessRule) -> Result<(), IndexConflict> {
        let mut added: Vec<IndexKey> = Vec::with_capacity(rule.permissions.len());
        for permission in &rule.permissions {
            let key = IndexKey::for_rule(rule, *permission);
            if let Err(conflict) = self.insert(&key, &rule.path_pattern, &rule.id) {
                for key in &added {
                    // cannot fail: inserted above
                    let _ = self.remove(key, &rule.path_pattern, &rule.id);
                }
                return Err(conflict);
            }
            added.push(key);
        }
        Ok(())
    }

    /// Remove the rule's pattern for every one of its permissions.
    ///
    /// Keeps going after individual failures and returns the last error seen.
    pub fn remove_rule(&mut self, rule: &AccessRule) -> RuleResult<()> {
        let mut result = Ok(());
        for permission in &rule.permissions {
            let key = IndexKey::for_rule(rule, *permission);
            if let Err(e) = self.remove(&key, &rule.path_pattern, &rule.id) {
                tracing::debug!(
                    "Removing rule {} ({}) from index: {}",
                    rule.id,
                    permission,
                    e
                );
                result = Err(e);
            }
        }
        result
    }

    /// Number of (key, pattern) entries in the index
    pub fn len(&self) -> usize {
        self.leaves.values().map(HashMap::len).sum()
    }

    /// Whether the index holds no entries
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Iterate over every (key, pattern, rule ID) entry
    pub fn entries(&self) -> impl Iterator<Item = (&IndexKey, &str, &str)> {
        self.leaves.iter().flat_map(|(key, leaf)| {
            leaf.iter()
                .map(move |(pattern, id)| (key, pattern.as_str(), id.as_str()))
        })
    }
}
