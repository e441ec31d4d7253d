//! Access rule database
//!
//! `AccessRuleDb` owns the authoritative rule set (by ID) and the derived
//! [`PermissionIndex`]. The two are only consistent between operations, so
//! callers must serialize access (see [`crate::service`]).

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::core::{AccessRuleError, RuleResult};
use crate::storage::RuleStore;

use super::index::{IndexKey, PermissionIndex};
use super::pattern::{highest_precedence_pattern, validate_path_pattern, GlobMatcher, PatternMatcher};
use super::rule::{
    current_timestamp, dedup_permissions, permissions_contain, AccessRule, Lifespan, Outcome,
    Permission,
};

/// Contents of a new rule
#[derive(Debug, Clone)]
pub struct RuleContents {
    /// Path glob the rule applies to
    pub path_pattern: String,
    /// Outcome for matching requests
    pub outcome: Outcome,
    /// How long the rule stays valid
    pub lifespan: Lifespan,
    /// Go-style duration, required iff the lifespan is a timespan
    pub duration: Option<String>,
    /// Permissions covered by the rule
    pub permissions: Vec<Permission>,
}

impl RuleContents {
    /// Create contents for a rule that lasts forever
    pub fn new(path_pattern: impl Into<String>, outcome: Outcome, permissions: Vec<Permission>) -> Self {
        Self {
            path_pattern: path_pattern.into(),
            outcome,
            lifespan: Lifespan::Forever,
            duration: None,
            permissions,
        }
    }

    /// Set the lifespan
    pub fn with_lifespan(mut self, lifespan: Lifespan) -> Self {
        self.lifespan = lifespan;
        self
    }

    /// Make the rule a timespan rule lasting `duration`
    pub fn with_duration(mut self, duration: impl Into<String>) -> Self {
        self.lifespan = Lifespan::Timespan;
        self.duration = Some(duration.into());
        self
    }
}

/// Changes to an existing rule; unset fields keep their current value
#[derive(Debug, Clone, Default)]
pub struct RuleUpdate {
    /// New path pattern
    pub path_pattern: Option<String>,
    /// New outcome
    pub outcome: Option<Outcome>,
    /// New lifespan
    pub lifespan: Option<Lifespan>,
    /// New duration (for timespan lifespans)
    pub duration: Option<String>,
    /// New permission set; empty means unchanged
    pub permissions: Option<Vec<Permission>>,
}

impl RuleUpdate {
    /// Create an empty update
    pub fn new() -> Self {
        Self::default()
    }

    /// Change the path pattern
    pub fn with_path_pattern(mut self, path_pattern: impl Into<String>) -> Self {
        self.path_pattern = Some(path_pattern.into());
        self
    }

    /// Change the outcome
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// Change the lifespan
    pub fn with_lifespan(mut self, lifespan: Lifespan) -> Self {
        self.lifespan = Some(lifespan);
        self
    }

    /// Change the duration
    pub fn with_duration(mut self, duration: impl Into<String>) -> Self {
        self.duration = Some(duration.into());
        self
    }

    /// Replace the permission set
    pub fn with_permissions(mut self, permissions: Vec<Permission>) -> Self {
        self.permissions = Some(permissions);
        self
    }
}

/// Copy of the database state taken before a mutation
struct Snapshot {
    by_id: HashMap<String, AccessRule>,
    index: PermissionIndex,
}

/// Rule set plus permission index, optionally backed by a rule store
pub struct AccessRuleDb {
    by_id: HashMap<String, AccessRule>,
    index: PermissionIndex,
    store: Option<RuleStore>,
    matcher: Arc<dyn PatternMatcher>,
}

impl AccessRuleDb {
    /// Open the database stored at `path`.
    ///
    /// A missing file yields an empty database; the file is created on the
    /// first mutation.
    pub fn open(path: impl AsRef<Path>) -> RuleResult<Self> {
        Self::open_with_store(RuleStore::new(path.as_ref()))
    }

    /// Open the database from an existing store
    pub fn open_with_store(store: RuleStore) -> RuleResult<Self> {
        let rules = store.load()?;
        tracing::info!("Loaded {} access rules from {}", rules.len(), store.path().display());
        let mut db = Self::from_rules(rules);
        db.store = Some(store);
        Ok(db)
    }

    /// Create an empty database which is never persisted
    pub fn in_memory() -> Self {
        Self {
            by_id: HashMap::new(),
            index: PermissionIndex::new(),
            store: None,
            matcher: Arc::new(GlobMatcher::new()),
        }
    }

    /// Build an in-memory database from a rule list, repairing conflicts
    pub fn from_rules(rules: Vec<AccessRule>) -> Self {
        let mut db = Self::in_memory();
        for rule in rules {
            if let Some(previous) = db.by_id.insert(rule.id.clone(), rule) {
                tracing::warn!("Dropping access rule with duplicate ID {}", previous.id);
            }
        }
        db.refresh_index_enforce_consistency();
        db
    }

    /// Use a different pattern matcher
    pub fn with_matcher(mut self, matcher: Arc<dyn PatternMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    /// The store backing this database, if any
    pub fn store(&self) -> Option<&RuleStore> {
        self.store.as_ref()
    }

    /// The derived permission index
    pub fn index(&self) -> &PermissionIndex {
        &self.index
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether there are no rules
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    // =========================================================================
    // Consistency
    // =========================================================================

    /// Rebuild the index from the rule set, resolving pattern conflicts.
    ///
    /// Rules are processed in ascending ID order. When two rules claim the
    /// same pattern for the same permission, the older one loses that
    /// permission; a rule left with no permissions is dropped. Rules that
    /// fail validation are dropped as well.
    pub fn refresh_index_enforce_consistency(&mut self) {
        let now = Utc::now();
        let mut pending = std::mem::take(&mut self.by_id);
        let mut ids: Vec<String> = pending.keys().cloned().collect();
        ids.sort();

        let mut index = PermissionIndex::new();
        let mut surviving: HashMap<String, AccessRule> = HashMap::with_capacity(pending.len());

        for id in ids {
            let Some(mut rule) = pending.remove(&id) else {
                continue;
            };
            rule.permissions = dedup_permissions(&rule.permissions);
            if let Err(e) = rule.validate(now) {
                tracing::warn!("Dropping invalid access rule {}: {}", rule.id, e);
                continue;
            }

            while let Err(conflict) = index.insert_rule(&rule) {
                let Some(existing) = surviving.get_mut(&conflict.rule_id) else {
                    // The index only names surviving rules
                    rule.permissions.retain(|p| *p != conflict.permission);
                    continue;
                };
                if is_newer(&rule, existing) {
                    tracing::warn!(
                        "Rule {} overrides older rule {} for {} on {}",
                        rule.id,
                        existing.id,
                        conflict.permission,
                        rule.path_pattern
                    );
                    let key = IndexKey::for_rule(existing, conflict.permission);
                    if let Err(e) = index.remove(&key, &existing.path_pattern, &existing.id) {
                        tracing::debug!("Removing {} from index: {}", existing.id, e);
                    }
                    if let Err(AccessRuleError::PermissionsEmpty) =
                        existing.remove_permission(conflict.permission)
                    {
                        let dropped = conflict.rule_id;
                        if let Some(dropped) = surviving.remove(&dropped) {
                            // Any permissions still indexed for it go too
                            let _ = index.remove_rule(&dropped);
                            tracing::warn!("Dropping access rule {} with no permissions left", dropped.id);
                        }
                    }
                } else {
                    tracing::warn!(
                        "Rule {} loses {} on {} to newer rule {}",
                        rule.id,
                        conflict.permission,
                        rule.path_pattern,
                        existing.id
                    );
                    rule.permissions.retain(|p| *p != conflict.permission);
                }
            }

            if rule.permissions.is_empty() {
                tracing::warn!("Dropping access rule {} with no permissions left", rule.id);
                continue;
            }
            surviving.insert(id, rule);
        }

        self.by_id = surviving;
        self.index = index;
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Create a rule for `user` and the given snap app.
    ///
    /// Fails without changing anything if the contents are invalid or if
    /// another rule already claims the pattern for one of the permissions.
    pub fn create_rule(&mut self, user: u32, snap: &str, app: &str, contents: RuleContents) -> RuleResult<AccessRule> {
        let now = Utc::now();
        validate_path_pattern(&contents.path_pattern)?;
        let expiration = contents
            .lifespan
            .parse_duration(contents.duration.as_deref().unwrap_or(""), now)?;
        let permissions = dedup_permissions(&contents.permissions);
        if permissions.is_empty() {
            return Err(AccessRuleError::PermissionsEmpty);
        }

        let rule = AccessRule {
            id: new_rule_id(),
            timestamp: current_timestamp(),
            user,
            snap: snap.to_string(),
            app: app.to_string(),
            path_pattern: contents.path_pattern,
            outcome: contents.outcome,
            lifespan: contents.lifespan,
            expiration,
            permissions,
        };

        let snapshot = self.snapshot();
        self.index.insert_rule(&rule)?;
        self.by_id.insert(rule.id.clone(), rule.clone());
        self.persist(snapshot)?;

        tracing::info!(
            "Created access rule {} for user {} ({}.{}): {} {} {:?}",
            rule.id,
            user,
            snap,
            app,
            rule.outcome,
            rule.path_pattern,
            rule.permissions
        );
        Ok(rule)
    }

    /// Modify the rule `id` owned by `user`.
    ///
    /// Unset fields keep their current value. The whole rule is revalidated
    /// and its timestamp refreshed. A pattern conflict leaves the database
    /// unchanged; index inconsistencies found along the way are repaired by a
    /// full consistency pass.
    pub fn modify_rule(&mut self, user: u32, id: &str, update: RuleUpdate) -> RuleResult<AccessRule> {
        let current = self.rule_with_id(user, id)?.clone();
        let now = Utc::now();

        let path_pattern = update
            .path_pattern
            .unwrap_or_else(|| current.path_pattern.clone());
        let outcome = update.outcome.unwrap_or(current.outcome);
        let lifespan = update.lifespan.unwrap_or(current.lifespan);
        validate_path_pattern(&path_pattern)?;
        let expiration = match update.duration.as_deref() {
            // Keep the running timespan if no new duration was given
            None if lifespan == Lifespan::Timespan && current.lifespan == Lifespan::Timespan => {
                lifespan.validate_expiration(current.expiration, now)?;
                current.expiration
            }
            duration => lifespan.parse_duration(duration.unwrap_or(""), now)?,
        };
        let permissions = match update.permissions {
            Some(permissions) if !permissions.is_empty() => dedup_permissions(&permissions),
            _ => current.permissions.clone(),
        };

        let snapshot = self.snapshot();
        let mut rule = current;
        let mut needs_refresh = false;

        if path_pattern != rule.path_pattern {
            if let Err(e) = self.index.remove_rule(&rule) {
                tracing::warn!("Index out of sync while moving rule {}: {}", rule.id, e);
                needs_refresh = true;
            }
            rule.permissions.clear();
            rule.path_pattern = path_pattern;
        }

        let mut preserved = Vec::with_capacity(rule.permissions.len());
        for permission in &rule.permissions {
            if permissions_contain(&permissions, *permission) {
                preserved.push(*permission);
                continue;
            }
            let key = IndexKey::for_rule(&rule, *permission);
            if let Err(e) = self.index.remove(&key, &rule.path_pattern, &rule.id) {
                tracing::warn!("Index out of sync while narrowing rule {}: {}", rule.id, e);
                needs_refresh = true;
            }
        }
        rule.permissions = preserved;

        for permission in &permissions {
            if rule.has_permission(*permission) {
                continue;
            }
            let key = IndexKey::for_rule(&rule, *permission);
            if let Err(conflict) = self.index.insert(&key, &rule.path_pattern, &rule.id) {
                self.restore(snapshot);
                // The snapshot carries the same drift the narrowing pass found
                if needs_refresh {
                    self.refresh_index_enforce_consistency();
                }
                return Err(conflict.into());
            }
            rule.permissions.push(*permission);
        }

        rule.outcome = outcome;
        rule.lifespan = lifespan;
        rule.expiration = expiration;
        rule.timestamp = current_timestamp();
        self.by_id.insert(rule.id.clone(), rule);

        if needs_refresh {
            self.refresh_index_enforce_consistency();
        }
        let Some(modified) = self.by_id.get(id).cloned() else {
            self.restore(snapshot);
            return Err(AccessRuleError::RuleIdNotFound);
        };
        self.persist(snapshot)?;

        tracing::info!(
            "Modified access rule {}: {} {} {:?}",
            modified.id,
            modified.outcome,
            modified.path_pattern,
            modified.permissions
        );
        Ok(modified)
    }

    /// Delete the rule `id` owned by `user` and return it.
    ///
    /// The rule always leaves the rule set; if the index had drifted, it is
    /// rebuilt.
    pub fn delete_rule(&mut self, user: u32, id: &str) -> RuleResult<AccessRule> {
        let rule = self.rule_with_id(user, id)?.clone();
        let snapshot = self.snapshot();

        let removed = self.index.remove_rule(&rule);
        self.by_id.remove(id);
        if let Err(e) = removed {
            tracing::warn!("Index out of sync while deleting rule {}: {}", rule.id, e);
            self.refresh_index_enforce_consistency();
        }
        self.persist(snapshot)?;

        tracing::info!("Deleted access rule {} for user {}", rule.id, user);
        Ok(rule)
    }

    /// Remove every timespan rule which expired before `now`
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> RuleResult<Vec<AccessRule>> {
        let mut expired: Vec<AccessRule> = self
            .by_id
            .values()
            .filter(|rule| rule.is_expired(now))
            .cloned()
            .collect();
        if expired.is_empty() {
            return Ok(expired);
        }
        expired.sort_by(|a, b| a.id.cmp(&b.id));

        let snapshot = self.snapshot();
        let mut needs_refresh = false;
        for rule in &expired {
            if self.index.remove_rule(rule).is_err() {
                needs_refresh = true;
            }
            self.by_id.remove(&rule.id);
        }
        if needs_refresh {
            self.refresh_index_enforce_consistency();
        }
        self.persist(snapshot)?;

        tracing::info!("Pruned {} expired access rules", expired.len());
        Ok(expired)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Find the rule which decides `permission` on `path`
    pub fn matching_rule(
        &self,
        user: u32,
        snap: &str,
        app: &str,
        path: &str,
        permission: Permission,
    ) -> RuleResult<&AccessRule> {
        self.matching_rule_at(user, snap, app, path, permission, Utc::now())
    }

    /// Find the rule which decides `permission` on `path` at `now`.
    ///
    /// Rules expired at `now` are skipped even before they are pruned.
    pub fn matching_rule_at(
        &self,
        user: u32,
        snap: &str,
        app: &str,
        path: &str,
        permission: Permission,
        now: DateTime<Utc>,
    ) -> RuleResult<&AccessRule> {
        let key = IndexKey::new(user, snap, app, permission);
        let mut candidates = self.index.candidates_matching(&key, path, self.matcher.as_ref());
        candidates.retain(|pattern| {
            !self
                .index
                .rule_id(&key, pattern)
                .and_then(|id| self.by_id.get(id))
                .is_some_and(|rule| rule.is_expired(now))
        });
        if candidates.is_empty() {
            return Err(AccessRuleError::NoMatchingRule);
        }
        let pattern = highest_precedence_pattern(&candidates)?;
        let id = self
            .index
            .rule_id(&key, pattern)
            .ok_or(AccessRuleError::RuleIdNotFound)?;
        self.by_id.get(id).ok_or(AccessRuleError::RuleIdNotFound)
    }

    /// Whether `permission` on `path` is allowed by the rules
    pub fn is_allowed(&self, user: u32, snap: &str, app: &str, path: &str, permission: Permission) -> RuleResult<bool> {
        let rule = self.matching_rule(user, snap, app, path, permission)?;
        tracing::debug!(
            "Rule {} ({}) decides {} on {} for {}.{}",
            rule.id,
            rule.path_pattern,
            permission,
            path,
            snap,
            app
        );
        Ok(rule.outcome.is_allow())
    }

    /// Look up the rule `id`, checking it belongs to `user`
    pub fn rule_with_id(&self, user: u32, id: &str) -> RuleResult<&AccessRule> {
        let rule = self.by_id.get(id).ok_or(AccessRuleError::RuleIdNotFound)?;
        if rule.user != user {
            return Err(AccessRuleError::UserNotAllowed);
        }
        Ok(rule)
    }

    /// All rules of `user`
    pub fn rules(&self, user: u32) -> Vec<&AccessRule> {
        self.filtered(|rule| rule.user == user)
    }

    /// Rules of `user` for `snap`
    pub fn rules_for_snap(&self, user: u32, snap: &str) -> Vec<&AccessRule> {
        self.filtered(|rule| rule.user == user && rule.snap == snap)
    }

    /// Rules of `user` for one app of `snap`
    pub fn rules_for_snap_app(&self, user: u32, snap: &str, app: &str) -> Vec<&AccessRule> {
        self.filtered(|rule| rule.user == user && rule.snap == snap && rule.app == app)
    }

    fn filtered(&self, predicate: impl Fn(&AccessRule) -> bool) -> Vec<&AccessRule> {
        let mut rules: Vec<&AccessRule> = self.by_id.values().filter(|rule| predicate(rule)).collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Write the rule set to the backing store, if there is one
    pub fn save(&self) -> RuleResult<()> {
        match &self.store {
            Some(store) => store.save(self.by_id.values()),
            None => Ok(()),
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            by_id: self.by_id.clone(),
            index: self.index.clone(),
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        self.by_id = snapshot.by_id;
        self.index = snapshot.index;
    }

    /// Save, rolling back to `snapshot` if the write fails
    fn persist(&mut self, snapshot: Snapshot) -> RuleResult<()> {
        if let Err(e) = self.save() {
            tracing::error!("Failed to persist access rules, rolling back: {}", e);
            self.restore(snapshot);
            return Err(e);
        }
        Ok(())
    }
}

impl fmt::Debug for AccessRuleDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessRuleDb")
            .field("rules", &self.by_id.len())
            .field("index_entries", &self.index.len())
            .field("store", &self.store)
            .finish()
    }
}

impl Default for AccessRuleDb {
    fn default() -> Self {
        Self::in_memory()
    }
}

fn new_rule_id() -> String {
    Uuid::new_v4().to_string()
}

/// Whether `candidate` was modified strictly after `existing`.
///
/// Unparsable timestamps lose against parsable ones; if neither parses the
/// strings are compared. Equal timestamps are not newer, so the rule
/// processed first keeps the pattern.
fn is_newer(candidate: &AccessRule, existing: &AccessRule) -> bool {
    let parse = |ts: &str| DateTime::parse_from_rfc3339(ts).ok();
    let ordering = match (parse(&candidate.timestamp), parse(&existing.timestamp)) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => candidate.timestamp.cmp(&existing.timestamp),
    };
    ordering == Ordering::Greater
}
