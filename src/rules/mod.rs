//! Prompting access rules
//!
//! This module holds the rule model and the in-memory rule database:
//! - **rule**: `AccessRule` and its outcome, lifespan and permission types
//! - **pattern**: path pattern grammar, glob matching and precedence
//! - **index**: per (user, snap, app, permission) pattern-to-rule lookup
//! - **database**: CRUD, queries and authorization over the rule set
//!
//! ## Example
//!
//! ```rust,ignore
//! use prompt_rules::rules::{AccessRuleDb, Outcome, Permission, RuleContents};
//!
//! let mut db = AccessRuleDb::open("/var/lib/snapd/state/access-rules.json")?;
//! db.create_rule(
//!     1000,
//!     "firefox",
//!     "firefox",
//!     RuleContents::new("/home/test/Downloads/**", Outcome::Allow, vec![Permission::Read]),
//! )?;
//!
//! let allowed = db.is_allowed(1000, "firefox", "firefox", "/home/test/Downloads/a.pdf", Permission::Read)?;
//! ```

mod database;
mod index;
mod pattern;
mod rule;

pub use database::{AccessRuleDb, RuleContents, RuleUpdate};
pub use index::{IndexConflict, IndexKey, PermissionIndex};
pub use pattern::{highest_precedence_pattern, validate_path_pattern, GlobMatcher, PatternMatcher};
pub use rule::{
    current_timestamp, dedup_permissions, parse_go_duration, permissions_contain, AccessRule,
    Lifespan, Outcome, Permission,
};
