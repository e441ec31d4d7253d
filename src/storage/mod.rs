//! On-disk storage of access rules

mod rule_store;

pub use rule_store::{RuleStore, DEFAULT_RULES_PATH};
