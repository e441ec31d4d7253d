pub mod core;
pub mod rules;
pub mod storage;

// Single-owner rule service
pub mod service;

// Optional components
pub mod config;
pub mod logging;

pub use crate::core::{AccessRuleError, RuleResult};
pub use rules::{AccessRule, AccessRuleDb, Lifespan, Outcome, Permission, RuleContents, RuleUpdate};
pub use service::{RuleService, RuleServiceHandle};
