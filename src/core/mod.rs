//! Core types shared by every module
//!
//! - `AccessRuleError` - Error type for rule storage, editing and evaluation
//! - `RuleResult` - Result alias over `AccessRuleError`

pub mod error;

pub use error::{AccessRuleError, RuleResult};
