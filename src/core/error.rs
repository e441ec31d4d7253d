//! Access rule error types

use thiserror::Error;

use crate::rules::Permission;

/// Errors that can occur while storing, editing or evaluating access rules
#[derive(Error, Debug)]
pub enum AccessRuleError {
    /// Another rule already claims the same path pattern for this permission
    #[error("a rule with the same path pattern already exists: rule {conflicting_id} ({permission})")]
    PatternConflict {
        /// ID of the rule which already holds the pattern
        conflicting_id: String,
        /// Permission for which the conflict occurred
        permission: Permission,
    },

    /// Path pattern was not found in the permission index
    #[error("path pattern was not found in the permission index")]
    PatternMissing,

    /// The index holds the pattern, but for a different rule
    #[error("the rule ID in the permission index does not match the expected rule ID")]
    RuleIdMismatch,

    /// No rule with the given ID exists
    #[error("access rule ID is not found")]
    RuleIdNotFound,

    /// The rule exists but belongs to another user
    #[error("the given user is not allowed to access the rule with the given ID")]
    UserNotAllowed,

    /// Permission is not part of the rule's permission list
    #[error("permission not found in the permissions list of the rule")]
    PermissionNotFound,

    /// The rule has no permissions left
    #[error("all permissions have been removed from the permissions list of the rule")]
    PermissionsEmpty,

    /// Precedence cannot be resolved over an empty set
    #[error("no patterns given, cannot establish precedence")]
    NoPatterns,

    /// Nothing in the index matches the requested path
    #[error("no access rules match the given path")]
    NoMatchingRule,

    /// Path pattern does not follow the allowed grammar
    #[error("the given path pattern is not allowed: {0:?}")]
    InvalidPathPattern(String),

    /// Outcome is neither allow nor deny
    #[error("invalid rule outcome; must be \"allow\" or \"deny\"")]
    InvalidOutcome,

    /// Permission name is not known
    #[error("invalid permission: {0:?}")]
    InvalidPermission(String),

    /// Lifespan is not one of the known lifespans
    #[error("invalid lifespan")]
    InvalidLifespan,

    /// Duration (or expiration) does not fit the lifespan
    #[error("invalid duration for accompanying lifespan: {0}")]
    InvalidDuration(String),

    /// The rule service task is no longer running
    #[error("rule service channel closed")]
    ChannelClosed,

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AccessRuleError {
    /// Create an invalid duration error
    pub fn invalid_duration(msg: impl Into<String>) -> Self {
        AccessRuleError::InvalidDuration(msg.into())
    }

    /// Whether the error was caused by caller input rather than by storage
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AccessRuleError::InvalidPathPattern(_)
                | AccessRuleError::InvalidOutcome
                | AccessRuleError::InvalidLifespan
                | AccessRuleError::InvalidPermission(_)
                | AccessRuleError::InvalidDuration(_)
        )
    }
}

/// Result type alias for access rule operations
pub type RuleResult<T> = Result<T, AccessRuleError>;
