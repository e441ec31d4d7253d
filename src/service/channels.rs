//! Command channel between `RuleServiceHandle` and the service task
//!
//! Every command carries a oneshot sender for its reply.

use tokio::sync::{mpsc, oneshot};

use crate::core::RuleResult;
use crate::rules::{AccessRule, Permission, RuleContents, RuleUpdate};

/// Default buffer size for the command channel
pub const COMMAND_CHANNEL_SIZE: usize = 32;

/// Reply half of a command
pub type Reply<T> = oneshot::Sender<T>;

/// Request sent to the service task
#[derive(Debug)]
pub enum RuleCommand {
    /// Create a rule
    Create {
        user: u32,
        snap: String,
        app: String,
        contents: RuleContents,
        reply: Reply<RuleResult<AccessRule>>,
    },
    /// Modify a rule
    Modify {
        user: u32,
        id: String,
        update: RuleUpdate,
        reply: Reply<RuleResult<AccessRule>>,
    },
    /// Delete a rule
    Delete {
        user: u32,
        id: String,
        reply: Reply<RuleResult<AccessRule>>,
    },
    /// Fetch one rule
    Get {
        user: u32,
        id: String,
        reply: Reply<RuleResult<AccessRule>>,
    },
    /// List rules, optionally narrowed to a snap and/or app
    List {
        user: u32,
        snap: Option<String>,
        app: Option<String>,
        reply: Reply<Vec<AccessRule>>,
    },
    /// Decide a request
    IsAllowed {
        user: u32,
        snap: String,
        app: String,
        path: String,
        permission: Permission,
        reply: Reply<RuleResult<bool>>,
    },
    /// Remove expired rules
    PruneExpired { reply: Reply<RuleResult<Vec<AccessRule>>> },
    /// Stop the service task
    Shutdown,
}

/// Sender half of the command channel (used by RuleServiceHandle)
pub type CommandSender = mpsc::Sender<RuleCommand>;

/// Receiver half of the command channel (used by the service task)
pub type CommandReceiver = mpsc::Receiver<RuleCommand>;

/// Create a command channel; a size of zero is raised to one
pub fn create_command_channel(size: usize) -> (CommandSender, CommandReceiver) {
    mpsc::channel(size.max(1))
}
