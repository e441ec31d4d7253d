//! Rule service
//!
//! The rule set and its index must only be touched by one caller at a time.
//! `RuleService::spawn` moves an [`AccessRuleDb`](crate::rules::AccessRuleDb)
//! onto a tokio task; callers talk to it through cloneable
//! [`RuleServiceHandle`]s:
//!
//! ```text
//! handle ──┐
//! handle ──┼── mpsc<RuleCommand> ──> service task (owns AccessRuleDb)
//! handle ──┘          <── oneshot reply ──┘
//! ```

mod channels;
mod handle;
mod runtime;

pub use channels::{RuleCommand, COMMAND_CHANNEL_SIZE};
pub use handle::RuleServiceHandle;
pub use runtime::RuleService;
