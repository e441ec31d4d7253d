//! RuleServiceHandle - External interface to a running rule service
//!
//! The handle can be cloned and shared across tasks. Each call sends one
//! command to the service task and waits for its reply, so operations from
//! all handles are applied one at a time in arrival order.

use tokio::sync::oneshot;

use crate::core::{AccessRuleError, RuleResult};
use crate::rules::{AccessRule, Permission, RuleContents, RuleUpdate};

use super::channels::{CommandSender, Reply, RuleCommand};

/// Handle for talking to a running rule service
#[derive(Debug, Clone)]
pub struct RuleServiceHandle {
    command_tx: CommandSender,
}

impl RuleServiceHandle {
    pub(crate) fn new(command_tx: CommandSender) -> Self {
        Self { command_tx }
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Create a rule
    pub async fn create_rule(
        &self,
        user: u32,
        snap: impl Into<String>,
        app: impl Into<String>,
        contents: RuleContents,
    ) -> RuleResult<AccessRule> {
        let (snap, app) = (snap.into(), app.into());
        self.request(|reply| RuleCommand::Create {
            user,
            snap,
            app,
            contents,
            reply,
        })
        .await?
    }

    /// Modify a rule
    pub async fn modify_rule(&self, user: u32, id: impl Into<String>, update: RuleUpdate) -> RuleResult<AccessRule> {
        let id = id.into();
        self.request(|reply| RuleCommand::Modify { user, id, update, reply })
            .await?
    }

    /// Delete a rule
    pub async fn delete_rule(&self, user: u32, id: impl Into<String>) -> RuleResult<AccessRule> {
        let id = id.into();
        self.request(|reply| RuleCommand::Delete { user, id, reply })
            .await?
    }

    /// Remove expired timespan rules
    pub async fn prune_expired(&self) -> RuleResult<Vec<AccessRule>> {
        self.request(|reply| RuleCommand::PruneExpired { reply })
            .await?
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Fetch the rule `id` owned by `user`
    pub async fn rule_with_id(&self, user: u32, id: impl Into<String>) -> RuleResult<AccessRule> {
        let id = id.into();
        self.request(|reply| RuleCommand::Get { user, id, reply })
            .await?
    }

    /// All rules of `user`
    pub async fn rules(&self, user: u32) -> RuleResult<Vec<AccessRule>> {
        self.list(user, None, None).await
    }

    /// Rules of `user` for `snap`
    pub async fn rules_for_snap(&self, user: u32, snap: impl Into<String>) -> RuleResult<Vec<AccessRule>> {
        self.list(user, Some(snap.into()), None).await
    }

    /// Rules of `user` for one app of `snap`
    pub async fn rules_for_snap_app(
        &self,
        user: u32,
        snap: impl Into<String>,
        app: impl Into<String>,
    ) -> RuleResult<Vec<AccessRule>> {
        self.list(user, Some(snap.into()), Some(app.into())).await
    }

    /// Rules of `user`, optionally narrowed to a snap and/or app
    pub async fn list(&self, user: u32, snap: Option<String>, app: Option<String>) -> RuleResult<Vec<AccessRule>> {
        self.request(|reply| RuleCommand::List { user, snap, app, reply })
            .await
    }

    /// Whether `permission` on `path` is allowed for the snap app
    pub async fn is_allowed(
        &self,
        user: u32,
        snap: impl Into<String>,
        app: impl Into<String>,
        path: impl Into<String>,
        permission: Permission,
    ) -> RuleResult<bool> {
        let (snap, app, path) = (snap.into(), app.into(), path.into());
        self.request(|reply| RuleCommand::IsAllowed {
            user,
            snap,
            app,
            path,
            permission,
            reply,
        })
        .await?
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Ask the service task to stop
    pub async fn shutdown(&self) -> RuleResult<()> {
        self.command_tx
            .send(RuleCommand::Shutdown)
            .await
            .map_err(|_| AccessRuleError::ChannelClosed)
    }

    /// Whether the service task has stopped
    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> RuleCommand) -> RuleResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| AccessRuleError::ChannelClosed)?;
        reply_rx.await.map_err(|_| AccessRuleError::ChannelClosed)
    }
}
