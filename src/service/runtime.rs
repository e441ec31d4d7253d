//! RuleService - Runs the rule database on its own blocking task
//!
//! The task is the only owner of the `AccessRuleDb`, which keeps the rule
//! set and the permission index consistent without any locking. Mutations
//! fsync the rule file, so the loop lives on tokio's blocking pool instead
//! of an async worker.

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::rules::{AccessRule, AccessRuleDb};

use super::channels::{create_command_channel, CommandReceiver, RuleCommand};
use super::handle::RuleServiceHandle;

/// Spawns the rule service task
pub struct RuleService;

impl RuleService {
    /// Move `db` onto a new blocking task and return a handle to it.
    ///
    /// The task stops on `RuleServiceHandle::shutdown` or once every handle
    /// is dropped; the join handle yields the database back.
    pub fn spawn(db: AccessRuleDb, channel_size: usize) -> (RuleServiceHandle, JoinHandle<AccessRuleDb>) {
        let (command_tx, command_rx) = create_command_channel(channel_size);
        let task = tokio::task::spawn_blocking(move || run(db, command_rx));
        (RuleServiceHandle::new(command_tx), task)
    }
}

fn run(mut db: AccessRuleDb, mut commands: CommandReceiver) -> AccessRuleDb {
    tracing::info!("Rule service started with {} rules", db.len());
    while let Some(command) = commands.blocking_recv() {
        if !dispatch(&mut db, command) {
            break;
        }
    }
    commands.close();
    tracing::info!("Rule service stopped");
    db
}

/// Apply one command; returns false when the service should stop.
///
/// A caller which stopped waiting drops its reply receiver, so failed
/// sends are ignored.
fn dispatch(db: &mut AccessRuleDb, command: RuleCommand) -> bool {
    match command {
        RuleCommand::Create {
            user,
            snap,
            app,
            contents,
            reply,
        } => {
            let _ = reply.send(db.create_rule(user, &snap, &app, contents));
        }
        RuleCommand::Modify { user, id, update, reply } => {
            let _ = reply.send(db.modify_rule(user, &id, update));
        }
        RuleCommand::Delete { user, id, reply } => {
            let _ = reply.send(db.delete_rule(user, &id));
        }
        RuleCommand::Get { user, id, reply } => {
            let _ = reply.send(db.rule_with_id(user, &id).cloned());
        }
        RuleCommand::List { user, snap, app, reply } => {
            let rules = match (snap.as_deref(), app.as_deref()) {
                (Some(snap), Some(app)) => db.rules_for_snap_app(user, snap, app),
                (Some(snap), None) => db.rules_for_snap(user, snap),
                (None, Some(app)) => {
                    let mut rules = db.rules(user);
                    rules.retain(|rule| rule.app == app);
                    rules
                }
                (None, None) => db.rules(user),
            };
            let _ = reply.send(rules.into_iter().cloned().collect::<Vec<AccessRule>>());
        }
        RuleCommand::IsAllowed {
            user,
            snap,
            app,
            path,
            permission,
            reply,
        } => {
            let _ = reply.send(db.is_allowed(user, &snap, &app, &path, permission));
        }
        RuleCommand::PruneExpired { reply } => {
            let _ = reply.send(db.prune_expired(Utc::now()));
        }
        RuleCommand::Shutdown => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread::ThreadId;

    use crate::core::AccessRuleError;
    use crate::rules::{Outcome, Permission, RuleContents, RuleUpdate};
    use tempfile::TempDir;

    fn contents(pattern: &str, outcome: Outcome) -> RuleContents {
        RuleContents::new(pattern, outcome, vec![Permission::Read, Permission::Write])
    }

    #[tokio::test]
    async fn test_service_crud() {
        let (handle, task) = RuleService::spawn(AccessRuleDb::in_memory(), 8);

        let rule = handle
            .create_rule(1000, "firefox", "firefox", contents("/home/test/**", Outcome::Allow))
            .await
            .unwrap();
        assert!(handle
            .is_allowed(1000, "firefox", "firefox", "/home/test/a.txt", Permission::Read)
            .await
            .unwrap());

        let modified = handle
            .modify_rule(1000, rule.id.as_str(), RuleUpdate::new().with_outcome(Outcome::Deny))
            .await
            .unwrap();
        assert_eq!(modified.outcome, Outcome::Deny);
        assert_eq!(handle.rule_with_id(1000, rule.id.as_str()).await.unwrap(), modified);

        handle.delete_rule(1000, rule.id.as_str()).await.unwrap();
        assert!(matches!(
            handle.rule_with_id(1000, rule.id.as_str()).await,
            Err(AccessRuleError::RuleIdNotFound)
        ));

        handle.shutdown().await.unwrap();
        let db = task.await.unwrap();
        assert!(db.is_empty());
    }

    #[tokio::test]
    async fn test_service_runs_off_the_async_thread() {
        let seen: Arc<Mutex<Vec<ThreadId>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let db = AccessRuleDb::in_memory().with_matcher(Arc::new(move |pattern: &str, path: &str| {
            recorder.lock().unwrap().push(std::thread::current().id());
            path.starts_with(pattern.trim_end_matches("/**"))
        }));
        let (handle, task) = RuleService::spawn(db, 8);

        handle
            .create_rule(1000, "firefox", "firefox", contents("/home/test/**", Outcome::Allow))
            .await
            .unwrap();
        assert!(handle
            .is_allowed(1000, "firefox", "firefox", "/home/test/a.txt", Permission::Read)
            .await
            .unwrap());

        // The current-thread runtime keeps making progress while the service works
        let ticker = tokio::spawn(async { 7 });
        assert_eq!(ticker.await.unwrap(), 7);

        handle.shutdown().await.unwrap();
        task.await.unwrap();

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        let async_thread = std::thread::current().id();
        assert!(seen.iter().all(|id| *id != async_thread));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_service_on_multi_thread_runtime() {
        let (handle, task) = RuleService::spawn(AccessRuleDb::in_memory(), 8);
        let rule = handle
            .create_rule(1000, "firefox", "firefox", contents("/a/**", Outcome::Allow))
            .await
            .unwrap();
        assert_eq!(handle.rules(1000).await.unwrap(), vec![rule]);
        drop(handle);
        assert_eq!(task.await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_service_list_filters() {
        let (handle, _task) = RuleService::spawn(AccessRuleDb::in_memory(), 8);
        handle
            .create_rule(1000, "firefox", "firefox", contents("/a/**", Outcome::Allow))
            .await
            .unwrap();
        handle
            .create_rule(1000, "firefox", "helper", contents("/b/**", Outcome::Allow))
            .await
            .unwrap();
        handle
            .create_rule(1000, "thunderbird", "helper", contents("/c/**", Outcome::Allow))
            .await
            .unwrap();

        assert_eq!(handle.rules(1000).await.unwrap().len(), 3);
        assert_eq!(handle.rules_for_snap(1000, "firefox").await.unwrap().len(), 2);
        assert_eq!(handle.rules_for_snap_app(1000, "firefox", "helper").await.unwrap().len(), 1);
        assert_eq!(handle.list(1000, None, Some("helper".into())).await.unwrap().len(), 2);
        assert!(handle.rules(1001).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_creates_conflict_once() {
        let (handle, _task) = RuleService::spawn(AccessRuleDb::in_memory(), 4);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle
                    .create_rule(1000, "firefox", "firefox", contents("/shared/**", Outcome::Allow))
                    .await
            }));
        }

        let mut created = 0;
        let mut conflicts = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => created += 1,
                Err(AccessRuleError::PatternConflict { .. }) => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(created, 1);
        assert_eq!(conflicts, 7);
    }

    #[tokio::test]
    async fn test_handle_after_shutdown() {
        let (handle, task) = RuleService::spawn(AccessRuleDb::in_memory(), 0);
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(handle.is_closed());
        assert!(matches!(handle.rules(1000).await, Err(AccessRuleError::ChannelClosed)));
        assert!(matches!(handle.shutdown().await, Err(AccessRuleError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_dropping_handles_stops_service() {
        let (handle, task) = RuleService::spawn(AccessRuleDb::in_memory(), 8);
        let clone = handle.clone();
        drop(handle);
        drop(clone);
        let db = task.await.unwrap();
        assert!(db.is_empty());
    }

    #[tokio::test]
    async fn test_service_persists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("access-rules.json");

        let (handle, task) = RuleService::spawn(AccessRuleDb::open(&path).unwrap(), 8);
        let rule = handle
            .create_rule(1000, "firefox", "firefox", contents("/a/**", Outcome::Allow))
            .await
            .unwrap();
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        let reopened = AccessRuleDb::open(&path).unwrap();
        assert_eq!(reopened.rule_with_id(1000, &rule.id).unwrap(), &rule);
    }
}
