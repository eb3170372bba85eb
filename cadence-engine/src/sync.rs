//! Reconciliation with the server.
//!
//! A sync run drains the queue (read-only), builds an upload batch, pushes
//! it, then applies the server's delta, cursor, and queue removal in one
//! local transaction. A run that fails leaves the queue and cursor exactly
//! as they were; only retry counts move.
//!
//! At most one run is in flight at a time. Requests that arrive while one
//! is running are dropped, not queued: the running sync already covers
//! every operation committed before its drain, and anything later is picked
//! up by the next explicit request.

use std::rc::Rc;

use chrono::{DateTime, Utc};
use slotmap::SlotMap;

use cadence_core::model::{
    CompletionFields, GoalFields, OperationKind, QueuedOperation, ReorderFields,
};
use cadence_core::wire::{CompletionChange, GoalChange, SyncRequest};

use crate::auth::{AuthProvider, Session};
use crate::engine::{Engine, EngineError, completion_to_change, goal_to_change};
use crate::store::LocalStore;
use crate::transport::SyncTransport;

slotmap::new_key_type! {
    pub struct StatusListenerKey;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncStatus {
    Idle,
    Syncing,
    Success { at: DateTime<Utc> },
    Error { message: String, can_retry: bool },
}

pub(crate) struct SyncState {
    status: SyncStatus,
    in_flight: bool,
    listeners: SlotMap<StatusListenerKey, Rc<dyn Fn(&SyncStatus)>>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            status: SyncStatus::Idle,
            in_flight: false,
            listeners: SlotMap::with_key(),
        }
    }
}

/// Whether a requested sync actually talked to the server.
pub(crate) enum SyncRun {
    Completed,
    Skipped(&'static str),
}

impl<T: SyncTransport, A: AuthProvider> Engine<T, A> {
    /// Fire-and-forget sync. Failures are reported through the status
    /// stream, not the return value; callers that need the outcome should
    /// watch [`Engine::subscribe_sync_status`].
    pub async fn sync(&self) {
        if let Err(e) = self.run_sync().await {
            log::debug!("sync request ended in error (reported via status): {e}");
        }
    }

    /// Switches a guest to a signed-in account: clears the cursor so the
    /// next upload carries the full local state, then syncs immediately.
    /// Unlike [`Engine::sync`] this propagates failure, so the caller can
    /// tell the user their data has not reached the account yet.
    pub async fn link_account(&self) -> Result<(), EngineError> {
        let store = self.store()?;
        store.set_last_synced_at(None)?;
        match self.run_sync().await? {
            SyncRun::Completed => Ok(()),
            SyncRun::Skipped(reason) => Err(EngineError::SyncSkipped(reason)),
        }
    }

    async fn run_sync(&self) -> Result<SyncRun, EngineError> {
        let Some(session) = self.auth.session() else {
            log::info!("sync skipped: not signed in");
            return Ok(SyncRun::Skipped("not signed in"));
        };
        if !self.is_online() {
            log::info!("sync skipped: offline");
            return Ok(SyncRun::Skipped("offline"));
        }
        {
            let mut sync = self.sync.borrow_mut();
            if sync.in_flight {
                log::info!("sync skipped: a run is already in flight");
                return Ok(SyncRun::Skipped("a run is already in flight"));
            }
            sync.in_flight = true;
        }
        self.set_status(SyncStatus::Syncing);

        let result = self.sync_with_server(&session).await;
        self.sync.borrow_mut().in_flight = false;

        match result {
            Ok(server_time) => {
                self.set_status(SyncStatus::Success { at: server_time });
                Ok(SyncRun::Completed)
            }
            Err(e) => {
                log::error!("sync failed: {e}");
                self.set_status(SyncStatus::Error {
                    message: e.to_string(),
                    can_retry: true,
                });
                Err(e)
            }
        }
    }

    async fn sync_with_server(&self, session: &Session) -> Result<DateTime<Utc>, EngineError> {
        let store = self.store()?;
        let drained = store.drain_operations_ordered()?;
        let cursor = store.last_synced_at()?;

        // A null cursor means the server has never seen this identity:
        // upload everything we have instead of replaying the queue.
        let (goals, completions) = match cursor {
            None => full_state_changes(&store)?,
            Some(_) => changes_from_operations(&store, &drained)?,
        };
        let request = SyncRequest {
            last_synced_at: cursor,
            goals,
            completions,
        };
        log::info!(
            "pushing sync batch: {} goal changes, {} completion changes, {} queued ops",
            request.goals.len(),
            request.completions.len(),
            drained.len(),
        );

        let drained_ids: Vec<String> = drained.iter().map(|op| op.id.clone()).collect();
        let response = match self
            .transport
            .push_batch(&session.access_token, &request)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if let Err(bump) = store.bump_retry_counts(&drained_ids) {
                    log::warn!("could not record retry for failed batch: {bump}");
                }
                return Err(e.into());
            }
        };

        store.apply_sync_response(&response, &drained_ids)?;
        Ok(response.server_time)
    }

    // ---- status stream ----

    pub fn sync_status(&self) -> SyncStatus {
        self.sync.borrow().status.clone()
    }

    pub fn subscribe_sync_status(
        &self,
        listener: impl Fn(&SyncStatus) + 'static,
    ) -> StatusListenerKey {
        self.sync.borrow_mut().listeners.insert(Rc::new(listener))
    }

    pub fn unsubscribe_sync_status(&self, key: StatusListenerKey) {
        self.sync.borrow_mut().listeners.remove(key);
    }

    fn set_status(&self, status: SyncStatus) {
        // Collect first so no borrow is held while callbacks run; a
        // listener may re-enter the engine.
        let listeners: Vec<Rc<dyn Fn(&SyncStatus)>> = {
            let mut sync = self.sync.borrow_mut();
            sync.status = status.clone();
            sync.listeners.values().cloned().collect()
        };
        for listener in listeners {
            listener(&status);
        }
    }
}

fn full_state_changes(
    store: &LocalStore,
) -> Result<(Vec<GoalChange>, Vec<CompletionChange>), EngineError> {
    let goals = store.list_all_goals()?.iter().map(goal_to_change).collect();
    let completions = store
        .list_all_completions()?
        .iter()
        .map(completion_to_change)
        .collect();
    Ok((goals, completions))
}

/// Translates queued intents into wire changes against current local state.
/// Operations whose entity no longer exists locally are skipped; they stay
/// in the drained set, so a successful push still purges them.
fn changes_from_operations(
    store: &LocalStore,
    ops: &[QueuedOperation],
) -> Result<(Vec<GoalChange>, Vec<CompletionChange>), EngineError> {
    let mut goals = Vec::new();
    let mut completions = Vec::new();
    for op in ops {
        match op.kind {
            OperationKind::CreateGoal | OperationKind::UpdateGoal => {
                let Ok(fields) = decode_logged::<GoalFields>(op) else {
                    continue;
                };
                if store.get_goal(&op.entity_id)?.is_none() {
                    continue;
                }
                goals.push(GoalChange {
                    id: op.entity_id.clone(),
                    name: fields.name,
                    color: fields.color,
                    position: fields.position,
                    target_count: fields.target_count,
                    target_period: fields.target_period,
                    updated_at: op.timestamp,
                    deleted: false,
                });
            }
            OperationKind::DeleteGoal => {
                let Some(goal) = store.get_goal(&op.entity_id)? else {
                    continue;
                };
                let mut change = goal_to_change(&goal);
                change.updated_at = op.timestamp;
                change.deleted = true;
                goals.push(change);
            }
            OperationKind::ReorderGoals => {
                let Ok(fields) = decode_logged::<ReorderFields>(op) else {
                    continue;
                };
                for (index, goal_id) in fields.goal_ids.iter().enumerate() {
                    let Some(goal) = store.get_goal(goal_id)? else {
                        continue;
                    };
                    let mut change = goal_to_change(&goal);
                    change.position = index as i64 + 1;
                    change.updated_at = op.timestamp;
                    goals.push(change);
                }
            }
            OperationKind::CreateCompletion | OperationKind::DeleteCompletion => {
                let Ok(fields) = decode_logged::<CompletionFields>(op) else {
                    continue;
                };
                if store.get_goal(&fields.goal_id)?.is_none() {
                    continue;
                }
                completions.push(CompletionChange {
                    goal_id: fields.goal_id,
                    date: fields.date,
                    completed: op.kind == OperationKind::CreateCompletion,
                    updated_at: op.timestamp,
                });
            }
        }
    }
    Ok((goals, completions))
}

fn decode_logged<D: serde::de::DeserializeOwned>(
    op: &QueuedOperation,
) -> Result<D, cadence_core::model::PayloadError> {
    op.decode()
        .inspect_err(|e| log::warn!("dropping undecodable queued operation {}: {e}", op.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use crate::test_support::{FakeAuth, FakeTransport};
    use cadence_core::model::Completion;
    use cadence_core::wire::SyncResponse;
    use chrono::{NaiveDate, TimeZone};
    use std::cell::RefCell;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn server_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap()
    }

    fn signed_in_engine() -> Engine<FakeTransport, FakeAuth> {
        Engine::in_memory(FakeTransport::replying(server_time()), FakeAuth::signed_in())
    }

    #[tokio::test]
    async fn concurrent_sync_requests_share_one_run() {
        let engine = signed_in_engine();
        engine.transport.yield_before_reply.set(true);
        engine.create_goal("Run", "#111111", None, None).unwrap();

        tokio::join!(engine.sync(), engine.sync());
        assert_eq!(engine.transport.push_count.get(), 1);
        // The dropped request did not wedge the flag: a later sync runs.
        engine.sync().await;
        assert_eq!(engine.transport.push_count.get(), 2);
    }

    #[tokio::test]
    async fn first_sync_uploads_the_entire_local_state() {
        let engine = signed_in_engine();
        for (name, color) in [("One", "#111111"), ("Two", "#222222"), ("Three", "#333333")] {
            engine.create_goal(name, color, None, None).unwrap();
        }
        engine.sync().await;

        let request = engine.transport.last_request();
        assert_eq!(request.last_synced_at, None);
        assert_eq!(request.goals.len(), 3);
        assert!(request.goals.iter().all(|g| !g.deleted));

        // The run advanced the cursor and emptied the queue.
        assert_eq!(engine.last_synced_at().unwrap(), Some(server_time()));
        assert!(engine.store().unwrap().drain_operations_ordered().unwrap().is_empty());
    }

    #[tokio::test]
    async fn incremental_sync_replays_queued_intents() {
        let engine = signed_in_engine();
        engine
            .store()
            .unwrap()
            .set_last_synced_at(Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()))
            .unwrap();
        let goal = engine.create_goal("Run", "#111111", None, None).unwrap();
        engine.create_completion(&goal.id, date(2026, 1, 5)).unwrap();
        engine.sync().await;

        let request = engine.transport.last_request();
        assert!(request.last_synced_at.is_some());
        assert_eq!(request.goals.len(), 1);
        assert_eq!(request.goals[0].id, goal.id);
        assert_eq!(request.completions.len(), 1);
        assert!(request.completions[0].completed);
    }

    #[tokio::test]
    async fn archive_uploads_a_tombstone() {
        let engine = signed_in_engine();
        engine
            .store()
            .unwrap()
            .set_last_synced_at(Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()))
            .unwrap();
        let goal = engine.create_goal("Run", "#111111", None, None).unwrap();
        engine.archive_goal(&goal.id).unwrap();
        engine.sync().await;

        let request = engine.transport.last_request();
        let tombstone = request.goals.iter().find(|g| g.deleted).unwrap();
        assert_eq!(tombstone.id, goal.id);
    }

    #[tokio::test]
    async fn operations_for_vanished_entities_are_skipped_but_purged() {
        let engine = signed_in_engine();
        let store = engine.store().unwrap();
        store
            .set_last_synced_at(Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()))
            .unwrap();
        // Queue a completion for a goal that no longer exists locally.
        let orphan = Completion {
            id: "ghost-2026-01-05".to_string(),
            goal_id: "ghost".to_string(),
            date: date(2026, 1, 5),
            created_at: Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap(),
        };
        store
            .enqueue_operation(&QueuedOperation::create_completion(
                &orphan,
                orphan.created_at,
            ))
            .unwrap();
        engine.sync().await;

        let request = engine.transport.last_request();
        assert!(request.completions.is_empty());
        // The server accepted the (empty) batch, so the orphan op is gone.
        assert!(store.drain_operations_ordered().unwrap().is_empty());
    }

    #[tokio::test]
    async fn server_wins_on_completion_deletion() {
        let engine = signed_in_engine();
        let store = engine.store().unwrap();
        store
            .set_last_synced_at(Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()))
            .unwrap();
        let goal = engine.create_goal("Run", "#111111", None, None).unwrap();
        engine.create_completion(&goal.id, date(2026, 1, 5)).unwrap();
        // Another device already deleted that completion.
        *engine.transport.response.borrow_mut() = Some(SyncResponse {
            server_time: server_time(),
            goals: vec![],
            completions: vec![CompletionChange {
                goal_id: goal.id.clone(),
                date: date(2026, 1, 5),
                completed: false,
                updated_at: server_time(),
            }],
        });
        engine.sync().await;

        assert_eq!(store.find_completion(&goal.id, date(2026, 1, 5)).unwrap(), None);
    }

    #[tokio::test]
    async fn failed_sync_preserves_queue_and_cursor_and_bumps_retries() {
        let engine = Engine::in_memory(FakeTransport::failing(), FakeAuth::signed_in());
        let cursor = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let store = engine.store().unwrap();
        store.set_last_synced_at(Some(cursor)).unwrap();
        engine.create_goal("Run", "#111111", None, None).unwrap();

        engine.sync().await;

        let ops = store.drain_operations_ordered().unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].retry_count, 1);
        assert_eq!(store.last_synced_at().unwrap(), Some(cursor));
        assert!(matches!(
            engine.sync_status(),
            SyncStatus::Error { can_retry: true, .. }
        ));
    }

    #[tokio::test]
    async fn link_account_forces_a_full_upload() {
        let engine = signed_in_engine();
        engine
            .store()
            .unwrap()
            .set_last_synced_at(Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()))
            .unwrap();
        engine.create_goal("Run", "#111111", None, None).unwrap();

        engine.link_account().await.unwrap();
        let request = engine.transport.last_request();
        assert_eq!(request.last_synced_at, None);
        assert_eq!(request.goals.len(), 1);
    }

    #[tokio::test]
    async fn link_account_fails_loudly_when_it_cannot_run() {
        let engine = Engine::in_memory(FakeTransport::failing(), FakeAuth::guest());
        let err = engine.link_account().await.unwrap_err();
        assert!(matches!(err, EngineError::SyncSkipped(_)));
        assert_eq!(engine.transport.push_count.get(), 0);
    }

    #[tokio::test]
    async fn guest_and_offline_syncs_are_dropped() {
        let guest = Engine::in_memory(FakeTransport::failing(), FakeAuth::guest());
        guest.sync().await;
        assert_eq!(guest.transport.push_count.get(), 0);

        let offline = signed_in_engine();
        offline.set_online(false);
        offline.sync().await;
        assert_eq!(offline.transport.push_count.get(), 0);
        // Back online, the same request goes through.
        offline.set_online(true);
        offline.sync().await;
        assert_eq!(offline.transport.push_count.get(), 1);
    }

    #[tokio::test]
    async fn status_listeners_see_syncing_then_the_outcome() {
        let engine = Rc::new(signed_in_engine());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let key = engine.subscribe_sync_status(move |status| {
            sink.borrow_mut().push(status.clone());
        });

        engine.sync().await;
        assert_eq!(
            *seen.borrow(),
            vec![
                SyncStatus::Syncing,
                SyncStatus::Success { at: server_time() },
            ]
        );

        engine.unsubscribe_sync_status(key);
        engine.sync().await;
        assert_eq!(seen.borrow().len(), 2);
    }
}
