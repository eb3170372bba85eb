//! The façade the UI talks to. Every mutation is optimistic: it commits to
//! the local store first (together with its queued operation when a session
//! exists) and returns without touching the network. Reads come from the
//! local store, except the calendar view which prefers the server and falls
//! back to local data when the request fails.
//!
//! The engine is single-threaded by construction (`Rc`, `RefCell`, `Cell`);
//! async appears only where a network call can suspend.

use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};

use cadence_core::model::{Completion, Goal, QueuedOperation, TargetPeriod, completion_sync_id};
use cadence_core::wire::{CalendarSnapshot, CompletionChange, GoalChange};

use crate::auth::AuthProvider;
use crate::store::{LocalStore, StoreError};
use crate::sync::SyncState;
use crate::transport::{SyncTransport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The local store could not be opened. Every storage-backed call fails
    /// with this until the underlying problem goes away.
    #[error("local storage failed to initialize: {0}")]
    StorageInit(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no such {kind}: {id}")]
    EntityNotFound { kind: &'static str, id: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A requested sync was dropped before contacting the server.
    #[error("sync did not run: {0}")]
    SyncSkipped(&'static str),
}

enum StoreLocation {
    Disk(PathBuf),
    Memory,
}

enum StoreHandle {
    Closed,
    Ready(Rc<LocalStore>),
    /// Opening failed once; fail fast instead of retrying on every call.
    Failed(String),
}

pub struct Engine<T: SyncTransport, A: AuthProvider> {
    pub(crate) transport: T,
    pub(crate) auth: A,
    location: StoreLocation,
    handle: RefCell<StoreHandle>,
    online: Cell<bool>,
    pub(crate) sync: RefCell<SyncState>,
}

/// Partial goal edit. Inner `Option`s distinguish "set to none" from
/// "leave unchanged".
#[derive(Debug, Default, Clone)]
pub struct GoalUpdate {
    pub name: Option<String>,
    pub color: Option<String>,
    pub target_count: Option<Option<i64>>,
    pub target_period: Option<Option<TargetPeriod>>,
}

/// How far a goal has come in its current target period.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodProgress {
    pub goal_id: String,
    pub completed: u32,
    pub target_count: Option<i64>,
}

impl<T: SyncTransport, A: AuthProvider> Engine<T, A> {
    pub fn new(transport: T, auth: A, db_path: impl Into<PathBuf>) -> Self {
        Self::with_location(transport, auth, StoreLocation::Disk(db_path.into()))
    }

    pub fn in_memory(transport: T, auth: A) -> Self {
        Self::with_location(transport, auth, StoreLocation::Memory)
    }

    fn with_location(transport: T, auth: A, location: StoreLocation) -> Self {
        Self {
            transport,
            auth,
            location,
            handle: RefCell::new(StoreHandle::Closed),
            online: Cell::new(true),
            sync: RefCell::new(SyncState::default()),
        }
    }

    pub(crate) fn store(&self) -> Result<Rc<LocalStore>, EngineError> {
        let mut handle = self.handle.borrow_mut();
        match &*handle {
            StoreHandle::Ready(store) => return Ok(Rc::clone(store)),
            StoreHandle::Failed(message) => {
                return Err(EngineError::StorageInit(message.clone()));
            }
            StoreHandle::Closed => {}
        }
        let opened = match &self.location {
            StoreLocation::Disk(path) => LocalStore::open(path),
            StoreLocation::Memory => LocalStore::open_in_memory(),
        };
        match opened {
            Ok(store) => {
                let store = Rc::new(store);
                *handle = StoreHandle::Ready(Rc::clone(&store));
                Ok(store)
            }
            Err(e) => {
                let message = e.to_string();
                log::error!("local store failed to open: {message}");
                *handle = StoreHandle::Failed(message.clone());
                Err(EngineError::StorageInit(message))
            }
        }
    }

    /// Dropping offline stops sync attempts; it never blocks local writes.
    pub fn set_online(&self, online: bool) {
        self.online.set(online);
    }

    pub fn is_online(&self) -> bool {
        self.online.get()
    }

    // ---- goals ----

    pub fn create_goal(
        &self,
        name: impl Into<String>,
        color: impl Into<String>,
        target_count: Option<i64>,
        target_period: Option<TargetPeriod>,
    ) -> Result<Goal, EngineError> {
        let store = self.store()?;
        let now = Utc::now();
        let goal = Goal {
            // Locally minted id; the server keeps it, so no rewrite on sync.
            id: format!("local-{}-{:08x}", now.timestamp_millis(), rand::random::<u32>()),
            name: name.into(),
            color: color.into(),
            position: store.max_position()? + 1,
            target_count,
            target_period,
            created_at: now,
            archived_at: None,
        };
        let op = self
            .auth
            .session()
            .map(|_| QueuedOperation::create_goal(&goal, now));
        store.put_goal_with_op(&goal, op.as_ref())?;
        Ok(goal)
    }

    pub fn update_goal(&self, id: &str, update: GoalUpdate) -> Result<Goal, EngineError> {
        let store = self.store()?;
        let Some(mut goal) = store.get_goal(id)? else {
            return Err(EngineError::EntityNotFound {
                kind: "goal",
                id: id.to_string(),
            });
        };
        if let Some(name) = update.name {
            goal.name = name;
        }
        if let Some(color) = update.color {
            goal.color = color;
        }
        if let Some(target_count) = update.target_count {
            goal.target_count = target_count;
        }
        if let Some(target_period) = update.target_period {
            goal.target_period = target_period;
        }
        let now = Utc::now();
        let op = self
            .auth
            .session()
            .map(|_| QueuedOperation::update_goal(&goal, now));
        store.put_goal_with_op(&goal, op.as_ref())?;
        Ok(goal)
    }

    /// Archives rather than deletes: the tombstone is what reconciliation
    /// ships to other devices.
    pub fn archive_goal(&self, id: &str) -> Result<(), EngineError> {
        let store = self.store()?;
        let Some(mut goal) = store.get_goal(id)? else {
            return Err(EngineError::EntityNotFound {
                kind: "goal",
                id: id.to_string(),
            });
        };
        let now = Utc::now();
        goal.archived_at = Some(now);
        let op = self
            .auth
            .session()
            .map(|_| QueuedOperation::delete_goal(id, now));
        store.put_goal_with_op(&goal, op.as_ref())?;
        Ok(())
    }

    pub fn get_goals(&self) -> Result<Vec<Goal>, EngineError> {
        Ok(self.store()?.list_active_goals()?)
    }

    pub fn get_goal(&self, id: &str) -> Result<Option<Goal>, EngineError> {
        Ok(self.store()?.get_goal(id)?)
    }

    /// Rewrites positions to match `ordered_ids` (1-based). Goals not named
    /// keep whatever position they had.
    pub fn reorder_goals(&self, ordered_ids: &[String]) -> Result<(), EngineError> {
        let store = self.store()?;
        let positions: Vec<(String, i64)> = ordered_ids
            .iter()
            .enumerate()
            .map(|(index, id)| (id.clone(), index as i64 + 1))
            .collect();
        let now = Utc::now();
        let op = self
            .auth
            .session()
            .map(|_| QueuedOperation::reorder_goals(ordered_ids, now));
        store.reorder_goals_with_op(&positions, op.as_ref())?;
        Ok(())
    }

    // ---- completions ----

    /// Idempotent: checking a day that is already checked returns the
    /// existing completion and queues nothing.
    pub fn create_completion(
        &self,
        goal_id: &str,
        date: NaiveDate,
    ) -> Result<Completion, EngineError> {
        let store = self.store()?;
        if store.get_goal(goal_id)?.is_none() {
            return Err(EngineError::EntityNotFound {
                kind: "goal",
                id: goal_id.to_string(),
            });
        }
        if let Some(existing) = store.find_completion(goal_id, date)? {
            return Ok(existing);
        }
        let now = Utc::now();
        let completion = Completion {
            id: completion_sync_id(goal_id, date),
            goal_id: goal_id.to_string(),
            date,
            created_at: now,
        };
        let op = self
            .auth
            .session()
            .map(|_| QueuedOperation::create_completion(&completion, now));
        store.put_completion_with_op(&completion, op.as_ref())?;
        Ok(completion)
    }

    /// Returns whether anything was removed. Unchecking an unchecked day is
    /// a no-op and queues nothing.
    pub fn delete_completion(&self, goal_id: &str, date: NaiveDate) -> Result<bool, EngineError> {
        let store = self.store()?;
        let Some(existing) = store.find_completion(goal_id, date)? else {
            return Ok(false);
        };
        let now = Utc::now();
        let op = self
            .auth
            .session()
            .map(|_| QueuedOperation::delete_completion(&existing.id, goal_id, date, now));
        store.delete_completion_with_op(goal_id, date, op.as_ref())?;
        Ok(true)
    }

    pub fn get_all_completions(&self) -> Result<Vec<Completion>, EngineError> {
        Ok(self.store()?.list_all_completions()?)
    }

    /// Per-goal progress inside the current target period: calendar month
    /// for monthly targets, ISO week (Monday start) for weekly ones and
    /// goals with no period set.
    pub fn get_current_period_completions(
        &self,
        today: NaiveDate,
    ) -> Result<Vec<PeriodProgress>, EngineError> {
        let store = self.store()?;
        let completions = store.list_all_completions()?;
        let mut progress = Vec::new();
        for goal in store.list_active_goals()? {
            let start = match goal.target_period.unwrap_or(TargetPeriod::Week) {
                TargetPeriod::Month => today.with_day(1).unwrap_or(today),
                TargetPeriod::Week => {
                    today - Days::new(today.weekday().num_days_from_monday().into())
                }
            };
            let completed = completions
                .iter()
                .filter(|c| c.goal_id == goal.id && c.date >= start && c.date <= today)
                .count() as u32;
            progress.push(PeriodProgress {
                goal_id: goal.id,
                completed,
                target_count: goal.target_count,
            });
        }
        Ok(progress)
    }

    // ---- calendar ----

    /// Network-first month view. Any transport failure degrades to local
    /// data; this read never errors because of the network.
    pub async fn get_calendar(&self, month: &str) -> Result<CalendarSnapshot, EngineError> {
        if self.is_online()
            && let Some(session) = self.auth.session()
        {
            match self
                .transport
                .fetch_calendar(&session.access_token, month)
                .await
            {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) => {
                    log::warn!("calendar fetch failed, serving local data: {e}");
                }
            }
        }
        self.local_calendar(month)
    }

    fn local_calendar(&self, month: &str) -> Result<CalendarSnapshot, EngineError> {
        let store = self.store()?;
        let goals = store
            .list_active_goals()?
            .iter()
            .map(goal_to_change)
            .collect();
        let completions = store
            .completions_for_month(month)?
            .iter()
            .map(completion_to_change)
            .collect();
        Ok(CalendarSnapshot { goals, completions })
    }

    // ---- housekeeping ----

    pub fn last_synced_at(&self) -> Result<Option<DateTime<Utc>>, EngineError> {
        Ok(self.store()?.last_synced_at()?)
    }

    /// Wipes all local state, including the queue and cursor. For sign-out.
    pub fn clear_local_data(&self) -> Result<(), EngineError> {
        Ok(self.store()?.clear_all()?)
    }
}

pub(crate) fn goal_to_change(goal: &Goal) -> GoalChange {
    GoalChange {
        id: goal.id.clone(),
        name: goal.name.clone(),
        color: goal.color.clone(),
        position: goal.position,
        target_count: goal.target_count,
        target_period: goal.target_period,
        updated_at: goal.archived_at.unwrap_or(goal.created_at),
        deleted: goal.is_archived(),
    }
}

pub(crate) fn completion_to_change(completion: &Completion) -> CompletionChange {
    CompletionChange {
        goal_id: completion.goal_id.clone(),
        date: completion.date,
        completed: true,
        updated_at: completion.created_at,
    }
}
