//! Shared data model and sync wire types for Cadence, an offline-first
//! habit/goal tracker.
//!
//! This crate is deliberately small: it holds the entities the client
//! persists locally (goals, completions, queued operations) and the JSON
//! records that cross the wire during reconciliation. The engine crate and
//! any server implementation both speak these types, so nothing in here may
//! depend on storage or transport details.

pub mod model;
pub mod wire;

pub use model::{
    Completion, CompletionFields, Goal, GoalFields, OperationKind, PayloadError,
    QueuedOperation, ReorderFields, TargetPeriod, completion_sync_id,
};
pub use wire::{CalendarSnapshot, CompletionChange, GoalChange, SyncRequest, SyncResponse};
