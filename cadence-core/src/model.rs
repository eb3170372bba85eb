//! The entities the client stores locally.
//!
//! Timestamps are always UTC and serialize as RFC 3339; calendar dates carry
//! no time component at all. The `QueuedOperation` payload is intent-sourced:
//! it records the field values the user asked for, not a diff against state
//! that may have changed by the time the queue drains.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

/// A tracked goal. `archived_at` is a tombstone: archived goals disappear
/// from the default listing but stay on disk so reconciliation can ship the
/// deletion to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub name: String,
    pub color: String,
    pub position: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_period: Option<TargetPeriod>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
}

impl Goal {
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetPeriod {
    Week,
    Month,
}

/// One checked-off day for one goal. At most one completion per
/// `(goal_id, date)` pair is meaningful; duplicates are resolved by id,
/// never summed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub id: String,
    pub goal_id: String,
    pub date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

/// Deterministic id for completions applied from a server delta, so
/// repeated applies of the same delta stay idempotent.
pub fn completion_sync_id(goal_id: &str, date: NaiveDate) -> String {
    format!("{goal_id}-{date}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateGoal,
    UpdateGoal,
    DeleteGoal,
    CreateCompletion,
    DeleteCompletion,
    ReorderGoals,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateGoal => "create_goal",
            Self::UpdateGoal => "update_goal",
            Self::DeleteGoal => "delete_goal",
            Self::CreateCompletion => "create_completion",
            Self::DeleteCompletion => "delete_completion",
            Self::ReorderGoals => "reorder_goals",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create_goal" => Some(Self::CreateGoal),
            "update_goal" => Some(Self::UpdateGoal),
            "delete_goal" => Some(Self::DeleteGoal),
            "create_completion" => Some(Self::CreateCompletion),
            "delete_completion" => Some(Self::DeleteCompletion),
            "reorder_goals" => Some(Self::ReorderGoals),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable record of one locally-originated mutation, waiting to be
/// replayed against the server. Owned exclusively by the operation queue:
/// after creation only `retry_count` ever changes, and the record is deleted
/// only once the server has accepted the batch containing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: String,
    pub kind: OperationKind,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
}

/// Intended end-state of a goal, as carried in goal operation payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalFields {
    pub name: String,
    pub color: String,
    pub position: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_period: Option<TargetPeriod>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionFields {
    pub goal_id: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReorderFields {
    pub goal_ids: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("could not decode {kind} payload: {source}")]
pub struct PayloadError {
    pub kind: OperationKind,
    #[source]
    pub source: serde_json::Error,
}

impl QueuedOperation {
    fn new(
        kind: OperationKind,
        entity_id: &str,
        payload: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Self {
        // The sequence keeps ids unique (and id order meaningful) when
        // several operations land in the same millisecond.
        static SEQUENCE: AtomicU64 = AtomicU64::new(0);
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self {
            id: format!("op-{}-{seq:06}", at.timestamp_millis()),
            kind,
            entity_id: entity_id.to_string(),
            payload,
            timestamp: at,
            retry_count: 0,
        }
    }

    pub fn create_goal(goal: &Goal, at: DateTime<Utc>) -> Self {
        Self::new(OperationKind::CreateGoal, &goal.id, goal_payload(goal), at)
    }

    pub fn update_goal(goal: &Goal, at: DateTime<Utc>) -> Self {
        Self::new(OperationKind::UpdateGoal, &goal.id, goal_payload(goal), at)
    }

    /// Deletion is implied by the kind plus the entity id; no payload.
    pub fn delete_goal(goal_id: &str, at: DateTime<Utc>) -> Self {
        Self::new(OperationKind::DeleteGoal, goal_id, serde_json::Value::Null, at)
    }

    pub fn create_completion(completion: &Completion, at: DateTime<Utc>) -> Self {
        let payload = serde_json::json!({
            "goal_id": completion.goal_id,
            "date": completion.date,
        });
        Self::new(OperationKind::CreateCompletion, &completion.id, payload, at)
    }

    pub fn delete_completion(
        completion_id: &str,
        goal_id: &str,
        date: NaiveDate,
        at: DateTime<Utc>,
    ) -> Self {
        let payload = serde_json::json!({ "goal_id": goal_id, "date": date });
        Self::new(OperationKind::DeleteCompletion, completion_id, payload, at)
    }

    /// Carries the full ordered id list so replay does not depend on state
    /// that later reorders may have overwritten.
    pub fn reorder_goals(goal_ids: &[String], at: DateTime<Utc>) -> Self {
        let payload = serde_json::json!({ "goal_ids": goal_ids });
        Self::new(OperationKind::ReorderGoals, "goals", payload, at)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| PayloadError {
            kind: self.kind,
            source,
        })
    }
}

fn goal_payload(goal: &Goal) -> serde_json::Value {
    serde_json::json!({
        "name": goal.name,
        "color": goal.color,
        "position": goal.position,
        "target_count": goal.target_count,
        "target_period": goal.target_period,
    })
}
