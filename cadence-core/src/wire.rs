//! Request and response bodies for the sync endpoint and the calendar read.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Goal, TargetPeriod, completion_sync_id};

/// Goal state as exchanged with the server. Uploads describe local intent;
/// downloads describe the server's merged truth. A `deleted` change is a
/// tombstone, not an absence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalChange {
    pub id: String,
    pub name: String,
    pub color: String,
    pub position: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_period: Option<TargetPeriod>,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
}

impl GoalChange {
    /// The local row a downloaded change maps to. `updated_at` doubles as
    /// `created_at` for goals first seen via download, and as `archived_at`
    /// for tombstones.
    pub fn into_goal(self) -> Goal {
        let archived_at = self.deleted.then_some(self.updated_at);
        Goal {
            id: self.id,
            name: self.name,
            color: self.color,
            position: self.position,
            target_count: self.target_count,
            target_period: self.target_period,
            created_at: self.updated_at,
            archived_at,
        }
    }
}

/// Completion state, keyed by `(goal_id, date)`. `completed: false` asks the
/// receiver to remove the pair rather than to store a negative record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChange {
    pub goal_id: String,
    pub date: NaiveDate,
    pub completed: bool,
    pub updated_at: DateTime<Utc>,
}

impl CompletionChange {
    pub fn sync_id(&self) -> String {
        completion_sync_id(&self.goal_id, self.date)
    }
}

/// Uploaded batch. `last_synced_at: None` means this client has never
/// synced under its current identity, and the change lists carry its entire
/// local state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub last_synced_at: Option<DateTime<Utc>>,
    pub goals: Vec<GoalChange>,
    pub completions: Vec<CompletionChange>,
}

/// The server's delta since the uploaded cursor, plus the authoritative
/// clock reading to persist as the next cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub server_time: DateTime<Utc>,
    pub goals: Vec<GoalChange>,
    pub completions: Vec<CompletionChange>,
}

/// Read-only month view served by `GET /calendar`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarSnapshot {
    pub goals: Vec<GoalChange>,
    pub completions: Vec<CompletionChange>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn null_cursor_serializes_as_json_null() {
        let request = SyncRequest {
            last_synced_at: None,
            goals: vec![],
            completions: vec![],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["last_synced_at"], serde_json::Value::Null);
    }

    #[test]
    fn completion_change_dates_use_plain_iso_days() {
        let change = CompletionChange {
            goal_id: "goal-1".to_string(),
            date: NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
            completed: true,
            updated_at: Utc.with_ymd_and_hms(2026, 1, 5, 9, 30, 0).unwrap(),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["date"], "2026-01-05");
        assert_eq!(change.sync_id(), "goal-1-2026-01-05");
    }

    #[test]
    fn deleted_goal_change_becomes_local_tombstone() {
        let at = Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).unwrap();
        let change = GoalChange {
            id: "g1".to_string(),
            name: "Read".to_string(),
            color: "#334455".to_string(),
            position: 2,
            target_count: None,
            target_period: None,
            updated_at: at,
            deleted: true,
        };
        let goal = change.into_goal();
        assert_eq!(goal.archived_at, Some(at));
        assert_eq!(goal.created_at, at);
    }
}
