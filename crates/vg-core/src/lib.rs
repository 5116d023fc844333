//! # vg-core: The "Record" of VIGIL
//!
//! Defines what one entry of the audit trail looks like and the contract
//! every persistence backend must honour.
//!
//! A [`Record`] is created exactly once through a [`LogSink`] and never
//! mutated afterwards. Records leave the trail only through a bulk
//! retention purge or an explicit reset.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sink-assigned record identifier. Monotonically increasing.
pub type RecordId = i64;

/// Identifier of the user or agent responsible for an event.
pub type ActorId = i64;

/// Actor id used for system, cron and CLI activity.
pub const SYSTEM_ACTOR: ActorId = 0;

/// Extra structured data: one key maps to one or many string values.
pub type RecordMeta = BTreeMap<String, Vec<String>>;

/// Storage format for `created_at`. Fixed width, so lexical order is
/// chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Parse format accepting any fractional precision.
pub const TIMESTAMP_PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

// =============================================================================
// Record
// =============================================================================

/// One persisted audit-trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    /// Id of the affected entity (post, user, option...), if any.
    pub object_id: Option<i64>,
    pub actor_id: ActorId,
    /// Role of the actor at write time. Empty for the system actor.
    pub actor_role: String,
    pub created_at: DateTime<Utc>,
    /// Human-readable message, rendered at write time.
    pub summary: String,
    pub connector: String,
    pub context: String,
    pub action: String,
    pub ip: Option<String>,
    #[serde(default)]
    pub meta: RecordMeta,
}

/// A record as handed to a [`LogSink`], before an id is assigned.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewRecord {
    pub object_id: Option<i64>,
    pub actor_id: ActorId,
    pub actor_role: String,
    /// Left empty by producers; the sink stamps it on insert.
    pub created_at: Option<DateTime<Utc>>,
    pub summary: String,
    pub connector: String,
    pub context: String,
    pub action: String,
    pub ip: Option<String>,
    pub meta: RecordMeta,
}

impl NewRecord {
    /// Reject records whose connector, context and action are all empty.
    pub fn validate(&self) -> Result<(), SinkError> {
        if self.connector.is_empty() && self.context.is_empty() && self.action.is_empty() {
            return Err(SinkError::Invalid(
                "connector, context and action cannot all be empty".into(),
            ));
        }
        Ok(())
    }

    /// Finalise into a [`Record`]. `created_at` keeps a producer-supplied
    /// timestamp, otherwise `now`.
    pub fn into_record(self, id: RecordId, now: DateTime<Utc>) -> Record {
        Record {
            id,
            object_id: self.object_id,
            actor_id: self.actor_id,
            actor_role: self.actor_role,
            created_at: self.created_at.unwrap_or(now),
            summary: self.summary,
            connector: self.connector,
            context: self.context,
            action: self.action,
            ip: self.ip,
            meta: self.meta,
        }
    }
}

// =============================================================================
// Actor
// =============================================================================

/// Who is acting during one host invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub ip: Option<String>,
}

impl Actor {
    pub fn system() -> Self {
        Self {
            id: SYSTEM_ACTOR,
            role: String::new(),
            ip: None,
        }
    }

    pub fn user(id: ActorId, role: impl Into<String>) -> Self {
        Self {
            id,
            role: role.into(),
            ip: None,
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    #[inline]
    pub fn is_system(&self) -> bool {
        self.id == SYSTEM_ACTOR
    }
}

impl Default for Actor {
    fn default() -> Self {
        Self::system()
    }
}

// =============================================================================
// Sink contract
// =============================================================================

/// Failure to persist a record.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Record rejected: {0}")]
    Invalid(String),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Sink unavailable")]
    Unavailable,
}

/// Persists records.
///
/// `write` assigns `id` and `created_at` and is atomic: a partially written
/// record is never visible to readers. Retries are the sink's business.
pub trait LogSink: Send + Sync {
    fn write(&self, record: NewRecord) -> Result<Record, SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> NewRecord {
        NewRecord {
            summary: "Updated \"blogname\"".into(),
            connector: "settings".into(),
            context: "general".into(),
            action: "updated".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_accepts_partial_labels() {
        let mut r = sample();
        r.connector.clear();
        r.context.clear();
        assert!(r.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_all_empty_labels() {
        let mut r = sample();
        r.connector.clear();
        r.context.clear();
        r.action.clear();
        assert!(matches!(r.validate(), Err(SinkError::Invalid(_))));
    }

    #[test]
    fn test_into_record_stamps_creation_time() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let record = sample().into_record(7, now);
        assert_eq!(record.id, 7);
        assert_eq!(record.created_at, now);
        assert_eq!(record.actor_id, SYSTEM_ACTOR);
    }

    #[test]
    fn test_into_record_keeps_supplied_time() {
        let earlier = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut r = sample();
        r.created_at = Some(earlier);
        assert_eq!(r.into_record(1, now).created_at, earlier);
    }

    #[test]
    fn test_system_actor() {
        assert!(Actor::system().is_system());
        assert!(!Actor::user(3, "administrator").is_system());
        assert_eq!(Actor::default(), Actor::system());
    }
}
