use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One running agent process/session known to the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Instance {
    /// A bare record for a holder we have no metadata for yet.
    pub fn bare(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            branch: None,
            task: None,
            cwd: None,
            pid: None,
            registered_at: now,
            last_heartbeat: now,
        }
    }
}

/// A lease on one file path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lock {
    pub file_path: String,
    pub holder_instance_id: String,
    pub intent: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_fingerprint: Option<String>,
}

impl Lock {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_active(now)
    }
}

/// The shared document: every instance and every lock.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkRegistry {
    #[serde(default)]
    pub instances: BTreeMap<String, Instance>,
    #[serde(default)]
    pub locks: BTreeMap<String, Lock>,
}

impl WorkRegistry {
    /// The lock on `file_path` if it has not expired.
    pub fn active_lock(&self, file_path: &str, now: DateTime<Utc>) -> Option<&Lock> {
        self.locks.get(file_path).filter(|l| l.is_active(now))
    }

    pub fn holder(&self, lock: &Lock) -> LockHolder {
        LockHolder {
            lock: lock.clone(),
            instance: self.instances.get(&lock.holder_instance_id).cloned(),
        }
    }

    /// Bump (or create) the instance's heartbeat.
    pub fn touch_instance(&mut self, instance_id: &str, now: DateTime<Utc>) {
        self.instances
            .entry(instance_id.to_string())
            .and_modify(|i| i.last_heartbeat = now)
            .or_insert_with(|| Instance::bare(instance_id, now));
    }
}

/// An active lock together with whatever we know about its holder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockHolder {
    pub lock: Lock,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<Instance>,
}

impl LockHolder {
    pub fn instance_id(&self) -> &str {
        &self.lock.holder_instance_id
    }

    pub fn branch(&self) -> &str {
        self.instance
            .as_ref()
            .and_then(|i| i.branch.as_deref())
            .unwrap_or("unknown")
    }

    pub fn task(&self) -> &str {
        self.instance
            .as_ref()
            .and_then(|i| i.task.as_deref())
            .unwrap_or("unknown")
    }

    pub fn is_known(&self) -> bool {
        self.instance.is_some()
    }
}

/// Result of an acquire attempt.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AcquireOutcome {
    /// No lock existed; a new one was written.
    Acquired,
    /// Caller already held the lock; lease extended.
    Renewed,
    /// An expired lock held by someone else was overwritten.
    Reclaimed { previous_holder: String },
    /// An active lock belongs to another instance.
    LockedByOther { holder: LockHolder },
}

impl AcquireOutcome {
    pub fn is_granted(&self) -> bool {
        !matches!(self, Self::LockedByOther { .. })
    }

    /// CLI exit code: 0 granted, 10 locked by other, 11 granted after reclaim.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Acquired | Self::Renewed => 0,
            Self::LockedByOther { .. } => 10,
            Self::Reclaimed { .. } => 11,
        }
    }
}

/// Result of comparing a file against its lock's fingerprint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConflictStatus {
    Clean,
    Changed {
        expected: Option<String>,
        actual: Option<String>,
    },
    /// No active lock to compare against.
    Unlocked,
}

impl ConflictStatus {
    pub fn is_conflict_free(&self) -> bool {
        !matches!(self, Self::Changed { .. })
    }
}

/// What `prune` removed.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PruneReport {
    pub expired_locks: Vec<String>,
    pub stale_instances: Vec<String>,
}
