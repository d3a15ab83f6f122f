//! Host hook integration: turn a pending file mutation into allow/deny.
//!
//! Only an active lock held by another instance denies. Every failure of the
//! coordination layer itself degrades to an allow, logged with its error code
//! so degraded runs can be told apart from genuinely unlocked ones.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{LatchError, Result};
use crate::identity::Identity;
use crate::manager::LockManager;
use crate::model::{AcquireOutcome, ConflictStatus, LockHolder};
use crate::paths;

/// The lock operations the adapter needs.
pub trait Coordinator {
    fn register_instance(&self, identity: &Identity) -> Result<()>;
    fn check_lock(&self, file_path: &Path) -> Result<Option<LockHolder>>;
    fn detect_own_conflict(&self, file_path: &Path, instance_id: &str)
    -> Result<ConflictStatus>;
    fn acquire_lock(&self, file_path: &Path, instance_id: &str, intent: &str)
    -> Result<AcquireOutcome>;
    fn sync_fingerprint(&self, file_path: &Path, instance_id: &str) -> Result<bool>;
    fn release_all(&self, instance_id: &str) -> Result<Vec<String>>;
}

impl Coordinator for LockManager {
    fn register_instance(&self, identity: &Identity) -> Result<()> {
        LockManager::register_instance(self, identity)
    }

    fn check_lock(&self, file_path: &Path) -> Result<Option<LockHolder>> {
        LockManager::check_lock(self, file_path)
    }

    fn detect_own_conflict(&self, file_path: &Path, instance_id: &str) -> Result<ConflictStatus> {
        LockManager::detect_own_conflict(self, file_path, instance_id)
    }

    fn acquire_lock(
        &self,
        file_path: &Path,
        instance_id: &str,
        intent: &str,
    ) -> Result<AcquireOutcome> {
        LockManager::acquire_lock(self, file_path, instance_id, intent)
    }

    fn sync_fingerprint(&self, file_path: &Path, instance_id: &str) -> Result<bool> {
        LockManager::sync_fingerprint(self, file_path, instance_id)
    }

    fn release_all(&self, instance_id: &str) -> Result<Vec<String>> {
        LockManager::release_all(self, instance_id)
    }
}

// ---------------------------------------------------------------------------
// Host wire format
// ---------------------------------------------------------------------------

/// JSON the host writes to the hook's stdin.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct HookInput {
    #[serde(default)]
    pub hook_event_name: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<ToolInput>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ToolInput {
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub notebook_path: Option<String>,
}

impl HookInput {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(LatchError::InvalidHookInput("empty stdin".into()));
        }
        serde_json::from_str(raw).map_err(|e| LatchError::InvalidHookInput(e.to_string()))
    }

    /// The path the tool will write, if any.
    pub fn target_path(&self) -> Option<&str> {
        let input = self.tool_input.as_ref()?;
        input
            .file_path
            .as_deref()
            .or(input.notebook_path.as_deref())
            .filter(|p| !p.trim().is_empty())
    }
}

/// A pending file mutation, resolved from host input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRequest {
    pub tool_name: String,
    pub file_path: Option<String>,
    pub cwd: PathBuf,
}

impl HookRequest {
    pub fn from_input(input: &HookInput, fallback_cwd: &Path) -> Self {
        Self {
            tool_name: input.tool_name.clone().unwrap_or_default(),
            file_path: input.target_path().map(String::from),
            cwd: input
                .cwd
                .as_deref()
                .filter(|c| !c.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| fallback_cwd.to_path_buf()),
        }
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Why a mutation was allowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum AllowReason {
    Acquired,
    Renewed,
    Reclaimed { previous_holder: String },
    /// Nothing to coordinate: no path, or a tool that does not write.
    NotCoordinated,
    /// The path is inside the coordination directory itself.
    OwnStorage,
    /// Coordination failed; allowed without a lock.
    Degraded(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allowed(AllowReason),
    AllowedWithWarning { reason: AllowReason, warning: String },
    Denied { holder: LockHolder, message: String },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Denied { .. })
    }

    pub fn warning(&self) -> Option<&str> {
        match self {
            Self::AllowedWithWarning { warning, .. } => Some(warning),
            _ => None,
        }
    }

    /// Response in the host's PreToolUse shape; `None` means "print nothing".
    pub fn to_host_response(&self) -> Option<serde_json::Value> {
        match self {
            Self::Allowed(_) => None,
            Self::AllowedWithWarning { warning, .. } => Some(json!({
                "systemMessage": warning,
                "hookSpecificOutput": {
                    "hookEventName": "PreToolUse",
                    "additionalContext": warning,
                }
            })),
            Self::Denied { message, .. } => Some(json!({
                "hookSpecificOutput": {
                    "hookEventName": "PreToolUse",
                    "permissionDecision": "deny",
                    "permissionDecisionReason": message,
                }
            })),
        }
    }
}

pub fn deny_message(file_path: &str, holder: &LockHolder, registry_path: &Path) -> String {
    let who = if holder.is_known() {
        holder.instance_id().to_string()
    } else {
        format!("{} (unknown instance)", holder.instance_id())
    };
    format!(
        "File '{file_path}' is locked by instance {who} \
         (branch: {}, task: {}, intent: {}) until {}. \
         Wait for it to finish, or inspect {} to see who holds what.",
        holder.branch(),
        holder.task(),
        holder.lock.intent,
        holder.lock.expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
        registry_path.display(),
    )
}

fn conflict_warning(file_path: &str) -> String {
    format!(
        "Warning: '{file_path}' changed since this session locked it \
         (edited outside this session?). Re-read it before writing."
    )
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct HookAdapter<'a> {
    coordinator: &'a dyn Coordinator,
    identity: &'a Identity,
    config: &'a Config,
    latch_dir: PathBuf,
}

impl<'a> HookAdapter<'a> {
    pub fn new(
        coordinator: &'a dyn Coordinator,
        identity: &'a Identity,
        config: &'a Config,
        latch_dir: &Path,
    ) -> Self {
        Self {
            coordinator,
            identity,
            config,
            latch_dir: latch_dir.to_path_buf(),
        }
    }

    /// Decide whether the pending mutation may proceed. Never fails.
    pub fn evaluate(&self, request: &HookRequest) -> Decision {
        if !self.config.is_mutating_tool(&request.tool_name) {
            return Decision::Allowed(AllowReason::NotCoordinated);
        }
        let Some(raw) = request.file_path.as_deref() else {
            debug!(tool = %request.tool_name, "no file path; nothing to coordinate");
            return Decision::Allowed(AllowReason::NotCoordinated);
        };
        let path = match paths::canonical_file_path(raw, &request.cwd) {
            Ok(p) => p,
            Err(e) => return degraded(&e),
        };
        if paths::is_within(&path, &self.latch_dir) {
            return Decision::Allowed(AllowReason::OwnStorage);
        }
        match self.coordinate(&path, &request.tool_name) {
            Ok(decision) => decision,
            Err(e) => degraded(&e),
        }
    }

    fn coordinate(&self, path: &Path, tool_name: &str) -> Result<Decision> {
        let key = paths::key(path);
        self.coordinator.register_instance(self.identity)?;

        if let Some(holder) = self.coordinator.check_lock(path)?
            && holder.instance_id() != self.identity.id
        {
            return Ok(self.deny(&key, holder));
        }
        // Also covers our own lapsed lease: edits made in the gap still warn.
        let conflict = self
            .coordinator
            .detect_own_conflict(path, &self.identity.id)?;

        let intent = format!("Modifying file via {tool_name}");
        let reason = match self
            .coordinator
            .acquire_lock(path, &self.identity.id, &intent)?
        {
            AcquireOutcome::Acquired => AllowReason::Acquired,
            AcquireOutcome::Renewed => AllowReason::Renewed,
            AcquireOutcome::Reclaimed { previous_holder } => {
                AllowReason::Reclaimed { previous_holder }
            }
            // Lost a race between check and acquire.
            AcquireOutcome::LockedByOther { holder } => return Ok(self.deny(&key, holder)),
        };

        Ok(match conflict {
            ConflictStatus::Changed { .. } => Decision::AllowedWithWarning {
                reason,
                warning: conflict_warning(&key),
            },
            _ => Decision::Allowed(reason),
        })
    }

    fn deny(&self, key: &str, holder: LockHolder) -> Decision {
        let message = deny_message(
            key,
            &holder,
            &self.latch_dir.join(crate::store::registry::REGISTRY_FILE),
        );
        Decision::Denied { holder, message }
    }

    /// After a successful write: absorb the holder's own change into the
    /// lock's fingerprint. Best-effort.
    pub fn after_write(&self, request: &HookRequest) {
        if !self.config.is_mutating_tool(&request.tool_name) {
            return;
        }
        let Some(raw) = request.file_path.as_deref() else {
            return;
        };
        let result = paths::canonical_file_path(raw, &request.cwd)
            .and_then(|p| self.coordinator.sync_fingerprint(&p, &self.identity.id));
        if let Err(e) = result {
            warn!(code = e.code(), error = %e, "post-write fingerprint sync skipped");
        }
    }

    /// Session is over: drop everything this instance holds. Best-effort.
    pub fn end_session(&self) -> Vec<String> {
        match self.coordinator.release_all(&self.identity.id) {
            Ok(released) => released,
            Err(e) => {
                warn!(code = e.code(), error = %e, "session-end release skipped");
                Vec::new()
            }
        }
    }
}

/// Fail open: log the cause, allow the mutation.
pub fn degraded(err: &LatchError) -> Decision {
    warn!(code = err.code(), error = %err, "coordination degraded; allowing write");
    Decision::Allowed(AllowReason::Degraded(err.code().to_string()))
}
