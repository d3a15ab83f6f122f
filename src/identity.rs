use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{LatchError, Result};

const SESSIONS_DIR: &str = "sessions";
const READ_ATTEMPTS: u32 = 3;

/// The calling process's coordination identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub session_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Not persisted: true when the session file could not be written and
    /// this identity lives only as long as the process.
    #[serde(skip)]
    pub ephemeral: bool,
}

impl Identity {
    /// An identity that is never written anywhere.
    pub fn ephemeral(session_key: &str, branch: Option<String>) -> Self {
        Self {
            id: generate_instance_id(),
            session_key: session_key.to_string(),
            branch,
            task: None,
            created_at: Utc::now(),
            ephemeral: true,
        }
    }
}

/// Generate a collision-resistant instance id:
/// `inst-<utc timestamp>-<pid>-<8 hex random>`.
pub fn generate_instance_id() -> String {
    let mut bytes = [0u8; 4];
    if getrandom::fill(&mut bytes).is_err() {
        // Fall back to clock noise; pid + timestamp already separate processes.
        let nanos = Utc::now().timestamp_subsec_nanos();
        bytes = nanos.to_le_bytes();
    }
    let suffix: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "inst-{}-{}-{suffix}",
        Utc::now().format("%Y%m%d%H%M%S"),
        std::process::id()
    )
}

/// Explicit instance id from `$LATCH_INSTANCE_ID`, if set.
pub fn instance_override() -> Option<String> {
    std::env::var("LATCH_INSTANCE_ID")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve the key naming this session's identity file.
///
/// Order: explicit value → `$LATCH_SESSION_ID` → `$CLAUDE_SESSION_ID` →
/// parent process id (unix) → `default`.
pub fn resolve_session_key(explicit: Option<&str>) -> String {
    let raw = explicit
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .or_else(|| env_nonempty("LATCH_SESSION_ID"))
        .or_else(|| env_nonempty("CLAUDE_SESSION_ID"))
        .unwrap_or_else(parent_process_key);
    sanitize_key(&raw)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(unix)]
fn parent_process_key() -> String {
    format!("ppid-{}", std::os::unix::process::parent_id())
}

#[cfg(not(unix))]
fn parent_process_key() -> String {
    "default".to_string()
}

/// Keep keys safe as file names: `[A-Za-z0-9_-]`, everything else becomes `_`.
fn sanitize_key(raw: &str) -> String {
    let key: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if key.is_empty() {
        "default".to_string()
    } else {
        key
    }
}

/// Per-session identity files under `.latch/sessions/`.
pub struct IdentityStore {
    root: PathBuf,
}

impl IdentityStore {
    pub fn open(latch_dir: &Path) -> Self {
        Self {
            root: latch_dir.join(SESSIONS_DIR),
        }
    }

    fn session_path(&self, session_key: &str) -> PathBuf {
        self.root.join(format!("{session_key}.json"))
    }

    /// Return this session's identity, creating and persisting it on first
    /// use. `cwd` is used to capture the current branch.
    ///
    /// Never fails: an unwritable session directory degrades to an ephemeral
    /// identity for this process.
    pub fn get_or_create(&self, session_key: &str, cwd: &Path) -> Identity {
        let mut identity = self.load_or_create(session_key, cwd);
        if let Some(id) = instance_override() {
            identity.id = id;
        }
        identity
    }

    fn load_or_create(&self, session_key: &str, cwd: &Path) -> Identity {
        match self.read_settled(session_key) {
            Ok(Some(existing)) => return existing,
            Ok(None) => {}
            Err(e) => {
                warn!(session_key, error = %e, "unreadable session file; regenerating");
                if let Err(e) = fs::remove_file(self.session_path(session_key)) {
                    debug!(session_key, error = %e, "could not remove unreadable session file");
                }
            }
        }
        self.create(session_key, cwd)
    }

    /// Persist a fresh identity. If another process of the same session
    /// created one first, adopt theirs.
    fn create(&self, session_key: &str, cwd: &Path) -> Identity {
        let branch = crate::git::current_branch(cwd);
        let identity = Identity {
            id: generate_instance_id(),
            session_key: session_key.to_string(),
            branch: branch.clone(),
            task: None,
            created_at: Utc::now(),
            ephemeral: false,
        };
        let result = self.write_new(&identity).and_then(|created| {
            if created {
                debug!(id = %identity.id, session_key, "created session identity");
                return Ok(identity);
            }
            match self.read_settled(session_key)? {
                Some(winner) => {
                    debug!(id = %winner.id, session_key, "adopted concurrently created identity");
                    Ok(winner)
                }
                None => Err(LatchError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    "session file vanished after creation",
                ))),
            }
        });
        match result {
            Ok(identity) => identity,
            Err(e) => {
                warn!(session_key, error = %e, "cannot persist identity; using ephemeral id");
                Identity::ephemeral(session_key, branch)
            }
        }
    }

    /// Record the informational task for this session.
    pub fn set_task(&self, session_key: &str, cwd: &Path, task: &str) -> Result<Identity> {
        let mut identity = self.load_or_create(session_key, cwd);
        let task = task.trim();
        identity.task = (!task.is_empty()).then(|| task.to_string());
        if !identity.ephemeral {
            self.stage(&identity)?
                .persist(self.session_path(session_key))
                .map_err(|e| e.error)?;
        }
        if let Some(id) = instance_override() {
            identity.id = id;
        }
        Ok(identity)
    }

    fn read(&self, session_key: &str) -> Result<Option<Identity>> {
        let path = self.session_path(session_key);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// `read`, retried briefly so a file replaced mid-read is not mistaken
    /// for a corrupt one.
    fn read_settled(&self, session_key: &str) -> Result<Option<Identity>> {
        let mut attempt = 1;
        loop {
            match self.read(session_key) {
                Err(e) if attempt < READ_ATTEMPTS => {
                    debug!(session_key, attempt, error = %e, "session file unreadable; retrying");
                    std::thread::sleep(Duration::from_millis(10 * u64::from(attempt)));
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Fully written, fsynced temp file next to the session files.
    fn stage(&self, identity: &Identity) -> Result<NamedTempFile> {
        fs::create_dir_all(&self.root)?;
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(serde_json::to_string_pretty(identity)?.as_bytes())?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }

    /// Link the identity into place unless a session file already exists.
    /// `Ok(false)` means another writer won.
    fn write_new(&self, identity: &Identity) -> Result<bool> {
        let tmp = self.stage(identity)?;
        match tmp.persist_noclobber(self.session_path(&identity.session_key)) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.error.into()),
        }
    }
}
