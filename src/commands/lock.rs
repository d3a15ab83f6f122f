use std::path::{Path, PathBuf};

use colored::Colorize;

use crate::error::Result;
use crate::model::ConflictStatus;
use crate::output::{self, Format};
use crate::paths;
use crate::store::repo::Repo;

pub const EXIT_LOCKED_BY_OTHER: i32 = 10;
pub const EXIT_CONFLICT: i32 = 12;

fn resolve(raw: &str, cwd: &Path) -> Result<(PathBuf, String)> {
    let path = paths::canonical_file_path(raw, cwd)?;
    let key = paths::key(&path);
    Ok((path, key))
}

/// Exit 0 when free or held by this session, 10 when held by another.
pub fn check(
    repo: &Repo,
    session_id: Option<&str>,
    raw: &str,
    cwd: &Path,
    format: Format,
) -> Result<i32> {
    let identity = super::session_identity(repo, session_id, cwd)?;
    let (path, key) = resolve(raw, cwd)?;
    let holder = repo.manager.check_lock(&path)?;
    output::print_check(&key, holder.as_ref(), &identity.id, format)?;
    Ok(match holder {
        Some(h) if h.instance_id() != identity.id => EXIT_LOCKED_BY_OTHER,
        _ => 0,
    })
}

pub fn acquire(
    repo: &Repo,
    session_id: Option<&str>,
    raw: &str,
    intent: Option<&str>,
    cwd: &Path,
    format: Format,
) -> Result<i32> {
    let identity = super::session_identity(repo, session_id, cwd)?;
    let (path, key) = resolve(raw, cwd)?;
    let outcome = repo
        .manager
        .acquire_lock(&path, &identity.id, intent.unwrap_or("Manual lock"))?;
    output::print_acquire(&key, &outcome, format)?;
    Ok(outcome.exit_code())
}

pub fn release(
    repo: &Repo,
    session_id: Option<&str>,
    raw: Option<&str>,
    all: bool,
    cwd: &Path,
    format: Format,
) -> Result<i32> {
    let identity = super::session_identity(repo, session_id, cwd)?;
    let released = if all {
        repo.manager.release_all(&identity.id)?
    } else {
        let Some(raw) = raw else {
            return Err(crate::error::LatchError::InvalidPath(
                String::new(),
                "a path or --all is required".into(),
            ));
        };
        let (path, key) = resolve(raw, cwd)?;
        if repo.manager.release_lock(&path, &identity.id)? {
            vec![key]
        } else {
            Vec::new()
        }
    };
    match format {
        Format::Json => println!("{}", serde_json::json!({ "released": released })),
        Format::Pretty => {
            if released.is_empty() {
                println!("{}", "Nothing released.".dimmed());
            }
            for path in &released {
                println!("Released {}", path.green());
            }
        }
        Format::Minimal => {
            for path in &released {
                println!("{path}");
            }
        }
    }
    Ok(0)
}

/// Exit 12 when the file changed since its lock recorded it.
pub fn conflict(repo: &Repo, raw: &str, cwd: &Path, format: Format) -> Result<i32> {
    let (path, key) = resolve(raw, cwd)?;
    let status = repo.manager.detect_conflict(&path)?;
    output::print_conflict(&key, &status, format)?;
    Ok(match status {
        ConflictStatus::Changed { .. } => EXIT_CONFLICT,
        _ => 0,
    })
}
