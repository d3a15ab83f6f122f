pub mod hook;
pub mod init;
pub mod list;
pub mod lock;
pub mod prune;
pub mod whoami;

use std::path::Path;

use crate::identity::{self, Identity};
use crate::store::repo::Repo;

/// This session's identity in `repo`, registered as a live instance.
pub(crate) fn session_identity(
    repo: &Repo,
    session_id: Option<&str>,
    cwd: &Path,
) -> crate::error::Result<Identity> {
    let key = identity::resolve_session_key(session_id);
    let identity = repo.identities.get_or_create(&key, cwd);
    repo.manager.register_instance(&identity)?;
    Ok(identity)
}
