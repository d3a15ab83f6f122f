use std::path::Path;

use crate::error::Result;
use crate::output::{self, Format};
use crate::store::repo::Repo;

pub fn run(
    repo: &Repo,
    session_id: Option<&str>,
    task: Option<&str>,
    cwd: &Path,
    format: Format,
) -> Result<()> {
    let identity = match task {
        Some(task) => {
            let key = crate::identity::resolve_session_key(session_id);
            let identity = repo.identities.set_task(&key, cwd, task)?;
            repo.manager.register_instance(&identity)?;
            identity
        }
        None => super::session_identity(repo, session_id, cwd)?,
    };
    output::print_identity(&identity, format)
}
