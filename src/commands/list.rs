use crate::error::Result;
use crate::output::{self, Format};
use crate::store::repo::Repo;

pub fn locks(repo: &Repo, format: Format) -> Result<()> {
    let locks = repo.manager.list_locks()?;
    output::print_locks(&locks, format)
}

pub fn instances(repo: &Repo, format: Format) -> Result<()> {
    let instances = repo.manager.list_instances()?;
    output::print_instances(&instances, format)
}
