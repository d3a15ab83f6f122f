use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::error::Result;
use crate::store::registry::RegistryStore;
use crate::store::repo::LATCH_DIR;

/// Per-machine state that should not be committed.
const GITIGNORE: &str = "registry.json\nregistry.lock\nsessions/\n";

pub fn run(repo_root: &Path) -> Result<()> {
    let latch_dir = repo_root.join(LATCH_DIR);
    let config = Config::load(&latch_dir);
    RegistryStore::open(&latch_dir, config.registry_timeout()).ensure()?;
    Config::write_default(&latch_dir)?;

    let gitignore = latch_dir.join(".gitignore");
    if !gitignore.exists() {
        fs::write(&gitignore, GITIGNORE)?;
    }

    eprintln!("Initialized {LATCH_DIR}/ in {}", repo_root.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::repo::Repo;
    use tempfile::tempdir;

    #[test]
    fn init_is_idempotent() {
        let dir = tempdir().unwrap();
        run(dir.path()).unwrap();
        fs::write(
            dir.path().join(LATCH_DIR).join("config.yaml"),
            "lease_ttl_secs: 60\n",
        )
        .unwrap();
        run(dir.path()).unwrap();

        let latch_dir = dir.path().join(LATCH_DIR);
        assert!(latch_dir.join("registry.json").exists());
        assert!(latch_dir.join(".gitignore").exists());
        // Existing config is left alone
        assert_eq!(
            fs::read_to_string(latch_dir.join("config.yaml")).unwrap(),
            "lease_ttl_secs: 60\n"
        );
        assert!(Repo::open(dir.path()).is_ok());
    }
}
