use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{LatchError, Result};
use crate::identity::IdentityStore;
use crate::manager::LockManager;
use crate::store::registry::RegistryStore;

pub const LATCH_DIR: &str = ".latch";

/// Everything rooted at one `.latch/` directory.
pub struct Repo {
    pub root: PathBuf,
    pub config: Config,
    pub identities: IdentityStore,
    pub manager: LockManager,
}

impl Repo {
    /// Open an existing coordination root (the directory containing `.latch/`).
    pub fn open(root: &Path) -> Result<Self> {
        let latch_dir = root.join(LATCH_DIR);
        if !latch_dir.is_dir() {
            return Err(LatchError::NotInitialized);
        }
        let config = Config::load(&latch_dir);
        let store = RegistryStore::open(&latch_dir, config.registry_timeout());
        Ok(Self {
            root: root.to_path_buf(),
            identities: IdentityStore::open(&latch_dir),
            manager: LockManager::new(store, config.clone()),
            config,
        })
    }

    pub fn latch_dir(&self) -> PathBuf {
        self.root.join(LATCH_DIR)
    }
}

/// Locate the coordination root for `start`.
///
/// Resolution order:
/// 1) `$LATCH_ROOT`
/// 2) nearest ancestor of `start` containing `.latch/`
/// 3) the main worktree of the enclosing git repository, if it contains
///    `.latch/` (so linked worktrees share one registry)
pub fn find_coordination_root(start: &Path) -> Result<PathBuf> {
    if let Some(root) = std::env::var("LATCH_ROOT")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        let root = PathBuf::from(root);
        if root.join(LATCH_DIR).is_dir() {
            return Ok(root);
        }
        return Err(LatchError::RegistryUnavailable(format!(
            "LATCH_ROOT={} has no {LATCH_DIR}/ directory",
            root.display()
        )));
    }

    let mut dir = start.to_path_buf();
    loop {
        if dir.join(LATCH_DIR).is_dir() {
            return Ok(dir);
        }
        if !dir.pop() {
            break;
        }
    }

    if let Some(main) = crate::git::main_worktree_root(start)
        && main.join(LATCH_DIR).is_dir()
    {
        return Ok(main);
    }

    Err(LatchError::NotInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn finds_nearest_ancestor() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(LATCH_DIR)).unwrap();
        let nested = dir.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_coordination_root(&nested).unwrap(), dir.path());
    }

    #[test]
    fn uninitialized_tree_errors() {
        let dir = tempdir().unwrap();
        let err = find_coordination_root(dir.path()).unwrap_err();
        assert!(matches!(err, LatchError::NotInitialized));
    }

    #[test]
    fn linked_worktree_falls_back_to_main_worktree_registry() {
        let dir = tempdir().unwrap();
        let main = dir.path().join("main");
        fs::create_dir_all(&main).unwrap();
        let repo = git2::Repository::init(&main).unwrap();
        let sig = git2::Signature::now("t", "t@example.com").unwrap();
        let tree_id = repo.index().unwrap().write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
            .unwrap();
        fs::create_dir_all(main.join(LATCH_DIR)).unwrap();

        let linked = dir.path().join("linked");
        repo.worktree("linked", &linked, None).unwrap();
        let nested = linked.join("src");
        fs::create_dir_all(&nested).unwrap();

        assert_eq!(
            find_coordination_root(&nested).unwrap(),
            main.canonicalize().unwrap()
        );
    }

    #[test]
    fn linked_worktree_with_own_latch_dir_wins() {
        let dir = tempdir().unwrap();
        let main = dir.path().join("main");
        fs::create_dir_all(&main).unwrap();
        let repo = git2::Repository::init(&main).unwrap();
        let sig = git2::Signature::now("t", "t@example.com").unwrap();
        let tree_id = repo.index().unwrap().write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
            .unwrap();
        fs::create_dir_all(main.join(LATCH_DIR)).unwrap();

        let linked = dir.path().join("linked");
        repo.worktree("linked", &linked, None).unwrap();
        fs::create_dir_all(linked.join(LATCH_DIR)).unwrap();

        assert_eq!(find_coordination_root(&linked).unwrap(), linked);
    }

    #[test]
    fn open_requires_latch_dir() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Repo::open(dir.path()),
            Err(LatchError::NotInitialized)
        ));
        fs::create_dir_all(dir.path().join(LATCH_DIR)).unwrap();
        let repo = Repo::open(dir.path()).unwrap();
        assert_eq!(repo.latch_dir(), dir.path().join(LATCH_DIR));
    }
}
