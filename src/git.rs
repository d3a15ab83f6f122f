use std::path::{Path, PathBuf};

use git2::Repository;

/// Current branch name for the repository containing `path`.
/// Returns None outside a git repository or on a detached HEAD.
pub fn current_branch(path: &Path) -> Option<String> {
    let repo = Repository::discover(path).ok()?;
    let head = repo.head().ok()?;
    if head.is_branch() {
        head.shorthand().map(String::from)
    } else {
        None
    }
}

/// Working directory of the main worktree for the repository containing
/// `path`. For a linked worktree this is the checkout that owns the shared
/// `.git` directory, which is where sibling worktrees meet.
pub fn main_worktree_root(path: &Path) -> Option<PathBuf> {
    let repo = Repository::discover(path).ok()?;
    let common = repo.commondir();
    let common = common.canonicalize().unwrap_or_else(|_| common.to_path_buf());
    if common.file_name().is_some_and(|n| n == ".git") {
        common.parent().map(Path::to_path_buf)
    } else {
        // Bare repository: no checkout to host coordination state.
        None
    }
}
