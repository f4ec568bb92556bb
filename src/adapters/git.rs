//! VCS adapter backed by git2: snapshots and commits are plain commits of
//! the full worktree, handling the unborn-branch case for fresh repos.

use std::path::Path;

use async_trait::async_trait;
use git2::{IndexAddOption, Repository, Signature};

use smithers_common::{AdapterError, VcsAdapter, VcsChange};

pub struct GitVcs {
    repo: Repository,
}

impl std::fmt::Debug for GitVcs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitVcs").finish_non_exhaustive()
    }
}

impl GitVcs {
    pub fn open(workdir: &Path) -> Result<Self, AdapterError> {
        let repo =
            Repository::open(workdir).map_err(|e| AdapterError::Vcs(e.message().to_string()))?;
        Ok(Self { repo })
    }

    /// Stage everything and commit. Returns the new commit id.
    fn commit_all(&self, message: &str) -> Result<VcsChange, AdapterError> {
        let map = |e: git2::Error| AdapterError::Vcs(e.message().to_string());

        let mut index = self.repo.index().map_err(map)?;
        index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
            .map_err(map)?;
        index.write().map_err(map)?;

        let tree_id = index.write_tree().map_err(map)?;
        let tree = self.repo.find_tree(tree_id).map_err(map)?;
        let sig = Signature::now("smithers", "smithers@localhost").map_err(map)?;

        // Unborn branch: the first snapshot becomes the initial commit.
        let parent = self
            .repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok());
        let commit_id = match &parent {
            Some(parent) => self
                .repo
                .commit(Some("HEAD"), &sig, &sig, message, &tree, &[parent])
                .map_err(map)?,
            None => self
                .repo
                .commit(Some("HEAD"), &sig, &sig, message, &tree, &[])
                .map_err(map)?,
        };

        let hash = commit_id.to_string();
        Ok(VcsChange {
            commit_hash: Some(hash.clone()),
            change_id: hash,
        })
    }
}

#[async_trait(?Send)]
impl VcsAdapter for GitVcs {
    async fn snapshot(&self, description: &str) -> Result<VcsChange, AdapterError> {
        self.commit_all(&format!("[smithers] snapshot: {}", description))
    }

    async fn commit(&self, message: &str) -> Result<VcsChange, AdapterError> {
        self.commit_all(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init_repo() -> (TempDir, GitVcs) {
        let dir = TempDir::new().unwrap();
        Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        let vcs = GitVcs::open(dir.path()).unwrap();
        (dir, vcs)
    }

    fn block_on<F: Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }

    #[test]
    fn snapshot_creates_initial_commit_on_unborn_branch() {
        let (_dir, vcs) = init_repo();
        let change = block_on(vcs.snapshot("before step build")).unwrap();
        assert_eq!(change.commit_hash.as_deref(), Some(change.change_id.as_str()));
        assert_eq!(change.change_id.len(), 40);
    }

    #[test]
    fn successive_commits_chain() {
        let (dir, vcs) = init_repo();
        let first = block_on(vcs.snapshot("first")).unwrap();
        std::fs::write(dir.path().join("b.txt"), "two").unwrap();
        let second = block_on(vcs.commit("feat: add b")).unwrap();
        assert_ne!(first.change_id, second.change_id);
    }

    #[test]
    fn open_fails_outside_a_repository() {
        let dir = TempDir::new().unwrap();
        let err = GitVcs::open(dir.path()).unwrap_err();
        assert!(matches!(err, AdapterError::Vcs(_)));
    }
}
