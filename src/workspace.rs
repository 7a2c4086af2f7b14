//! Workspace Manager (C4): isolated per-task working copies anchored to
//! a base repository, branched `engine/<run_id>/<task_id>` (spec §4.4).
//!
//! Grounded on `tracker/git.rs`'s `Repository::open` + `git2::Signature`
//! + `diff_tree_to_workdir_with_index`/`git2::Patch::from_diff` idiom
//! for commit/diff extraction; the worktree-per-branch mechanics and
//! the archive-on-failure retention policy are new code generalizing
//! that single-repo tracker into a multi-workspace manager, since the
//! teacher never isolates more than one working copy at a time.

use crate::errors::WorkspaceError;
use git2::{Repository, Signature, WorktreeAddOptions};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceOutcome {
    Success,
    Failure,
}

pub struct WorkspaceHandle {
    pub branch: String,
    pub worktree_path: PathBuf,
}

/// Tracks in-use branches and performs worktree add/remove against a
/// single base repository. One `WorkspaceManager` per Orchestrator
/// instance.
pub struct WorkspaceManager {
    base_repo_path: PathBuf,
    workspace_root: PathBuf,
    retention_cap: usize,
    active_branches: Mutex<HashSet<String>>,
}

impl WorkspaceManager {
    pub fn new(base_repo_path: PathBuf, workspace_root: PathBuf, retention_cap: usize) -> Self {
        Self {
            base_repo_path,
            workspace_root,
            retention_cap,
            active_branches: Mutex::new(HashSet::new()),
        }
    }

    fn branch_name(run_id: &str, task_id: &str) -> String {
        format!("engine/{run_id}/{task_id}")
    }

    /// Acquire an isolated worktree on a deterministic branch, checked
    /// out from `base_ref`. Synchronous and may block on I/O; the
    /// Executor must await this before spawning any tool (spec §4.4,
    /// §5).
    pub fn acquire(
        &self,
        run_id: &str,
        task_id: &str,
        base_ref: &str,
    ) -> Result<WorkspaceHandle, WorkspaceError> {
        let branch = Self::branch_name(run_id, task_id);

        {
            let mut active = self.active_branches.lock().unwrap();
            if active.contains(&branch) {
                return Err(WorkspaceError::Busy { branch });
            }
            active.insert(branch.clone());
        }

        match self.create_worktree(&branch, base_ref) {
            Ok(path) => Ok(WorkspaceHandle {
                branch,
                worktree_path: path,
            }),
            Err(e) => {
                self.active_branches.lock().unwrap().remove(&branch);
                Err(e)
            }
        }
    }

    fn create_worktree(&self, branch: &str, base_ref: &str) -> Result<PathBuf, WorkspaceError> {
        let repo = Repository::open(&self.base_repo_path)?;
        let base_commit = repo
            .revparse_single(base_ref)
            .map_err(WorkspaceError::Git)?
            .peel_to_commit()
            .map_err(WorkspaceError::Git)?;

        let branch_ref_name = branch.replace('/', "-");
        if repo.find_branch(branch, git2::BranchType::Local).is_err() {
            repo.branch(branch, &base_commit, false)?;
        }

        let worktree_dir = self.workspace_root.join(&branch_ref_name);
        std::fs::create_dir_all(&self.workspace_root).map_err(|e| anyhow::anyhow!(e))?;

        let mut opts = WorktreeAddOptions::new();
        let reference = repo.find_reference(&format!("refs/heads/{branch}"))?;
        opts.reference(Some(&reference));

        repo.worktree(&branch_ref_name, &worktree_dir, Some(&opts))?;

        Ok(worktree_dir)
    }

    /// Release a workspace. Success destroys the worktree; failure
    /// archives it under `archive/` for inspection, bounded by
    /// `retention_cap` (oldest archives evicted first) (spec §4.4).
    pub fn release(
        &self,
        handle: WorkspaceHandle,
        outcome: WorkspaceOutcome,
    ) -> Result<(), WorkspaceError> {
        self.active_branches.lock().unwrap().remove(&handle.branch);

        let repo = Repository::open(&self.base_repo_path)?;
        let branch_ref_name = handle.branch.replace('/', "-");

        match outcome {
            WorkspaceOutcome::Success => {
                if let Ok(mut wt) = repo.find_worktree(&branch_ref_name) {
                    let mut prune_opts = git2::WorktreePruneOptions::new();
                    prune_opts.working_tree(true);
                    let _ = wt.prune(Some(&mut prune_opts));
                }
                if handle.worktree_path.exists() {
                    std::fs::remove_dir_all(&handle.worktree_path)
                        .map_err(|e| anyhow::anyhow!(e))?;
                }
            }
            WorkspaceOutcome::Failure => {
                self.archive(&handle)?;
            }
        }
        Ok(())
    }

    fn archive(&self, handle: &WorkspaceHandle) -> Result<(), WorkspaceError> {
        let archive_root = self.workspace_root.join("archive");
        std::fs::create_dir_all(&archive_root).map_err(|e| anyhow::anyhow!(e))?;

        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.fZ");
        let dest = archive_root.join(format!(
            "{}-{stamp}",
            handle.branch.replace('/', "-")
        ));

        if handle.worktree_path.exists() {
            std::fs::rename(&handle.worktree_path, &dest).map_err(|e| anyhow::anyhow!(e))?;
        }

        self.enforce_retention(&archive_root)?;
        Ok(())
    }

    fn enforce_retention(&self, archive_root: &Path) -> Result<(), WorkspaceError> {
        let mut entries: Vec<(std::time::SystemTime, PathBuf)> = std::fs::read_dir(archive_root)
            .map_err(|e| anyhow::anyhow!(e))?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let meta = e.metadata().ok()?;
                let modified = meta.modified().ok()?;
                Some((modified, e.path()))
            })
            .collect();

        if entries.len() <= self.retention_cap {
            return Ok(());
        }

        entries.sort_by_key(|(modified, _)| *modified);
        let overflow = entries.len() - self.retention_cap;
        for (_, path) in entries.into_iter().take(overflow) {
            if path.is_dir() {
                let _ = std::fs::remove_dir_all(&path);
            } else {
                let _ = std::fs::remove_file(&path);
            }
        }
        Ok(())
    }

    pub fn is_branch_active(&self, run_id: &str, task_id: &str) -> bool {
        self.active_branches
            .lock()
            .unwrap()
            .contains(&Self::branch_name(run_id, task_id))
    }
}

/// Creates an initial commit in a fresh repository, matching
/// `tracker/git.rs::snapshot_before`'s unborn-branch handling — used by
/// tests to seed a base repository before acquiring a workspace against
/// it.
pub fn init_base_repo(path: &Path) -> Result<(), WorkspaceError> {
    let repo = Repository::init(path)?;
    let mut index = repo.index()?;
    index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
    index.write()?;
    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let sig = Signature::now("minipipe", "minipipe@localhost")?;
    repo.commit(Some("HEAD"), &sig, &sig, "initial commit", &tree, &[])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup_base_repo() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "hello").unwrap();
        init_base_repo(dir.path()).unwrap();
        dir
    }

    #[test]
    fn acquire_creates_deterministic_branch_name() {
        let base = setup_base_repo();
        let workspace_root = tempdir().unwrap();
        let mgr = WorkspaceManager::new(
            base.path().to_path_buf(),
            workspace_root.path().to_path_buf(),
            5,
        );

        let handle = mgr.acquire("run-1", "T1", "HEAD").unwrap();
        assert_eq!(handle.branch, "engine/run-1/T1");
        assert!(handle.worktree_path.exists());
    }

    #[test]
    fn acquiring_same_branch_twice_fails_busy() {
        let base = setup_base_repo();
        let workspace_root = tempdir().unwrap();
        let mgr = WorkspaceManager::new(
            base.path().to_path_buf(),
            workspace_root.path().to_path_buf(),
            5,
        );

        let _handle = mgr.acquire("run-1", "T1", "HEAD").unwrap();
        let err = mgr.acquire("run-1", "T1", "HEAD").unwrap_err();
        assert!(matches!(err, WorkspaceError::Busy { .. }));
    }

    #[test]
    fn release_success_destroys_worktree() {
        let base = setup_base_repo();
        let workspace_root = tempdir().unwrap();
        let mgr = WorkspaceManager::new(
            base.path().to_path_buf(),
            workspace_root.path().to_path_buf(),
            5,
        );

        let handle = mgr.acquire("run-1", "T1", "HEAD").unwrap();
        let path = handle.worktree_path.clone();
        mgr.release(handle, WorkspaceOutcome::Success).unwrap();
        assert!(!path.exists());
        assert!(!mgr.is_branch_active("run-1", "T1"));
    }

    #[test]
    fn release_failure_archives_worktree() {
        let base = setup_base_repo();
        let workspace_root = tempdir().unwrap();
        let mgr = WorkspaceManager::new(
            base.path().to_path_buf(),
            workspace_root.path().to_path_buf(),
            5,
        );

        let handle = mgr.acquire("run-1", "T1", "HEAD").unwrap();
        mgr.release(handle, WorkspaceOutcome::Failure).unwrap();

        let archive_root = workspace_root.path().join("archive");
        let archived: Vec<_> = std::fs::read_dir(&archive_root).unwrap().collect();
        assert_eq!(archived.len(), 1);
    }

    #[test]
    fn retention_cap_evicts_oldest_archives() {
        let base = setup_base_repo();
        let workspace_root = tempdir().unwrap();
        let mgr = WorkspaceManager::new(
            base.path().to_path_buf(),
            workspace_root.path().to_path_buf(),
            2,
        );

        for i in 0..4 {
            let handle = mgr.acquire("run-1", &format!("T{i}"), "HEAD").unwrap();
            mgr.release(handle, WorkspaceOutcome::Failure).unwrap();
        }

        let archive_root = workspace_root.path().join("archive");
        let archived: Vec<_> = std::fs::read_dir(&archive_root).unwrap().collect();
        assert!(archived.len() <= 2);
    }
}
