//! Git worktree management for task isolation, plus git-state capture for
//! checkpoints.
//!
//! Tasks that request worktree isolation run in their own git worktree:
//! independent working directory and index, shared object store. Git does
//! not support concurrent worktree mutation on one repository, so mutating
//! operations are serialised through an internal mutex.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use tracing::debug;

use foreman_db::models::{GitState, Task};
use foreman_db::{Error, Result};

/// Information about a worktree created for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    /// Absolute path to the worktree directory.
    pub path: PathBuf,
    /// Branch checked out in the worktree.
    pub branch: String,
}

/// Manages per-task git worktrees under a base directory.
#[derive(Debug)]
pub struct WorktreeManager {
    base_dir: PathBuf,
    git_lock: Mutex<()>,
}

impl WorktreeManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            git_lock: Mutex::new(()),
        }
    }

    /// Branch name for a task's worktree.
    pub fn branch_name(task: &Task) -> String {
        let short: String = task.id.chars().take(8).collect();
        format!("foreman/task-{short}")
    }

    /// Create a worktree for the task off `repo_dir`.
    ///
    /// The branch is created from the task's configured base branch when
    /// set, otherwise from the repository's current HEAD.
    pub fn create_worktree(&self, task: &Task, repo_dir: &Path) -> Result<WorktreeInfo> {
        if !repo_dir.join(".git").exists() {
            return Err(Error::invalid_operation(format!(
                "not a git repository: {}",
                repo_dir.display()
            )));
        }

        let branch = Self::branch_name(task);
        let path = self.base_dir.join(format!("task-{}", task.id));
        std::fs::create_dir_all(&self.base_dir).map_err(|e| {
            Error::system(format!(
                "failed to create worktree base dir {}: {e}",
                self.base_dir.display()
            ))
        })?;

        let _guard = self.git_lock.lock().expect("git lock poisoned");
        let mut args = vec![
            "worktree".to_string(),
            "add".to_string(),
            "-b".to_string(),
            branch.clone(),
            path.display().to_string(),
        ];
        if let Some(base) = task.worktree.as_ref().and_then(|w| w.base_branch.clone()) {
            args.push(base);
        }
        run_git(repo_dir, &args.iter().map(String::as_str).collect::<Vec<_>>())?;

        debug!(task_id = %task.id, path = %path.display(), branch = %branch, "worktree created");
        Ok(WorktreeInfo { path, branch })
    }

    /// Commit all work in the task's worktree so the branch survives
    /// cleanup. Returns whether a commit was created.
    pub fn complete_task(&self, task: &Task, worktree_path: &Path) -> Result<bool> {
        let _guard = self.git_lock.lock().expect("git lock poisoned");

        // Worktrees do not always inherit an identity.
        let _ = run_git(worktree_path, &["config", "user.email", "foreman@localhost"]);
        let _ = run_git(worktree_path, &["config", "user.name", "foreman"]);

        run_git(worktree_path, &["add", "-A"])?;
        let status = run_git(worktree_path, &["status", "--porcelain"])?;
        if status.trim().is_empty() {
            return Ok(false);
        }

        let short: String = task.id.chars().take(8).collect();
        let message = format!("foreman: task {short}");
        run_git(worktree_path, &["commit", "-m", &message])?;
        Ok(true)
    }

    /// Remove a worktree directory and prune its registration.
    pub fn remove_worktree(&self, repo_dir: &Path, worktree_path: &Path) -> Result<()> {
        let _guard = self.git_lock.lock().expect("git lock poisoned");
        run_git(
            repo_dir,
            &[
                "worktree",
                "remove",
                "--force",
                &worktree_path.display().to_string(),
            ],
        )?;
        Ok(())
    }
}

/// Capture the git state of a working directory: current branch, HEAD
/// commit, and dirty files.
pub fn git_state(dir: &Path) -> Result<GitState> {
    let branch = run_git(dir, &["rev-parse", "--abbrev-ref", "HEAD"])?
        .trim()
        .to_string();
    let commit = run_git(dir, &["rev-parse", "HEAD"])?.trim().to_string();
    let dirty_files = run_git(dir, &["status", "--porcelain"])?
        .lines()
        .filter_map(|line| line.get(3..).map(str::to_string))
        .collect();

    Ok(GitState {
        branch,
        commit,
        dirty_files,
    })
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| Error::system(format!("failed to run git {}: {e}", args.join(" "))))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::system(format!(
            "git {} failed (exit {}): {}",
            args.join(" "),
            output.status.code().unwrap_or(-1),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
