//! Sandbox gateway -- per-task isolated working copies over git worktrees.
//!
//! Each in-progress task runs in a worktree rooted at
//! `<project.working_dir>/.worktrees/<agent_id>/<task_id>`, tracked on a
//! dedicated branch embedding both identifiers. Worktrees share the main
//! repository's object store but have independent working directories.
//!
//! Subtasks share the parent task's working copy: they edit the same
//! logical change-set, and the status machine guarantees the parent's cycle
//! has finished writing (the parent reaches `in_review`) before any subtask
//! becomes claimable.
//!
//! Git holds a lock file on the shared object store, so mutating worktree
//! operations are serialised through an internal mutex.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CoreError;

/// Errors from sandbox operations.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The project working directory is not a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// A git command could not be executed at all.
    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// A path escaped the sandbox root.
    #[error("path {0:?} escapes the sandbox")]
    PathEscape(String),

    /// Filesystem I/O inside the sandbox failed.
    #[error("sandbox io error on {path:?}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<SandboxError> for CoreError {
    fn from(err: SandboxError) -> Self {
        CoreError::ProviderError(format!("sandbox: {err}"))
    }
}

/// An acquired working copy, exclusively owned by the agent holding the
/// task until released.
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub task_id: Uuid,
    pub agent_id: Uuid,
    pub path: PathBuf,
    pub branch: String,
}

/// Manages sandbox worktrees for one project.
#[derive(Debug)]
pub struct SandboxManager {
    /// Path to the project's main working copy.
    repo_path: PathBuf,
    /// Serialises git operations to avoid lock-file contention.
    git_lock: Arc<Mutex<()>>,
}

impl Clone for SandboxManager {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl SandboxManager {
    /// Create a manager for the repository at `repo_path`.
    ///
    /// Fails with [`SandboxError::NotAGitRepo`] when the path is not inside
    /// a git repository.
    pub fn new(repo_path: impl Into<PathBuf>) -> Result<Self, SandboxError> {
        let repo_path = repo_path.into();

        let output = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&repo_path)
            .output()
            .map_err(|e| SandboxError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(SandboxError::NotAGitRepo(repo_path));
        }

        Ok(Self {
            repo_path,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    /// The branch name for a given (agent, task) pair.
    pub fn branch_name(agent_id: Uuid, task_id: Uuid) -> String {
        format!("hollon/{}/{}", short_id(agent_id), short_id(task_id))
    }

    /// Materialize the working copy for a task, creating the worktree and
    /// branch if needed. Idempotent: acquiring an existing sandbox returns
    /// it unchanged.
    pub fn acquire(&self, agent_id: Uuid, task_id: Uuid) -> Result<Sandbox, SandboxError> {
        let path = self
            .repo_path
            .join(".worktrees")
            .join(agent_id.to_string())
            .join(task_id.to_string());
        let branch = Self::branch_name(agent_id, task_id);

        if path.join(".git").exists() {
            debug!(path = %path.display(), "reusing existing sandbox");
            return Ok(Sandbox {
                task_id,
                agent_id,
                path,
                branch,
            });
        }

        let _guard = self.git_lock.lock().unwrap();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SandboxError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }

        // -B: reuse the branch if a previous attempt left it behind.
        self.run_git(
            &self.repo_path,
            &[
                "worktree",
                "add",
                "-B",
                &branch,
                path.to_str().unwrap_or_default(),
            ],
        )?;

        Ok(Sandbox {
            task_id,
            agent_id,
            path,
            branch,
        })
    }

    /// Open the sandbox of another (agent, task) pair without creating it.
    /// Used by subtask cycles to join the parent task's working copy.
    pub fn open_existing(&self, agent_id: Uuid, task_id: Uuid) -> Option<Sandbox> {
        let path = self
            .repo_path
            .join(".worktrees")
            .join(agent_id.to_string())
            .join(task_id.to_string());
        path.join(".git").exists().then(|| Sandbox {
            task_id,
            agent_id,
            path,
            branch: Self::branch_name(agent_id, task_id),
        })
    }

    /// Write a file inside the sandbox, creating parent directories.
    pub fn write(&self, sandbox: &Sandbox, file: &str, bytes: &[u8]) -> Result<(), SandboxError> {
        let target = self.resolve(sandbox, file)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SandboxError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(&target, bytes).map_err(|e| SandboxError::Io {
            path: file.to_string(),
            source: e,
        })
    }

    /// Read a file from the sandbox.
    pub fn read(&self, sandbox: &Sandbox, file: &str) -> Result<Vec<u8>, SandboxError> {
        let target = self.resolve(sandbox, file)?;
        std::fs::read(&target).map_err(|e| SandboxError::Io {
            path: file.to_string(),
            source: e,
        })
    }

    /// Paths changed in the sandbox relative to HEAD (`git status`
    /// porcelain, staged and unstaged).
    pub fn list_changes(&self, sandbox: &Sandbox) -> Result<Vec<String>, SandboxError> {
        let output = self.run_git(&sandbox.path, &["status", "--porcelain"])?;
        Ok(output
            .lines()
            .filter_map(|line| line.get(3..))
            .map(str::to_string)
            .collect())
    }

    /// Stage everything and commit. Returns the commit id, or `None` when
    /// the working copy is clean.
    pub fn stage_and_commit(
        &self,
        sandbox: &Sandbox,
        message: &str,
        author: &str,
    ) -> Result<Option<String>, SandboxError> {
        let _guard = self.git_lock.lock().unwrap();

        self.run_git(&sandbox.path, &["add", "-A"])?;

        let status = self.run_git(&sandbox.path, &["status", "--porcelain"])?;
        if status.trim().is_empty() {
            return Ok(None);
        }

        let author_line = format!("{author} <{author}@hollon.local>");
        self.run_git(
            &sandbox.path,
            &[
                "-c",
                "user.email=agents@hollon.local",
                "-c",
                "user.name=hollon",
                "commit",
                "-m",
                message,
                "--author",
                &author_line,
            ],
        )?;

        let head = self.run_git(&sandbox.path, &["rev-parse", "HEAD"])?;
        Ok(Some(head.trim().to_string()))
    }

    /// Remove the working copy. On failure paths the sandbox is preserved
    /// for diagnostics instead.
    pub fn release(&self, sandbox: &Sandbox, keep_for_diagnostics: bool) {
        if keep_for_diagnostics {
            debug!(path = %sandbox.path.display(), "preserving sandbox for diagnostics");
            return;
        }

        let _guard = self.git_lock.lock().unwrap();
        if let Err(e) = self.run_git(
            &self.repo_path,
            &[
                "worktree",
                "remove",
                "--force",
                sandbox.path.to_str().unwrap_or_default(),
            ],
        ) {
            warn!(path = %sandbox.path.display(), error = %e, "failed to remove sandbox worktree");
        }
    }

    /// Resolve a relative file path inside the sandbox, rejecting absolute
    /// paths and `..` traversal.
    fn resolve(&self, sandbox: &Sandbox, file: &str) -> Result<PathBuf, SandboxError> {
        let rel = Path::new(file);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(SandboxError::PathEscape(file.to_string()));
        }
        Ok(sandbox.path.join(rel))
    }

    fn run_git(&self, cwd: &Path, args: &[&str]) -> Result<String, SandboxError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .map_err(|e| SandboxError::GitCommand {
                message: format!("failed to run git {}", args.join(" ")),
                source: e,
            })?;

        if !output.status.success() {
            return Err(SandboxError::GitExit {
                command: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}
