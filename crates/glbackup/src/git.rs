//! Repository clone supervision: mirror or LFS-resolving clones into a scratch
//! directory, stderr classification, archiving, and the reverse path that
//! installs a restored archive as a bare repository.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::archive::{self, ArchiveOutcome};
use crate::error::{Error, Result};
use crate::logging::redact_credentials;
use crate::process::{self, ChildRegistry, CmdOutput};

// Patterns are literals; `None` only if the regex engine rejects them.
// Only git's own diagnostic prefixes count; progress lines echo paths and
// branch names that may contain the same words.
static ALARMING: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(remote:\s*)?(fatal|error):").ok());
static HTTP_403: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)(returned error: 403|403 forbidden|http 403)").ok());
static LOCK_DENIED: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\.lock\b.*permission denied").ok());

fn matches(re: &LazyLock<Option<Regex>>, line: &str) -> bool {
    re.as_ref().is_some_and(|r| r.is_match(line))
}

/// What a git command's stderr tells us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StderrClass {
    Clean,
    /// The repository has no commits; nothing to archive.
    EmptyRepository,
    /// Lock files we cannot touch; harmless for a read-only clone.
    PermissionNoise,
    Fatal(String),
}

pub fn classify_stderr(stderr: &str) -> StderrClass {
    if stderr.to_lowercase().contains("empty repository") {
        return StderrClass::EmptyRepository;
    }
    let mut saw_403 = false;
    let mut saw_lock = false;
    for line in stderr.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if matches(&HTTP_403, line) {
            saw_403 = true;
        } else if matches(&LOCK_DENIED, line) {
            saw_lock = true;
        } else if matches(&ALARMING, line) {
            return StderrClass::Fatal(line.to_string());
        }
    }
    if saw_403 {
        StderrClass::EmptyRepository
    } else if saw_lock {
        StderrClass::PermissionNoise
    } else {
        StderrClass::Clean
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneMode {
    Mirror,
    /// Regular clone, then LFS content fetched for every branch.
    Lfs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloneOutcome {
    Archived(PathBuf),
    Empty,
}

/// Inject `oauth2:<token>@` into an HTTP(S) clone URL, replacing any userinfo
/// already present.
pub fn authenticated_url(http_url: &str, token: &str) -> String {
    let Some(idx) = http_url.find("://") else {
        return http_url.to_string();
    };
    let (scheme, rest) = http_url.split_at(idx + 3);
    let host_end = rest.find('/').unwrap_or(rest.len());
    let rest = match rest[..host_end].rfind('@') {
        Some(at) => &rest[at + 1..],
        None => rest,
    };
    format!("{scheme}oauth2:{token}@{rest}")
}

pub struct Cloner<'a> {
    registry: &'a ChildRegistry,
    scratch_root: &'a Path,
    git_timeout: Duration,
    tar_timeout: Duration,
}

impl<'a> Cloner<'a> {
    pub fn new(
        registry: &'a ChildRegistry,
        scratch_root: &'a Path,
        git_timeout: Duration,
        tar_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            scratch_root,
            git_timeout,
            tar_timeout,
        }
    }

    /// Clone `url` and archive the result as `<dest_dir>/<name>.git.tgz`. The
    /// scratch directory is removed on every exit path.
    pub fn backup_repository(
        &self,
        project_id: u64,
        name: &str,
        url: &str,
        dest_dir: &Path,
        mode: CloneMode,
    ) -> Result<CloneOutcome> {
        let repo = redact_credentials(url);
        fs::create_dir_all(self.scratch_root).map_err(|e| Error::io(self.scratch_root, e))?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{project_id}_"))
            .tempdir_in(self.scratch_root)
            .map_err(|e| Error::io(self.scratch_root, e))?;
        let target = scratch.path().join(format!("{name}.git"));

        let mut cmd = Command::new("git");
        cmd.arg("clone");
        if mode == CloneMode::Mirror {
            cmd.arg("--mirror");
        }
        cmd.arg(url).arg(&target);
        let out = self.supervise(cmd, &repo)?;
        match classify_stderr(&out.stderr) {
            StderrClass::Fatal(msg) => return Err(clone_err(&repo, msg)),
            StderrClass::EmptyRepository => {
                info!(project_id, repository = %repo, "empty repository, nothing to archive");
                return Ok(CloneOutcome::Empty);
            }
            StderrClass::PermissionNoise => {
                warn!(project_id, repository = %repo, "ignoring lock file permission noise");
            }
            StderrClass::Clean if !out.success() => {
                return Err(clone_err(&repo, out.summary()));
            }
            StderrClass::Clean => {}
        }

        if mode == CloneMode::Lfs {
            self.resolve_lfs(&target, &repo)?;
        }

        match archive::archive_directory(self.registry, &target, dest_dir, "", self.tar_timeout)? {
            ArchiveOutcome::Archived(path) => Ok(CloneOutcome::Archived(path)),
            // git exited cleanly without creating the target.
            ArchiveOutcome::SourceAbsent => Err(clone_err(
                &repo,
                "clone produced no repository directory",
            )),
        }
    }

    fn resolve_lfs(&self, work: &Path, repo: &str) -> Result<()> {
        let default = self.git_in(work, &["rev-parse", "--abbrev-ref", "HEAD"], repo)?;
        let default = default.stdout.trim().to_string();
        let listing = self.git_in(work, &["branch", "-r"], repo)?;
        let branches = remote_branches(&listing.stdout, &default);
        debug!(repository = %repo, default = %default, count = branches.len(), "walking branches");

        for remote in &branches {
            let local = remote.strip_prefix("origin/").unwrap_or(remote);
            self.git_in(work, &["checkout", "-B", local, remote], repo)?;
            self.git_in(work, &["lfs", "fetch", "--all", "origin", local], repo)?;
        }
        self.git_in(work, &["checkout", &default], repo)?;
        self.git_in(work, &["lfs", "fetch", "--all", "origin", &default], repo)?;
        self.git_in(work, &["lfs", "checkout"], repo)?;
        self.git_in(work, &["remote", "remove", "origin"], repo)?;
        self.git_in(work, &["lfs", "uninstall", "--local"], repo)?;
        Ok(())
    }

    // Exit status decides success; stderr only sharpens the error message.
    fn git_in(&self, dir: &Path, args: &[&str], repo: &str) -> Result<CmdOutput> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(dir).args(args);
        let out = self.supervise(cmd, repo)?;
        if out.success() {
            return Ok(out);
        }
        let cause = match classify_stderr(&out.stderr) {
            StderrClass::Fatal(msg) => msg,
            _ => out.summary(),
        };
        Err(clone_err(
            repo,
            format!("git {} failed: {cause}", args.join(" ")),
        ))
    }

    fn supervise(&self, cmd: Command, repo: &str) -> Result<CmdOutput> {
        let label = process::describe(&cmd);
        let out = process::run(self.registry, cmd, self.git_timeout)
            .map_err(|e| clone_err(repo, format!("failed to run {label}: {e}")))?;
        if self.registry.cancelled() {
            return Err(Error::Cancelled);
        }
        if out.timed_out {
            return Err(clone_err(
                repo,
                format!("{label} timed out after {}s", self.git_timeout.as_secs()),
            ));
        }
        Ok(out)
    }
}

fn clone_err(repo: impl Into<String>, msg: impl Into<String>) -> Error {
    Error::clone_failed(repo, redact_credentials(&msg.into()))
}

/// Remote branches from `git branch -r`, minus the symbolic HEAD pointer and
/// the default branch.
fn remote_branches(listing: &str, default: &str) -> Vec<String> {
    let default_remote = format!("origin/{default}");
    listing
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.contains("->") && !l.ends_with("/HEAD"))
        .filter(|l| *l != default_remote)
        .map(str::to_string)
        .collect()
}

/// Unpack a repository archive and install it as a bare repository at `dest`.
/// An already-bare tree is moved into place; a working tree is converted with
/// `git clone --bare`. `hooks` becomes a symlink to `hooks_dir` when given.
pub fn install_bare(
    registry: &ChildRegistry,
    archive_path: &Path,
    dest: &Path,
    hooks_dir: Option<&Path>,
    timeout: Duration,
) -> Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| Error::config(format!("invalid repository path {}", dest.display())))?;
    fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    // Same filesystem as `dest`, so the final move is a rename.
    let scratch = tempfile::Builder::new()
        .prefix(".restore_")
        .tempdir_in(parent)
        .map_err(|e| Error::io(parent, e))?;
    let unpacked = scratch.path().join("tree");
    archive::extract(archive_path, &unpacked)?;

    if dest.exists() {
        warn!(repository = %dest.display(), "replacing existing repository");
        fs::remove_dir_all(dest).map_err(|e| Error::io(dest, e))?;
    }

    if is_bare(&unpacked) {
        fs::rename(&unpacked, dest).map_err(|e| Error::io(dest, e))?;
    } else {
        let mut cmd = Command::new("git");
        cmd.arg("clone").arg("--bare").arg(&unpacked).arg(dest);
        let label = process::describe(&cmd);
        let out = process::run(registry, cmd, timeout)
            .map_err(|e| clone_err(label.clone(), e.to_string()))?;
        if registry.cancelled() {
            return Err(Error::Cancelled);
        }
        if !out.success() {
            return Err(clone_err(label, out.summary()));
        }
    }

    if let Some(hooks) = hooks_dir {
        link_hooks(dest, hooks)?;
    }
    info!(repository = %dest.display(), "repository restored");
    Ok(())
}

fn is_bare(dir: &Path) -> bool {
    dir.join("HEAD").is_file() && dir.join("objects").is_dir() && !dir.join(".git").exists()
}

fn link_hooks(repo: &Path, hooks: &Path) -> Result<()> {
    let link = repo.join("hooks");
    match fs::symlink_metadata(&link) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(&link).map_err(|e| Error::io(&link, e))?,
        Ok(_) => fs::remove_file(&link).map_err(|e| Error::io(&link, e))?,
        Err(_) => {}
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(hooks, &link).map_err(|e| Error::io(&link, e))?;
    #[cfg(not(unix))]
    let _ = hooks;
    Ok(())
}
