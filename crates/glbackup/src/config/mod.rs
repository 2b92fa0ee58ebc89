use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

const DEFAULT_WORKERS: usize = 4;
const DEFAULT_PER_PAGE: u32 = 100;
const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_GIT_TIMEOUT_SECS: u64 = 500;
const DEFAULT_TAR_TIMEOUT_SECS: u64 = 500;
const DEFAULT_API_TIMEOUT_SECS: u64 = 15;
const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;

fn default_cache_clear_cmd() -> Vec<String> {
    vec!["gitlab-rake".into(), "cache:clear".into()]
}

/// On-disk configuration. Every field is optional so a file only needs to
/// carry what differs from the defaults; CLI flags win over the file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub gitlab: GitlabSection,
    pub paths: PathsSection,
    pub limits: LimitsSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GitlabSection {
    pub server: Option<String>,
    pub token: Option<String>,
    pub clone_token: Option<String>,
    pub cache_clear_cmd: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub backup_dir: Option<PathBuf>,
    pub repository_dir: Option<PathBuf>,
    pub upload_dir: Option<PathBuf>,
    pub tmp_dir: Option<PathBuf>,
    pub hooks_dir: Option<PathBuf>,
    pub error_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub workers: Option<usize>,
    pub per_page: Option<u32>,
    pub retries: Option<u32>,
    pub git_timeout_secs: Option<u64>,
    pub tar_timeout_secs: Option<u64>,
    pub api_timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
        Self::parse(&raw)
            .map_err(|e| Error::config(format!("failed to parse {}: {e}", path.display())))
    }

    pub fn parse(raw: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

/// Values supplied on the command line. `None` leaves the file/default value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub server: Option<String>,
    pub token: Option<String>,
    pub backup_dir: Option<PathBuf>,
    pub repository_dir: Option<PathBuf>,
    pub upload_dir: Option<PathBuf>,
    pub tmp_dir: Option<PathBuf>,
    pub error_log: Option<PathBuf>,
    pub workers: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: String,
    pub token: String,
    pub clone_token: Option<String>,
    pub backup_dir: PathBuf,
    pub repository_dir: Option<PathBuf>,
    pub upload_dir: Option<PathBuf>,
    pub tmp_dir: PathBuf,
    pub hooks_dir: Option<PathBuf>,
    pub cache_clear_cmd: Vec<String>,
    pub error_log: Option<PathBuf>,
    pub workers: usize,
    pub per_page: u32,
    pub retries: u32,
    pub git_timeout: Duration,
    pub tar_timeout: Duration,
    pub api_timeout: Duration,
    pub poll_interval: Duration,
}

impl Config {
    pub fn resolve(file: FileConfig, cli: Overrides) -> Result<Self> {
        let server = first_non_empty([cli.server, file.gitlab.server]).ok_or_else(|| {
            Error::config("no server given (use --server, GITLAB_SERVER or [gitlab].server)")
        })?;
        let token = first_non_empty([cli.token, file.gitlab.token]).ok_or_else(|| {
            Error::config("no token given (use --token, GITLAB_TOKEN or [gitlab].token)")
        })?;
        let clone_token = first_non_empty([
            std::env::var("GITLAB_CLONE_TOKEN").ok(),
            file.gitlab.clone_token,
        ]);

        let workers = match cli.workers.or(file.limits.workers).unwrap_or(DEFAULT_WORKERS) {
            0 => num_cpus::get().max(1),
            n => n,
        };
        let retries = file.limits.retries.unwrap_or(DEFAULT_RETRIES);
        if retries == 0 {
            return Err(Error::config("[limits].retries must be at least 1"));
        }
        let per_page = file.limits.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, 100);

        Ok(Self {
            server,
            token,
            clone_token,
            backup_dir: cli
                .backup_dir
                .or(file.paths.backup_dir)
                .unwrap_or_else(|| PathBuf::from(".")),
            repository_dir: cli.repository_dir.or(file.paths.repository_dir),
            upload_dir: cli.upload_dir.or(file.paths.upload_dir),
            tmp_dir: cli
                .tmp_dir
                .or(file.paths.tmp_dir)
                .unwrap_or_else(std::env::temp_dir),
            hooks_dir: file.paths.hooks_dir,
            cache_clear_cmd: file
                .gitlab
                .cache_clear_cmd
                .unwrap_or_else(default_cache_clear_cmd),
            error_log: cli.error_log.or(file.paths.error_log),
            workers,
            per_page,
            retries,
            git_timeout: Duration::from_secs(
                file.limits.git_timeout_secs.unwrap_or(DEFAULT_GIT_TIMEOUT_SECS),
            ),
            tar_timeout: Duration::from_secs(
                file.limits.tar_timeout_secs.unwrap_or(DEFAULT_TAR_TIMEOUT_SECS),
            ),
            api_timeout: Duration::from_secs(
                file.limits.api_timeout_secs.unwrap_or(DEFAULT_API_TIMEOUT_SECS),
            ),
            poll_interval: Duration::from_millis(
                file.limits.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
        })
    }

    /// Minimal config for a server/token pair; everything else defaulted.
    pub fn new(server: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let cli = Overrides {
            server: Some(server.into()),
            token: Some(token.into()),
            ..Overrides::default()
        };
        Self::resolve(FileConfig::default(), cli)
    }

    // `gitlab.example.com` -> https; a value with a scheme is kept as-is.
    pub fn api_base(&self) -> String {
        let server = self.server.trim().trim_end_matches('/');
        if server.contains("://") {
            format!("{server}/api/v4")
        } else {
            format!("https://{server}/api/v4")
        }
    }

    pub fn clone_token(&self) -> &str {
        self.clone_token.as_deref().unwrap_or(&self.token)
    }
}

fn first_non_empty<const N: usize>(candidates: [Option<String>; N]) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_server_is_a_config_error() {
        let cli = Overrides {
            token: Some("abc".into()),
            ..Overrides::default()
        };
        let err = Config::resolve(FileConfig::default(), cli).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn cli_wins_over_file() {
        let file = FileConfig::parse(
            r#"
[gitlab]
server = "file.example.com"
token = "from-file"

[paths]
backup_dir = "/srv/backups"

[limits]
workers = 2
git_timeout_secs = 10
"#,
        )
        .expect("parse");
        let cli = Overrides {
            server: Some("cli.example.com".into()),
            workers: Some(8),
            ..Overrides::default()
        };
        let cfg = Config::resolve(file, cli).expect("resolve");
        assert_eq!(cfg.server, "cli.example.com");
        assert_eq!(cfg.token, "from-file");
        assert_eq!(cfg.workers, 8);
        assert_eq!(cfg.backup_dir, PathBuf::from("/srv/backups"));
        assert_eq!(cfg.git_timeout, Duration::from_secs(10));
        assert_eq!(cfg.retries, 3);
    }

    #[test]
    fn zero_workers_means_cpu_count() {
        let cli = Overrides {
            server: Some("s".into()),
            token: Some("t".into()),
            workers: Some(0),
            ..Overrides::default()
        };
        let cfg = Config::resolve(FileConfig::default(), cli).expect("resolve");
        assert!(cfg.workers >= 1);
    }

    #[test]
    fn api_base_respects_explicit_scheme() {
        assert_eq!(
            Config::new("gitlab.example.com", "abc").expect("cfg").api_base(),
            "https://gitlab.example.com/api/v4"
        );
        assert_eq!(
            Config::new("http://127.0.0.1:8080/", "abc")
                .expect("cfg")
                .api_base(),
            "http://127.0.0.1:8080/api/v4"
        );
    }
}
