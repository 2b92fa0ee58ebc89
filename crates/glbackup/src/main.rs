use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::{error, info};

use glbackup::api::{Component, HttpClient};
use glbackup::backup::{self, BackupOptions, Selection};
use glbackup::config::{Config, FileConfig, Overrides};
use glbackup::context::Context;
use glbackup::engine::{self, Report};
use glbackup::git::CloneMode;
use glbackup::jobs::{self, ExpiryOptions};
use glbackup::logging::{self, Verbosity};
use glbackup::process::ChildRegistry;
use glbackup::restore::{self, RestoreOptions};
use glbackup::{Error, Result};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, ClapArgs)]
struct GlobalArgs {
    /// TOML config file ([gitlab], [paths], [limits])
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// GitLab server name, or a full URL
    #[arg(short, long, env = "GITLAB_SERVER", global = true)]
    server: Option<String>,
    /// Private API token
    #[arg(short, long, env = "GITLAB_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,
    /// Number of workers (0 = use CPU count)
    #[arg(short = 'n', long, global = true)]
    workers: Option<usize>,
    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Print debug messages
    #[arg(short, long, global = true)]
    debug: bool,
    /// Append terminal failures to this file
    #[arg(long, global = true)]
    error_log: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Back up all projects, one project, or everything a user is involved in
    Backup {
        /// Output directory
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Local repository root (wikis, and repositories with --no-clone)
        #[arg(short, long)]
        repository: Option<PathBuf>,
        /// Local upload root
        #[arg(short, long)]
        upload: Option<PathBuf>,
        /// Scratch directory for clones
        #[arg(long)]
        tmp_dir: Option<PathBuf>,
        /// Only this project (id or namespace/name)
        #[arg(long, conflicts_with = "user")]
        project: Option<String>,
        /// Only projects this user is involved in
        #[arg(long)]
        user: Option<String>,
        /// With --user: only projects in the user's own namespace
        #[arg(long, requires = "user")]
        personal: bool,
        /// Resolve large files on every branch before archiving
        #[arg(long, conflicts_with = "no_clone")]
        lfs: bool,
        /// Do not clone repositories
        #[arg(long)]
        no_clone: bool,
    },
    /// Restore a project backup directory into a project
    Restore {
        /// Project backup directory (contains project.json)
        #[arg(short, long)]
        backup_dir: PathBuf,
        /// Destination project id or namespace/name
        #[arg(short, long)]
        project: String,
        /// Restore only this component
        #[arg(short, long)]
        component: Option<Component>,
        /// Local repository root to restore repositories and wikis into
        #[arg(short, long)]
        repository: Option<PathBuf>,
        /// Fail instead of creating a missing destination project
        #[arg(long)]
        no_create: bool,
    },
    /// Erase CI jobs older than the retention window
    ExpireJobs {
        /// Only this project (id or namespace/name)
        #[arg(long)]
        project: Option<String>,
        /// Erase jobs older than this many days
        #[arg(short, long, default_value_t = 90)]
        max_days: u32,
        /// Only log what would be erased
        #[arg(short = 'D', long)]
        dry_run: bool,
    },
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let file = match &args.global.config {
        Some(path) => FileConfig::load(path),
        None => Ok(FileConfig::default()),
    };
    let error_log = args.global.error_log.clone().or_else(|| {
        file.as_ref()
            .ok()
            .and_then(|f| f.paths.error_log.clone())
    });
    let verbosity = Verbosity::from_flags(args.global.quiet, args.global.debug);
    if let Err(e) = logging::init(verbosity, error_log.as_deref()) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    let res = file.and_then(|file| run(args, file));
    match res {
        Ok(report) => {
            if !report.ok() {
                info!(failed = report.failed, "finished with failures, see the error log");
            }
            ExitCode::SUCCESS
        }
        Err(Error::Cancelled) => ExitCode::from(engine::INTERRUPTED_EXIT as u8),
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args, file: FileConfig) -> Result<Report> {
    let g = args.global;
    let mut overrides = Overrides {
        server: g.server,
        token: g.token,
        error_log: g.error_log,
        workers: g.workers,
        ..Overrides::default()
    };
    match &args.cmd {
        Command::Backup {
            output,
            repository,
            upload,
            tmp_dir,
            ..
        } => {
            overrides.backup_dir = output.clone();
            overrides.repository_dir = repository.clone();
            overrides.upload_dir = upload.clone();
            overrides.tmp_dir = tmp_dir.clone();
        }
        Command::Restore { repository, .. } => {
            overrides.repository_dir = repository.clone();
        }
        Command::ExpireJobs { .. } => {}
    }
    let cfg = Config::resolve(file, overrides)?;

    let registry = ChildRegistry::new();
    engine::install_interrupt_handler(registry.clone());
    let api = HttpClient::new(&cfg)?;
    let ctx = Context::new(cfg, Arc::new(api), registry);

    match args.cmd {
        Command::Backup {
            project,
            user,
            personal,
            lfs,
            no_clone,
            ..
        } => {
            let selection = match (project, user) {
                (Some(p), _) => Selection::Project(p),
                (None, Some(username)) => Selection::User { username, personal },
                (None, None) => Selection::All,
            };
            let clone = match (no_clone, lfs) {
                (true, _) => None,
                (false, true) => Some(CloneMode::Lfs),
                (false, false) => Some(CloneMode::Mirror),
            };
            backup::run(&ctx, &selection, BackupOptions { clone })
        }
        Command::Restore {
            backup_dir,
            project,
            component,
            no_create,
            ..
        } => restore::run(
            &ctx,
            &RestoreOptions {
                backup_dir,
                project,
                component,
                create: !no_create,
            },
        ),
        Command::ExpireJobs {
            project,
            max_days,
            dry_run,
        } => {
            let selection = project.map_or(Selection::All, Selection::Project);
            jobs::run(&ctx, &selection, ExpiryOptions { max_days, dry_run })
        }
    }
}
