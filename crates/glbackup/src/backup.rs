use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::endpoints::{self, Component};
use crate::api::source::{Pages, fetch_all, fetch_all_lenient, id_of, key_of};
use crate::api::{FetchMode, MetadataSource};
use crate::archive::{self, ArchiveOutcome};
use crate::context::Context;
use crate::engine::{Report, WorkQueue};
use crate::error::{Error, Result};
use crate::git::{self, CloneMode, CloneOutcome, Cloner};
use crate::project::WorkItem;
use crate::util::{atomic_write_text, write_json_pretty};

/// Which projects a run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    /// Numeric id or `namespace/name` path.
    Project(String),
    /// Projects the user is involved in; only their own namespace when
    /// `personal` is set.
    User { username: String, personal: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupOptions {
    /// `None` skips the repository clone.
    pub clone: Option<CloneMode>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            clone: Some(CloneMode::Mirror),
        }
    }
}

pub fn run(ctx: &Context, selection: &Selection, opts: BackupOptions) -> Result<Report> {
    let records = discover(ctx, selection)?;
    if records.is_empty() {
        info!("cannot find any projects");
        return Ok(Report::default());
    }

    let queue = WorkQueue::new();
    for raw in records {
        match WorkItem::from_record(raw, ctx.cfg.retries) {
            Ok(item) => queue.enqueue(item),
            Err(e) => warn!("skipping project: {e}"),
        }
    }
    info!(projects = queue.len(), "projects queued for backup");

    let worker_ctx = ctx.clone();
    ctx.pool().run("backup", queue, move |item: &WorkItem| {
        backup_project(&worker_ctx, item, opts)
    })
}

/// Project records for `selection`. A single-user selection also writes the
/// user's own metadata directory.
pub fn discover(ctx: &Context, selection: &Selection) -> Result<Vec<Value>> {
    let api = ctx.api.as_ref();
    let per_page = ctx.cfg.per_page;
    match selection {
        Selection::All => fetch_all(api, &endpoints::projects(), per_page),
        Selection::Project(p) => match api.fetch_one(&endpoints::project(p))? {
            Some(rec) => Ok(vec![rec]),
            None => Err(Error::NotFound(format!("cannot find project {p}"))),
        },
        Selection::User { username, personal } => {
            let user = find_user(api, username)?;
            let projects = user_projects(api, per_page, username, *personal)?;
            backup_user_metadata(ctx, &user, &projects)?;
            Ok(projects)
        }
    }
}

pub fn find_user(api: &dyn MetadataSource, username: &str) -> Result<Value> {
    api.fetch_page(
        &endpoints::users_by_username(username),
        20,
        1,
        FetchMode::Strict,
    )?
    .into_iter()
    .find(|u| u.get("username").and_then(Value::as_str) == Some(username))
    .ok_or_else(|| Error::NotFound(format!("cannot find user {username}")))
}

pub fn user_projects(
    api: &dyn MetadataSource,
    per_page: u32,
    username: &str,
    personal: bool,
) -> Result<Vec<Value>> {
    let path = endpoints::projects();
    if personal {
        return Pages::new(api, &path, per_page)
            .filtered(|p| namespace_name(p) == Some(username))
            .collect();
    }
    let mut out = Vec::new();
    for rec in Pages::new(api, &path, per_page) {
        let rec = rec?;
        if user_involved(api, per_page, username, &rec)? {
            out.push(rec);
        }
    }
    Ok(out)
}

/// The user owns the namespace or the project, or is a member of the project
/// or of its namespace group. Member lookups tolerate API errors.
pub fn user_involved(
    api: &dyn MetadataSource,
    per_page: u32,
    username: &str,
    project: &Value,
) -> Result<bool> {
    if namespace_name(project) == Some(username) {
        return Ok(true);
    }
    let owner = project
        .get("owner")
        .and_then(|o| o.get("username"))
        .and_then(Value::as_str);
    if owner == Some(username) {
        return Ok(true);
    }
    let has = |members: Vec<Value>| {
        members
            .iter()
            .any(|m| m.get("username").and_then(Value::as_str) == Some(username))
    };
    if let Some(id) = id_of(project, "id") {
        if has(fetch_all_lenient(api, &endpoints::project_members(id), per_page)?) {
            return Ok(true);
        }
    }
    if let Some(ns_id) = project.get("namespace").and_then(|ns| id_of(ns, "id")) {
        if has(fetch_all_lenient(api, &endpoints::group_members(ns_id), per_page)?) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn namespace_name(project: &Value) -> Option<&str> {
    project
        .get("namespace")
        .and_then(|ns| ns.get("name"))
        .and_then(Value::as_str)
}

/// Write `user_<id>_<username>/{user,projects,ssh,email}.json`.
pub fn backup_user_metadata(ctx: &Context, user: &Value, projects: &[Value]) -> Result<PathBuf> {
    let api = ctx.api.as_ref();
    let id = id_of(user, "id")
        .ok_or_else(|| Error::malformed("users", "user record without an id"))?;
    let username = user
        .get("username")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let dir = ctx
        .cfg
        .backup_dir
        .join(format!("user_{id}_{username}").replace(['/', '\\'], "_"));
    info!(user = %username, user_id = id, "backing up user metadata");

    write_json_pretty(&dir.join("user.json"), user)?;
    write_json_pretty(&dir.join("projects.json"), &Value::Array(projects.to_vec()))?;
    let keys = fetch_all(api, &endpoints::user_keys(id), ctx.cfg.per_page)?;
    write_json_pretty(&dir.join("ssh.json"), &Value::Array(keys))?;
    let emails = fetch_all(api, &endpoints::user_emails(id), ctx.cfg.per_page)?;
    write_json_pretty(&dir.join("email.json"), &Value::Array(emails))?;
    Ok(dir)
}

/// The per-project sequence. Reruns from the top on retry; every file it
/// writes is overwritten.
pub fn backup_project(ctx: &Context, item: &WorkItem, opts: BackupOptions) -> Result<()> {
    let cfg = &ctx.cfg;
    let dir = cfg.backup_dir.join(item.dir_name());
    info!(project_id = item.id, project = %item.name, "backing up project");
    write_json_pretty(&dir.join("project.json"), &item.raw)?;

    match opts.clone {
        Some(mode) => clone_repository(ctx, item, &dir, mode)?,
        None => {
            if let Some(root) = &cfg.repository_dir {
                let src = root.join(&item.namespace).join(format!("{}.git", item.name));
                archive_local(ctx, item, &src, &dir, "")?;
            }
        }
    }
    if let Some(root) = &cfg.repository_dir {
        let src = root
            .join(&item.namespace)
            .join(format!("{}.wiki.git", item.name));
        archive_local(ctx, item, &src, &dir, "")?;
    }
    if let Some(root) = &cfg.upload_dir {
        let src = root.join(&item.namespace).join(&item.name);
        archive_local(ctx, item, &src, &dir, "upload_")?;
    }

    for component in Component::ALL {
        if ctx.registry.cancelled() {
            return Err(Error::Cancelled);
        }
        if item.should_backup(component) {
            backup_component(ctx, item, &dir, component)?;
        } else {
            debug!(project_id = item.id, component = %component, "component disabled");
        }
    }
    Ok(())
}

fn clone_repository(ctx: &Context, item: &WorkItem, dir: &Path, mode: CloneMode) -> Result<()> {
    let cfg = &ctx.cfg;
    let Some(url) = item.clone_url() else {
        warn!(project_id = item.id, "project has no http_url_to_repo, not cloning");
        return Ok(());
    };
    let url = git::authenticated_url(url, cfg.clone_token());
    let cloner = Cloner::new(&ctx.registry, &cfg.tmp_dir, cfg.git_timeout, cfg.tar_timeout);
    match cloner.backup_repository(item.id, &item.name, &url, dir, mode)? {
        CloneOutcome::Archived(path) => {
            debug!(project_id = item.id, archive = %path.display(), "repository archived");
        }
        CloneOutcome::Empty => {}
    }
    Ok(())
}

fn archive_local(
    ctx: &Context,
    item: &WorkItem,
    src: &Path,
    dest: &Path,
    prefix: &str,
) -> Result<()> {
    match archive::archive_directory(&ctx.registry, src, dest, prefix, ctx.cfg.tar_timeout)? {
        ArchiveOutcome::Archived(path) => {
            debug!(project_id = item.id, archive = %path.display(), "archived");
        }
        ArchiveOutcome::SourceAbsent => {}
    }
    Ok(())
}

fn backup_component(ctx: &Context, item: &WorkItem, dir: &Path, component: Component) -> Result<()> {
    let api = ctx.api.as_ref();
    let per_page = ctx.cfg.per_page;
    let cap = component.capability();
    debug!(project_id = item.id, component = %component, "backing up component");

    let entries = Value::Array(fetch_all(
        api,
        &endpoints::component_collection(item.id, component),
        per_page,
    )?);
    write_json_pretty(&dir.join(component.dump_file()), &entries)?;

    for entry in entries.as_array().into_iter().flatten() {
        let Some(key) = key_of(entry, cap.id_field) else {
            warn!(project_id = item.id, component = %component, "entry without {}", cap.id_field);
            continue;
        };
        if cap.has_notes {
            let notes = fetch_all(api, &endpoints::notes(item.id, component, &key), per_page)?;
            dump_if_any(dir, &format!("{}_{key}_notes.dump", cap.file_kind), notes)?;
        }
        match component {
            Component::Issues => {
                let mrs = fetch_all(
                    api,
                    &endpoints::issue_merge_requests(item.id, &key),
                    per_page,
                )?;
                dump_if_any(dir, &format!("{}_{key}_merge_requests.dump", cap.file_kind), mrs)?;
            }
            Component::Snippets => {
                let content = api.fetch_raw(&endpoints::snippet_raw(item.id, &key))?;
                atomic_write_text(
                    &dir.join(format!("{}_{key}_content.dump", cap.file_kind)),
                    &content,
                )?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn dump_if_any(dir: &Path, file: &str, records: Vec<Value>) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    write_json_pretty(&dir.join(file), &Value::Array(records))
}
