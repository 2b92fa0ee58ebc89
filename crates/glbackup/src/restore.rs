//! Replays a project backup directory into a destination project: project
//! (re)creation, local repository restore, then component entries in
//! dependency order (everything before issues).

use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};

use crate::api::Verb;
use crate::api::endpoints::{self, Component};
use crate::api::source::{id_of, key_of, require_id};
use crate::context::Context;
use crate::engine::{Report, Task, WorkQueue};
use crate::error::{Error, Result};
use crate::git;
use crate::process;
use crate::util::{read_json_opt, read_text_opt};

/// Fields the platform assigns itself or refuses on create.
const STRIPPED_ENTRY_FIELDS: &[&str] = &[
    "created_at",
    "updated_at",
    "expires_at",
    "closed_at",
    "last_edited_at",
    "user_notes_count",
    "upvotes",
    "downvotes",
    "work_in_progress",
    "merge_when_pipeline_succeeds",
    "has_conflicts",
    "web_url",
    "iid",
];

const STRIPPED_PROJECT_FIELDS: &[&str] = &[
    "id",
    "web_url",
    "http_url_to_repo",
    "ssh_url_to_repo",
    "readme_url",
    "avatar_url",
    "_links",
    "created_at",
    "last_activity_at",
    "forks_count",
    "star_count",
    "open_issues_count",
    "creator_id",
    "owner",
    "permissions",
    "namespace",
    "path_with_namespace",
    "name_with_namespace",
    "runners_token",
    "import_status",
    "statistics",
    "empty_repo",
];

/// Embedded objects the create endpoints only accept as ids.
const FOREIGN_KEYS: &[(&str, &str)] = &[
    ("assignee", "assignee_id"),
    ("milestone", "milestone_id"),
    ("author", "author_id"),
];

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub backup_dir: PathBuf,
    /// Destination project id or `namespace/name` path.
    pub project: String,
    pub component: Option<Component>,
    pub create: bool,
}

/// One record of a component dump, consumed once by a restore worker.
#[derive(Debug, Clone)]
pub struct Entry {
    pub component: Component,
    /// Backup-time id/iid; only used to find attachment dumps.
    pub old_key: Option<String>,
    pub fields: Map<String, Value>,
}

impl Task for Entry {
    fn label(&self) -> String {
        let name = ["title", "name", "username"]
            .iter()
            .find_map(|k| self.fields.get(*k).and_then(Value::as_str));
        match (name, &self.old_key) {
            (Some(n), _) => format!("{} '{n}'", self.component),
            (None, Some(k)) => format!("{} #{k}", self.component),
            (None, None) => self.component.to_string(),
        }
    }
}

pub fn run(ctx: &Context, opts: &RestoreOptions) -> Result<Report> {
    let dir = opts.backup_dir.as_path();
    let project_file = dir.join("project.json");
    let backed_up = read_json_opt(&project_file)?.ok_or_else(|| {
        Error::NotFound(format!(
            "{} does not look like a project backup: no project.json",
            dir.display()
        ))
    })?;

    let (dest, created) = resolve_destination(ctx, opts, &backed_up)?;
    let dest_id = require_id(&dest, "id", &endpoints::project(&opts.project))?;
    info!(project_id = dest_id, created, "restoring into project");

    let members_restored = if created {
        restore_members(ctx, dir, dest_id)?;
        true
    } else {
        false
    };

    if ctx.cfg.repository_dir.is_some() {
        if let Err(e) = restore_repositories(ctx, dir, &backed_up, &dest) {
            if e.is_fatal() || matches!(e, Error::Cancelled) {
                return Err(e);
            }
            error!(project_id = dest_id, "repository restore failed: {e}");
        }
    }

    let wanted = |c: Component| opts.component.is_none_or(|only| only == c);

    let mut first = WorkQueue::new();
    for component in Component::ALL {
        if component == Component::Issues || !wanted(component) {
            continue;
        }
        if !component.capability().restorable {
            info!(component = %component, "cannot be restored by an administrator, skipping");
            continue;
        }
        if component == Component::Members && members_restored {
            debug!("members already restored with the project");
            continue;
        }
        first.extend(load_entries(dir, component)?);
    }
    let mut report = run_phase(ctx, dir, dest_id, "restore", first)?;

    if wanted(Component::Issues) {
        let issues: WorkQueue<Entry> = load_entries(dir, Component::Issues)?.into_iter().collect();
        report.absorb(run_phase(ctx, dir, dest_id, "restore issues", issues)?);
    }
    Ok(report)
}

fn run_phase(
    ctx: &Context,
    dir: &Path,
    dest_id: u64,
    what: &str,
    queue: WorkQueue<Entry>,
) -> Result<Report> {
    let worker_ctx = ctx.clone();
    let dir = dir.to_path_buf();
    ctx.pool().run(what, queue, move |entry: &Entry| {
        restore_entry(&worker_ctx, &dir, dest_id, entry)
    })
}

fn resolve_destination(
    ctx: &Context,
    opts: &RestoreOptions,
    backed_up: &Value,
) -> Result<(Value, bool)> {
    let api = ctx.api.as_ref();
    if let Some(existing) = api.fetch_one(&endpoints::project(&opts.project))? {
        return Ok((existing, false));
    }
    if !opts.create {
        return Err(Error::NotFound(format!(
            "cannot find project {}",
            opts.project
        )));
    }
    let payload = project_payload(backed_up, &opts.project);
    info!(project = %opts.project, "creating project");
    let created = api.mutate(&endpoints::projects(), &payload, Verb::Post)?;
    Ok((created, true))
}

/// Create payload for a project from its backup. A non-numeric destination
/// names the new project after its last path segment.
pub fn project_payload(backed_up: &Value, destination: &str) -> Value {
    let mut fields = backed_up.as_object().cloned().unwrap_or_default();
    let namespace_id = backed_up.get("namespace").and_then(|ns| id_of(ns, "id"));
    for key in STRIPPED_PROJECT_FIELDS {
        fields.remove(*key);
    }
    if let Some(ns) = namespace_id {
        fields.insert("namespace_id".into(), json!(ns));
    }
    if destination.parse::<u64>().is_err() {
        if let Some(last) = destination.rsplit('/').next().filter(|s| !s.is_empty()) {
            fields.insert("name".into(), json!(last));
            fields.insert("path".into(), json!(last));
        }
    }
    Value::Object(fields)
}

fn member_payload(member: &Value) -> Option<Value> {
    let user_id = id_of(member, "id")?;
    let access_level = member.get("access_level").cloned().unwrap_or(json!(10));
    Some(json!({"user_id": user_id, "access_level": access_level}))
}

fn restore_members(ctx: &Context, dir: &Path, dest_id: u64) -> Result<()> {
    let Some(members) = read_json_opt(&dir.join(Component::Members.dump_file()))? else {
        return Ok(());
    };
    for member in members.as_array().into_iter().flatten() {
        let Some(payload) = member_payload(member) else {
            warn!("member entry without an id, skipping");
            continue;
        };
        match ctx
            .api
            .mutate(&endpoints::project_members(dest_id), &payload, Verb::Post)
        {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e),
            // The creator is a member already.
            Err(e) => warn!(project_id = dest_id, "member not restored: {e}"),
        }
    }
    Ok(())
}

fn restore_repositories(ctx: &Context, dir: &Path, backed_up: &Value, dest: &Value) -> Result<()> {
    let cfg = &ctx.cfg;
    let Some(root) = &cfg.repository_dir else {
        return Ok(());
    };
    let name_of = |p: &Value| p.get("name").and_then(Value::as_str).map(str::to_string);
    let ns_of = |p: &Value| {
        p.get("namespace")
            .and_then(|ns| ns.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let (Some(old_name), Some(name), Some(ns)) = (
        name_of(backed_up),
        name_of(dest).or_else(|| name_of(backed_up)),
        ns_of(dest).or_else(|| ns_of(backed_up)),
    ) else {
        warn!("project has no name or namespace, skipping repository restore");
        return Ok(());
    };

    let mut restored = false;
    for suffix in [".git", ".wiki.git"] {
        let archive = dir.join(format!("{old_name}{suffix}.tgz"));
        if !archive.is_file() {
            debug!(archive = %archive.display(), "no repository archive");
            continue;
        }
        let target = root.join(&ns).join(format!("{name}{suffix}"));
        git::install_bare(
            &ctx.registry,
            &archive,
            &target,
            cfg.hooks_dir.as_deref(),
            cfg.git_timeout,
        )?;
        restored = true;
    }
    if restored {
        clear_cache(ctx);
    }
    Ok(())
}

fn clear_cache(ctx: &Context) {
    let Some((program, args)) = ctx.cfg.cache_clear_cmd.split_first() else {
        return;
    };
    let mut cmd = Command::new(program);
    cmd.args(args);
    let label = process::describe(&cmd);
    match process::run(&ctx.registry, cmd, ctx.cfg.git_timeout) {
        Ok(out) if out.success() => info!(command = %label, "cache cleared"),
        Ok(out) => warn!(command = %label, "cache invalidation failed: {}", out.summary()),
        Err(e) => warn!(command = %label, "cache invalidation failed: {e}"),
    }
}

/// Entries of one component dump; a missing dump means nothing to do.
pub fn load_entries(dir: &Path, component: Component) -> Result<Vec<Entry>> {
    let path = dir.join(component.dump_file());
    let Some(dump) = read_json_opt(&path)? else {
        debug!(component = %component, "nothing to do");
        return Ok(Vec::new());
    };
    let Value::Array(records) = dump else {
        return Err(Error::parse(&path, "expected a JSON array"));
    };
    let id_field = component.capability().id_field;
    Ok(records
        .into_iter()
        .filter_map(|r| {
            let old_key = key_of(&r, id_field);
            match r {
                Value::Object(fields) => Some(Entry {
                    component,
                    old_key,
                    fields,
                }),
                _ => None,
            }
        })
        .collect())
}

/// Strip server-assigned fields, turn embedded objects into `*_id` keys and
/// point the record at the destination project.
pub fn prepare_entry(fields: &Map<String, Value>, dest_id: u64) -> Map<String, Value> {
    let mut out = fields.clone();
    for key in STRIPPED_ENTRY_FIELDS {
        out.remove(*key);
    }
    for (object_key, id_key) in FOREIGN_KEYS {
        if let Some(obj) = out.get(*object_key).filter(|v| v.is_object()) {
            if let Some(id) = id_of(obj, "id") {
                out.insert((*id_key).to_string(), json!(id));
            }
            out.remove(*object_key);
        }
    }
    if let Some(Value::Array(assignees)) = out.remove("assignees") {
        let ids: Vec<u64> = assignees.iter().filter_map(|a| id_of(a, "id")).collect();
        if !ids.is_empty() {
            out.insert("assignee_ids".into(), json!(ids));
        }
    }
    out.insert("id".into(), json!(dest_id));
    out
}

fn snippet_file_name(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| *c != '\'' && *c != '"')
        .map(|c| if c.is_whitespace() || c == '/' { '_' } else { c })
        .collect();
    format!("{}.txt", if cleaned.is_empty() { "snippet" } else { &cleaned })
}

pub fn restore_entry(ctx: &Context, dir: &Path, dest_id: u64, entry: &Entry) -> Result<()> {
    let api = ctx.api.as_ref();
    let component = entry.component;
    let cap = component.capability();
    let collection = endpoints::component_collection(dest_id, component);

    let payload = match component {
        Component::Members => member_payload(&Value::Object(entry.fields.clone()))
            .ok_or_else(|| Error::parse(&dir.join(component.dump_file()), "member without id"))?,
        Component::Snippets => Value::Object(snippet_payload(dir, dest_id, entry)?),
        _ => Value::Object(prepare_entry(&entry.fields, dest_id)),
    };
    let created = api.mutate(&collection, &payload, Verb::Post)?;

    let Some(new_key) = key_of(&created, cap.id_field) else {
        debug!(component = %component, "created entry has no {}", cap.id_field);
        return Ok(());
    };
    let was_closed = entry.fields.get("state").and_then(Value::as_str) == Some("closed");
    if cap.closable && was_closed {
        api.mutate(
            &endpoints::component_entry(dest_id, component, &new_key),
            &json!({"state_event": "close"}),
            Verb::Put,
        )?;
    }
    if cap.has_notes {
        if let Some(old_key) = &entry.old_key {
            let new_id = id_of(&created, "id").unwrap_or_default();
            replay_notes(ctx, dir, dest_id, entry, old_key, &new_key, new_id)?;
        }
    }
    Ok(())
}

fn snippet_payload(dir: &Path, dest_id: u64, entry: &Entry) -> Result<Map<String, Value>> {
    let key = entry.old_key.as_deref().unwrap_or("unknown");
    let file_kind = Component::Snippets.capability().file_kind;
    let content_path = dir.join(format!("{file_kind}_{key}_content.dump"));
    let Some(content) = read_text_opt(&content_path)? else {
        return Err(Error::read(
            &content_path,
            format!("content of snippet {key} cannot be found, not restoring it"),
        ));
    };
    let mut payload = prepare_entry(&entry.fields, dest_id);
    if !payload.get("visibility").is_some_and(|v| v.is_string()) {
        payload.insert("visibility".into(), json!("private"));
    }
    if !payload.get("file_name").is_some_and(|v| v.is_string()) {
        let title = payload
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default();
        payload.insert("file_name".into(), json!(snippet_file_name(title)));
    }
    payload.insert("content".into(), json!(content));
    Ok(payload)
}

fn replay_notes(
    ctx: &Context,
    dir: &Path,
    dest_id: u64,
    entry: &Entry,
    old_key: &str,
    new_key: &str,
    new_id: u64,
) -> Result<()> {
    let cap = entry.component.capability();
    let notes_path = dir.join(format!("{}_{old_key}_notes.dump", cap.file_kind));
    let Some(notes) = read_json_opt(&notes_path)? else {
        return Ok(());
    };
    let url = endpoints::notes(dest_id, entry.component, new_key);
    // Notes come back newest first.
    for note in notes.as_array().into_iter().flatten().rev() {
        let Some(fields) = note.as_object() else {
            continue;
        };
        let mut payload = prepare_entry(fields, dest_id);
        payload.insert(format!("{}_id", cap.file_kind), json!(new_id));
        ctx.api.mutate(&url, &Value::Object(payload), Verb::Post)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_lose_server_fields_and_gain_foreign_keys() {
        let fields = json!({
            "id": 77, "iid": 3, "title": "t", "created_at": "x", "upvotes": 2,
            "assignee": {"id": 5, "username": "a"},
            "milestone": {"id": 8},
            "author": {"id": 9},
            "assignees": [{"id": 5}, {"id": 6}],
            "state": "closed",
        });
        let out = prepare_entry(fields.as_object().expect("object"), 42);
        assert_eq!(out["id"], 42);
        assert_eq!(out["assignee_id"], 5);
        assert_eq!(out["milestone_id"], 8);
        assert_eq!(out["author_id"], 9);
        assert_eq!(out["assignee_ids"], json!([5, 6]));
        for gone in ["iid", "created_at", "upvotes", "assignee", "milestone", "author"] {
            assert!(!out.contains_key(gone), "{gone} should be stripped");
        }
        assert_eq!(out["state"], "closed");
    }

    #[test]
    fn project_payload_keeps_namespace_as_id() {
        let backed_up = json!({
            "id": 1, "name": "old", "path": "old", "description": "d",
            "namespace": {"id": 12, "name": "g"},
            "http_url_to_repo": "https://x/g/old.git",
            "last_activity_at": "t", "star_count": 3,
        });
        let p = project_payload(&backed_up, "g/new");
        assert_eq!(p["namespace_id"], 12);
        assert_eq!(p["name"], "new");
        assert_eq!(p["description"], "d");
        assert!(p.get("id").is_none());
        assert!(p.get("http_url_to_repo").is_none());
        assert!(p.get("star_count").is_none());

        let same = project_payload(&backed_up, "17");
        assert_eq!(same["name"], "old");
    }

    #[test]
    fn snippet_file_names_come_from_titles() {
        assert_eq!(snippet_file_name("my 'cool' snip"), "my_cool_snip.txt");
        assert_eq!(snippet_file_name(""), "snippet.txt");
    }

    #[test]
    fn entries_keep_the_backup_key() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            tmp.path().join("issues.json"),
            r#"[{"id": 100, "iid": 4, "title": "a"}, 5]"#,
        )
        .expect("write");
        let entries = load_entries(tmp.path(), Component::Issues).expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].old_key.as_deref(), Some("4"));
        assert_eq!(entries[0].label(), "issues 'a'");
        assert!(load_entries(tmp.path(), Component::Labels)
            .expect("missing")
            .is_empty());
    }
}
