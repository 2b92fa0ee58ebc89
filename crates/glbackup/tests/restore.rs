mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use glbackup::Error;
use glbackup::api::Component;
use glbackup::restore::{self, RestoreOptions};
use serde_json::{Value, json};

use common::{FakeSource, config, context, project};

fn dump(dir: &Path, file: &str, value: Value) {
    fs::write(dir.join(file), serde_json::to_vec_pretty(&value).expect("json")).expect("write dump");
}

fn backup_dir(root: &Path) -> std::path::PathBuf {
    let dir = root.join("1_grp_app");
    fs::create_dir_all(&dir).expect("mkdir");
    dump(&dir, "project.json", project(1, "app", json!({"description": "d"})));
    dir
}

fn into_existing(dir: &Path, component: Option<Component>) -> RestoreOptions {
    RestoreOptions {
        backup_dir: dir.to_path_buf(),
        project: "9".into(),
        component,
        create: true,
    }
}

fn existing_destination() -> FakeSource {
    FakeSource::new().with_one("projects/9", project(9, "app", json!({})))
}

#[test]
fn issues_are_restored_after_everything_else() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = backup_dir(tmp.path());
    dump(&dir, "labels.json", json!([{"id": 1, "name": "bug"}, {"id": 2, "name": "ux"}]));
    dump(&dir, "milestones.json", json!([{"id": 3, "title": "v1"}]));
    dump(&dir, "boards.json", json!([{"id": 4, "name": "dev"}]));
    dump(
        &dir,
        "issues.json",
        json!([{"id": 10, "iid": 1, "title": "a"}, {"id": 11, "iid": 2, "title": "b"}]),
    );
    let fake = Arc::new(existing_destination());
    let ctx = context(config(tmp.path(), 3), &fake);

    let report = restore::run(&ctx, &into_existing(&dir, None)).expect("restore");
    assert_eq!(report.done, 6);

    let posts = fake.posts();
    let first_issue = posts
        .iter()
        .position(|c| c.path == "projects/9/issues")
        .expect("issue posted");
    let last_other = posts
        .iter()
        .rposition(|c| c.path != "projects/9/issues")
        .expect("others posted");
    assert!(last_other < first_issue, "{posts:?}");
    assert_eq!(fake.count("POST", "projects/9/issues"), 2);
    assert_eq!(fake.count("POST", "projects/9/labels"), 2);
}

#[test]
fn closed_issue_is_closed_and_notes_replayed_oldest_first() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = backup_dir(tmp.path());
    dump(
        &dir,
        "issues.json",
        json!([{
            "id": 10, "iid": 4, "title": "broken", "state": "closed",
            "created_at": "2020-01-01T00:00:00Z", "author": {"id": 2},
        }]),
    );
    dump(
        &dir,
        "issue_4_notes.dump",
        json!([{"id": 31, "body": "second"}, {"id": 30, "body": "first"}]),
    );
    let fake = Arc::new(existing_destination());
    let ctx = context(config(tmp.path(), 1), &fake);

    let report = restore::run(&ctx, &into_existing(&dir, Some(Component::Issues))).expect("restore");
    assert!(report.ok());

    let calls: Vec<_> = fake
        .calls()
        .into_iter()
        .filter(|c| c.method != "GET")
        .collect();
    assert_eq!(calls.len(), 4, "{calls:?}");

    let issue = calls[0].payload.as_ref().expect("payload");
    assert_eq!(calls[0].path, "projects/9/issues");
    assert_eq!(issue["id"], 9);
    assert_eq!(issue["author_id"], 2);
    assert!(issue.get("iid").is_none());
    assert!(issue.get("created_at").is_none());

    assert_eq!(calls[1].method, "PUT");
    assert_eq!(calls[1].path, "projects/9/issues/1000");
    assert_eq!(calls[1].payload, Some(json!({"state_event": "close"})));

    assert_eq!(calls[2].path, "projects/9/issues/1000/notes");
    assert_eq!(calls[2].payload.as_ref().expect("note")["body"], "first");
    assert_eq!(calls[2].payload.as_ref().expect("note")["issue_id"], 1000);
    assert_eq!(calls[3].payload.as_ref().expect("note")["body"], "second");
}

#[test]
fn open_issue_is_not_closed() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = backup_dir(tmp.path());
    dump(&dir, "issues.json", json!([{"id": 10, "iid": 4, "title": "x", "state": "opened"}]));
    let fake = Arc::new(existing_destination());
    let ctx = context(config(tmp.path(), 1), &fake);
    restore::run(&ctx, &into_existing(&dir, None)).expect("restore");
    assert!(fake.calls().iter().all(|c| c.method != "PUT"));
}

#[test]
fn snippet_without_content_is_never_posted() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = backup_dir(tmp.path());
    dump(
        &dir,
        "snippets.json",
        json!([{"id": 8, "title": "has content"}, {"id": 9, "title": "lost"}]),
    );
    fs::write(dir.join("snippet_8_content.dump"), "echo hi\n").expect("content");
    let fake = Arc::new(existing_destination());
    let ctx = context(config(tmp.path(), 1), &fake);

    let report =
        restore::run(&ctx, &into_existing(&dir, Some(Component::Snippets))).expect("restore");
    assert_eq!(report.done, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failed_items, vec!["snippets 'lost'".to_string()]);

    let posts = fake.posts();
    assert_eq!(posts.len(), 1);
    let snippet = posts[0].payload.as_ref().expect("payload");
    assert_eq!(snippet["title"], "has content");
    assert_eq!(snippet["content"], "echo hi\n");
    assert_eq!(snippet["visibility"], "private");
    assert_eq!(snippet["file_name"], "has_content.txt");
}

#[test]
fn access_requests_are_not_replayed() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = backup_dir(tmp.path());
    dump(&dir, "request_access.json", json!([{"id": 5, "username": "eve"}]));
    let fake = Arc::new(existing_destination());
    let ctx = context(config(tmp.path(), 1), &fake);
    let report = restore::run(&ctx, &into_existing(&dir, None)).expect("restore");
    assert_eq!(report.started, 0);
    assert!(fake.posts().is_empty());
}

#[test]
fn created_project_gets_members_once() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = backup_dir(tmp.path());
    dump(
        &dir,
        "members.json",
        json!([{"id": 5, "username": "bob", "access_level": 30}]),
    );
    let fake = Arc::new(FakeSource::new());
    let ctx = context(config(tmp.path(), 1), &fake);
    let opts = RestoreOptions {
        backup_dir: dir.clone(),
        project: "grp/copy".into(),
        component: None,
        create: true,
    };
    restore::run(&ctx, &opts).expect("restore");

    let posts = fake.posts();
    assert_eq!(posts[0].path, "projects");
    let created = posts[0].payload.as_ref().expect("payload");
    assert_eq!(created["name"], "copy");
    assert_eq!(created["namespace_id"], 51);
    assert_eq!(created["description"], "d");

    assert_eq!(fake.count("POST", "projects/1000/members"), 1);
    assert_eq!(
        posts[1].payload,
        Some(json!({"user_id": 5, "access_level": 30}))
    );
}

#[test]
fn missing_destination_without_create_is_not_found() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = backup_dir(tmp.path());
    let fake = Arc::new(FakeSource::new());
    let ctx = context(config(tmp.path(), 1), &fake);
    let opts = RestoreOptions {
        create: false,
        ..into_existing(&dir, None)
    };
    let err = restore::run(&ctx, &opts).unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert!(fake.posts().is_empty());
}

#[test]
fn directory_without_project_json_is_rejected() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fake = Arc::new(existing_destination());
    let ctx = context(config(tmp.path(), 1), &fake);
    let err = restore::run(&ctx, &into_existing(tmp.path(), None)).unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert!(fake.calls().is_empty());
}
