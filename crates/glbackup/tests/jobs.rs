mod common;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use glbackup::backup::Selection;
use glbackup::jobs::{self, ExpiryOptions};
use glbackup::project::WorkItem;
use serde_json::json;

use common::{FakeSource, config, context, project};

fn source() -> FakeSource {
    FakeSource::new()
        .with_collection("projects", vec![project(1, "ci", json!({}))])
        .with_collection(
            "projects/1/jobs",
            vec![
                json!({"id": 100, "created_at": "2020-01-01T00:00:00Z"}),
                json!({"id": 101, "created_at": "2099-01-01T00:00:00Z"}),
                json!({"id": 102, "created_at": "yesterday"}),
                json!({"id": 103, "created_at": "2019-06-01T12:00:00.000+02:00"}),
            ],
        )
}

#[test]
fn dry_run_erases_nothing() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fake = Arc::new(source());
    let ctx = context(config(tmp.path(), 2), &fake);
    let opts = ExpiryOptions {
        dry_run: true,
        ..ExpiryOptions::default()
    };
    let report = jobs::run(&ctx, &Selection::All, opts).expect("expire");
    assert_eq!(report.done, 1);
    assert!(fake.posts().is_empty());
}

#[test]
fn only_jobs_older_than_the_cutoff_are_erased() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fake = Arc::new(source());
    let ctx = context(config(tmp.path(), 2), &fake);
    let report = jobs::run(&ctx, &Selection::All, ExpiryOptions::default()).expect("expire");
    assert!(report.ok());

    let erased: Vec<String> = fake.posts().into_iter().map(|c| c.path).collect();
    assert_eq!(
        erased,
        vec![
            "projects/1/jobs/100/erase".to_string(),
            "projects/1/jobs/103/erase".to_string(),
        ]
    );
}

#[test]
fn expire_project_counts_what_it_would_erase() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fake = Arc::new(source());
    let ctx = context(config(tmp.path(), 1), &fake);
    let item = WorkItem::from_record(project(1, "ci", json!({})), 3).expect("item");
    let before: DateTime<Utc> = "2020-06-01T00:00:00Z".parse().expect("ts");

    assert_eq!(jobs::expire_project(&ctx, &item, before, true).expect("dry"), 2);
    let early: DateTime<Utc> = "2019-01-01T00:00:00Z".parse().expect("ts");
    assert_eq!(jobs::expire_project(&ctx, &item, early, false).expect("real"), 0);
    assert!(fake.posts().is_empty());
}
