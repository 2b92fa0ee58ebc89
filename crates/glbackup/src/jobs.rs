use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::api::Verb;
use crate::api::endpoints;
use crate::api::source::{Pages, id_of};
use crate::backup::{self, Selection};
use crate::context::Context;
use crate::engine::{Report, WorkQueue};
use crate::error::Result;
use crate::project::WorkItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryOptions {
    pub max_days: u32,
    pub dry_run: bool,
}

impl Default for ExpiryOptions {
    fn default() -> Self {
        Self {
            max_days: 90,
            dry_run: false,
        }
    }
}

pub fn cutoff(now: DateTime<Utc>, max_days: u32) -> DateTime<Utc> {
    now - Duration::days(i64::from(max_days))
}

pub fn run(ctx: &Context, selection: &Selection, opts: ExpiryOptions) -> Result<Report> {
    if opts.dry_run {
        info!("dry run, nothing will be erased");
    }
    let records = backup::discover(ctx, selection)?;
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

    let before = cutoff(Utc::now(), opts.max_days);
    let worker_ctx = ctx.clone();
    ctx.pool().run("expire-jobs", queue, move |item: &WorkItem| {
        expire_project(&worker_ctx, item, before, opts.dry_run).map(|_| ())
    })
}

/// Erase every job of `item` created before `before`. Returns how many jobs
/// were (or in a dry run would have been) erased.
pub fn expire_project(
    ctx: &Context,
    item: &WorkItem,
    before: DateTime<Utc>,
    dry_run: bool,
) -> Result<usize> {
    let api = ctx.api.as_ref();
    let path = endpoints::project_jobs(item.id);
    info!(project_id = item.id, project = %item.name, "checking jobs");

    let mut erased = 0usize;
    for job in Pages::new(api, &path, ctx.cfg.per_page) {
        let job = job?;
        let Some(job_id) = id_of(&job, "id") else {
            continue;
        };
        let created = job.get("created_at").and_then(Value::as_str).unwrap_or("");
        let created = match DateTime::parse_from_rfc3339(created) {
            Ok(t) => t.with_timezone(&Utc),
            Err(e) => {
                warn!(project_id = item.id, job_id, "unparsable created_at '{created}': {e}");
                continue;
            }
        };
        if created >= before {
            debug!(project_id = item.id, job_id, "job kept");
            continue;
        }
        if dry_run {
            info!(project_id = item.id, job_id, created = %created, "would erase job");
        } else {
            info!(project_id = item.id, job_id, created = %created, "erasing job");
            api.mutate(&endpoints::erase_job(item.id, job_id), &json!({}), Verb::Post)?;
        }
        erased += 1;
    }
    info!(project_id = item.id, erased, "jobs expired");
    Ok(erased)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_is_max_days_back() {
        let now = DateTime::parse_from_rfc3339("2024-04-10T00:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let c = cutoff(now, 90);
        assert_eq!(c.to_rfc3339(), "2024-01-11T00:00:00+00:00");
    }
}
