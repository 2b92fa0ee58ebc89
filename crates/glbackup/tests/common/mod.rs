#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use glbackup::api::{FetchMode, MetadataSource, Verb};
use glbackup::config::Config;
use glbackup::context::Context;
use glbackup::process::ChildRegistry;
use glbackup::{Error, Result};
use serde_json::{Value, json};

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub method: &'static str,
    pub path: String,
    pub payload: Option<Value>,
}

enum Failure {
    Web(usize),
    Unauthorized,
}

/// In-memory platform: serves canned collections page by page, records every
/// call and hands out fresh ids to created entities.
#[derive(Default)]
pub struct FakeSource {
    collections: BTreeMap<String, Vec<Value>>,
    singles: BTreeMap<String, Value>,
    raws: BTreeMap<String, String>,
    failures: Mutex<BTreeMap<String, Failure>>,
    calls: Mutex<Vec<Call>>,
    next_id: AtomicU64,
}

impl FakeSource {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1000),
            ..Self::default()
        }
    }

    pub fn with_collection(mut self, path: &str, records: Vec<Value>) -> Self {
        self.collections.insert(path.to_string(), records);
        self
    }

    pub fn with_one(mut self, path: &str, record: Value) -> Self {
        self.singles.insert(path.to_string(), record);
        self
    }

    pub fn with_raw(mut self, path: &str, body: &str) -> Self {
        self.raws.insert(path.to_string(), body.to_string());
        self
    }

    /// Every call to `path` fails with a web error, `times` times.
    pub fn failing(self, path: &str, times: usize) -> Self {
        self.lock_failures()
            .insert(path.to_string(), Failure::Web(times));
        self
    }

    pub fn unauthorized(self, path: &str) -> Self {
        self.lock_failures()
            .insert(path.to_string(), Failure::Unauthorized);
        self
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Failure>> {
        self.failures.lock().expect("failures lock")
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn posts(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.method == "POST")
            .collect()
    }

    pub fn count(&self, method: &str, path: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.method == method && c.path == path)
            .count()
    }

    fn record(&self, method: &'static str, path: &str, payload: Option<Value>) -> Result<()> {
        self.calls.lock().expect("calls lock").push(Call {
            method,
            path: path.to_string(),
            payload,
        });
        let mut failures = self.lock_failures();
        match failures.get_mut(path) {
            Some(Failure::Unauthorized) => Err(Error::Unauthorized {
                url: path.to_string(),
            }),
            Some(Failure::Web(n)) if *n > 0 => {
                *n -= 1;
                Err(Error::web(path, method, "HTTP 500 Internal Server Error"))
            }
            _ => Ok(()),
        }
    }
}

impl MetadataSource for FakeSource {
    fn fetch_page(
        &self,
        path: &str,
        per_page: u32,
        page: u32,
        mode: FetchMode,
    ) -> Result<Vec<Value>> {
        if page == 1 {
            if let Err(e) = self.record("GET", path, None) {
                return match (e, mode) {
                    (e @ Error::Unauthorized { .. }, _) => Err(e),
                    (_, FetchMode::IgnoreErrors) => Ok(Vec::new()),
                    (e, FetchMode::Strict) => Err(e),
                };
            }
        }
        let all = self.collections.get(path).cloned().unwrap_or_default();
        let per_page = per_page.max(1) as usize;
        Ok(all
            .into_iter()
            .skip((page as usize - 1) * per_page)
            .take(per_page)
            .collect())
    }

    fn fetch_one(&self, path: &str) -> Result<Option<Value>> {
        self.record("GET", path, None)?;
        Ok(self.singles.get(path).cloned())
    }

    fn fetch_raw(&self, path: &str) -> Result<String> {
        self.record("GET", path, None)?;
        self.raws
            .get(path)
            .cloned()
            .ok_or_else(|| Error::web(path, "GET", "HTTP 404"))
    }

    fn mutate(&self, path: &str, payload: &Value, verb: Verb) -> Result<Value> {
        let method = match verb {
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Delete => "DELETE",
        };
        self.record(method, path, Some(payload.clone()))?;
        if verb == Verb::Delete {
            return Ok(Value::Null);
        }
        let mut created = payload.as_object().cloned().unwrap_or_default();
        if verb == Verb::Post {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            created.insert("id".into(), json!(id));
            created.insert("iid".into(), json!(id));
        }
        Ok(Value::Object(created))
    }
}

pub fn config(backup_dir: &Path, workers: usize) -> Config {
    let mut cfg = Config::new("http://127.0.0.1:9", "test-token").expect("config");
    cfg.backup_dir = backup_dir.to_path_buf();
    cfg.tmp_dir = backup_dir.join(".tmp");
    cfg.workers = workers;
    cfg.per_page = 2;
    cfg.poll_interval = Duration::from_millis(10);
    cfg.git_timeout = Duration::from_secs(30);
    cfg.tar_timeout = Duration::from_secs(30);
    cfg
}

pub fn context(cfg: Config, source: &Arc<FakeSource>) -> Context {
    let api: Arc<dyn MetadataSource> = source.clone();
    Context::new(cfg, api, ChildRegistry::new())
}

pub fn project(id: u64, name: &str, extra: Value) -> Value {
    let mut p = json!({
        "id": id,
        "name": name,
        "namespace": {"id": 50 + id, "name": "grp"},
    });
    if let (Some(obj), Some(more)) = (p.as_object_mut(), extra.as_object()) {
        for (k, v) in more {
            obj.insert(k.clone(), v.clone());
        }
    }
    p
}

pub fn have_binary(name: &str) -> bool {
    Command::new(name)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
