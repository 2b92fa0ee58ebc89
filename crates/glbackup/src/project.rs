use std::collections::BTreeMap;

use serde_json::Value;

use crate::api::Component;
use crate::api::source::id_of;
use crate::engine::Task;
use crate::error::{Error, Result};

/// Tri-state view of a `<component>_enabled` key in a project record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Enabled,
    Disabled,
    Absent,
}

impl Flag {
    pub fn of(record: &Value, key: &str) -> Self {
        match record.get(key) {
            None => Flag::Absent,
            Some(Value::Bool(true)) => Flag::Enabled,
            Some(_) => Flag::Disabled,
        }
    }
}

/// One project travelling through the backup or job-expiry queue.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: u64,
    pub namespace: String,
    pub namespace_id: Option<u64>,
    pub name: String,
    pub flags: BTreeMap<Component, Flag>,
    pub retries_remaining: u32,
    pub raw: Value,
}

impl WorkItem {
    pub fn from_record(raw: Value, retries: u32) -> Result<Self> {
        let id = id_of(&raw, "id")
            .ok_or_else(|| Error::malformed("projects", "project record without an id"))?;
        let name = raw
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::malformed(format!("projects/{id}"), "project has no name"))?
            .to_string();
        let ns = raw.get("namespace").unwrap_or(&Value::Null);
        let namespace = ns
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::malformed(format!("projects/{id}"), "project has no namespace"))?
            .to_string();
        let namespace_id = id_of(ns, "id");
        let flags = Component::ALL
            .into_iter()
            .map(|c| (c, Flag::of(&raw, &c.flag_key())))
            .collect();
        Ok(Self {
            id,
            namespace,
            namespace_id,
            name,
            flags,
            retries_remaining: retries,
            raw,
        })
    }

    pub fn flag(&self, component: Component) -> Flag {
        self.flags
            .get(&component)
            .copied()
            .unwrap_or(Flag::Absent)
    }

    /// Issues and snippets need an explicit opt-in; milestones follow issues
    /// and merge requests; everything else is backed up unless switched off.
    pub fn should_backup(&self, component: Component) -> bool {
        match component {
            Component::Issues | Component::Snippets => self.flag(component) == Flag::Enabled,
            Component::Milestones => {
                self.flag(Component::Issues) == Flag::Enabled
                    || self.flag(Component::MergeRequests) == Flag::Enabled
            }
            other => self.flag(other) != Flag::Disabled,
        }
    }

    /// `<id>_<namespace>_<name>`, safe to use as a single path component.
    pub fn dir_name(&self) -> String {
        format!("{}_{}_{}", self.id, self.namespace, self.name).replace(['/', '\\'], "_")
    }

    pub fn clone_url(&self) -> Option<&str> {
        self.raw.get("http_url_to_repo").and_then(Value::as_str)
    }
}

impl Task for WorkItem {
    fn label(&self) -> String {
        self.dir_name()
    }

    fn spend_retry(&mut self) -> Option<u32> {
        self.retries_remaining = self.retries_remaining.saturating_sub(1);
        (self.retries_remaining > 0).then_some(self.retries_remaining)
    }
}
