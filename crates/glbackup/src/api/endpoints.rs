//! Resource paths, relative to the API base, and the per-component
//! capability table used by both backup and restore.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Component {
    RequestAccess,
    Boards,
    Issues,
    Labels,
    Members,
    Milestones,
    MergeRequests,
    Snippets,
}

/// What the platform lets us do with one component.
#[derive(Debug, Clone, Copy)]
pub struct Capability {
    /// Collection segment under `projects/:id/`.
    pub collection: &'static str,
    /// Entries carry notes at `<collection>/:key/notes`.
    pub has_notes: bool,
    /// Entries have an open/closed state that can be set through an edit.
    pub closable: bool,
    /// Field addressing a single entry inside the project.
    pub id_field: &'static str,
    /// Singular prefix of attachment dump files (`issue_12_notes.dump`).
    pub file_kind: &'static str,
    /// An administrator can replay these entries into a project.
    pub restorable: bool,
}

impl Component {
    pub const ALL: [Component; 8] = [
        Component::RequestAccess,
        Component::Boards,
        Component::Issues,
        Component::Labels,
        Component::Members,
        Component::Milestones,
        Component::MergeRequests,
        Component::Snippets,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Component::RequestAccess => "request_access",
            Component::Boards => "boards",
            Component::Issues => "issues",
            Component::Labels => "labels",
            Component::Members => "members",
            Component::Milestones => "milestones",
            Component::MergeRequests => "merge_requests",
            Component::Snippets => "snippets",
        }
    }

    pub fn capability(self) -> Capability {
        let base = Capability {
            collection: self.name(),
            has_notes: false,
            closable: false,
            id_field: "id",
            file_kind: self.name(),
            restorable: true,
        };
        match self {
            Component::RequestAccess => Capability {
                collection: "access_requests",
                restorable: false,
                ..base
            },
            Component::Boards => Capability {
                file_kind: "board",
                ..base
            },
            Component::Labels => Capability {
                file_kind: "label",
                ..base
            },
            Component::Members => Capability {
                file_kind: "member",
                ..base
            },
            Component::Milestones => Capability {
                closable: true,
                file_kind: "milestone",
                ..base
            },
            Component::Issues => Capability {
                has_notes: true,
                closable: true,
                id_field: "iid",
                file_kind: "issue",
                ..base
            },
            Component::MergeRequests => Capability {
                has_notes: true,
                closable: true,
                id_field: "iid",
                file_kind: "merge_request",
                ..base
            },
            Component::Snippets => Capability {
                has_notes: true,
                file_kind: "snippet",
                ..base
            },
        }
    }

    /// Key of the on/off switch in a project record, when one exists.
    pub fn flag_key(self) -> String {
        format!("{}_enabled", self.name())
    }

    pub fn dump_file(self) -> String {
        format!("{}.json", self.name())
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Component {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Component::ALL
            .into_iter()
            .find(|c| c.name() == s.trim())
            .ok_or_else(|| {
                let known: Vec<&str> = Component::ALL.iter().map(|c| c.name()).collect();
                format!("unknown component '{s}' (known: {})", known.join(", "))
            })
    }
}

/// Percent-encode a path segment (`group/project` -> `group%2Fproject`).
pub fn encode_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

pub fn projects() -> String {
    "projects".into()
}

pub fn project(id_or_path: &str) -> String {
    format!("projects/{}", encode_segment(id_or_path))
}

pub fn project_members(project_id: u64) -> String {
    format!("projects/{project_id}/members")
}

pub fn group_members(group_id: u64) -> String {
    format!("groups/{group_id}/members")
}

pub fn component_collection(project_id: u64, component: Component) -> String {
    format!("projects/{project_id}/{}", component.capability().collection)
}

pub fn component_entry(project_id: u64, component: Component, key: &str) -> String {
    format!(
        "{}/{}",
        component_collection(project_id, component),
        encode_segment(key)
    )
}

pub fn notes(project_id: u64, component: Component, key: &str) -> String {
    format!("{}/notes", component_entry(project_id, component, key))
}

pub fn issue_merge_requests(project_id: u64, issue_iid: &str) -> String {
    format!(
        "{}/related_merge_requests",
        component_entry(project_id, Component::Issues, issue_iid)
    )
}

pub fn snippet_raw(project_id: u64, snippet_id: &str) -> String {
    format!(
        "{}/raw",
        component_entry(project_id, Component::Snippets, snippet_id)
    )
}

pub fn users_by_username(username: &str) -> String {
    format!("users?username={}", encode_segment(username))
}

pub fn user_keys(user_id: u64) -> String {
    format!("users/{user_id}/keys")
}

pub fn user_emails(user_id: u64) -> String {
    format!("users/{user_id}/emails")
}

pub fn project_jobs(project_id: u64) -> String {
    format!("projects/{project_id}/jobs")
}

pub fn erase_job(project_id: u64, job_id: u64) -> String {
    format!("projects/{project_id}/jobs/{job_id}/erase")
}
