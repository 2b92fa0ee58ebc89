use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Post,
    Put,
    Delete,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Delete => "DELETE",
        }
    }
}

/// `IgnoreErrors` turns application-level failures (`{"message": ...}`,
/// 403/404) into an empty result. Used for membership lookups where those are
/// expected. Transport failures and 401 are still raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    #[default]
    Strict,
    IgnoreErrors,
}

/// Everything the backup, restore and job-expiry flows need from the platform.
/// Paths are relative to the API base (see `api::endpoints`).
pub trait MetadataSource: Send + Sync {
    fn fetch_page(&self, path: &str, per_page: u32, page: u32, mode: FetchMode)
    -> Result<Vec<Value>>;

    /// `Ok(None)` when the entity does not exist.
    fn fetch_one(&self, path: &str) -> Result<Option<Value>>;

    /// Raw response body, for endpoints that do not return JSON.
    fn fetch_raw(&self, path: &str) -> Result<String>;

    /// `Delete` returns `Value::Null`.
    fn mutate(&self, path: &str, payload: &Value, verb: Verb) -> Result<Value>;
}

pub type PageFilter<'a> = Box<dyn Fn(&Value) -> bool + 'a>;

/// Lazy walk over every page of a collection. Stops at the first empty page;
/// each page is filtered on its own, so a page where nothing matches does not
/// end the walk.
pub struct Pages<'a> {
    source: &'a dyn MetadataSource,
    path: &'a str,
    per_page: u32,
    page: u32,
    mode: FetchMode,
    filter: Option<PageFilter<'a>>,
    buffered: std::vec::IntoIter<Value>,
    done: bool,
}

impl<'a> Pages<'a> {
    pub fn new(source: &'a dyn MetadataSource, path: &'a str, per_page: u32) -> Self {
        Self {
            source,
            path,
            per_page,
            page: 1,
            mode: FetchMode::Strict,
            filter: None,
            buffered: Vec::new().into_iter(),
            done: false,
        }
    }

    pub fn filtered(mut self, f: impl Fn(&Value) -> bool + 'a) -> Self {
        self.filter = Some(Box::new(f));
        self
    }

    pub fn mode(mut self, mode: FetchMode) -> Self {
        self.mode = mode;
        self
    }
}

impl Iterator for Pages<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(v) = self.buffered.next() {
                return Some(Ok(v));
            }
            if self.done {
                return None;
            }
            let page = match self
                .source
                .fetch_page(self.path, self.per_page, self.page, self.mode)
            {
                Ok(p) => p,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            if page.is_empty() {
                self.done = true;
                return None;
            }
            self.page += 1;
            let kept: Vec<Value> = match &self.filter {
                Some(f) => page.into_iter().filter(|v| f(v)).collect(),
                None => page,
            };
            self.buffered = kept.into_iter();
        }
    }
}

pub fn fetch_all(source: &dyn MetadataSource, path: &str, per_page: u32) -> Result<Vec<Value>> {
    Pages::new(source, path, per_page).collect()
}

pub fn fetch_all_lenient(
    source: &dyn MetadataSource,
    path: &str,
    per_page: u32,
) -> Result<Vec<Value>> {
    Pages::new(source, path, per_page)
        .mode(FetchMode::IgnoreErrors)
        .collect()
}

/// Integer id of a record, accepting numeric strings.
pub fn id_of(record: &Value, field: &str) -> Option<u64> {
    match record.get(field)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Id/iid rendered for use in a path or file name.
pub fn key_of(record: &Value, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

pub fn require_id(record: &Value, field: &str, what: &str) -> Result<u64> {
    id_of(record, field)
        .ok_or_else(|| Error::malformed(what, format!("record has no usable '{field}' field")))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    struct Paged {
        pages: Vec<Vec<Value>>,
        calls: Mutex<Vec<u32>>,
    }

    impl MetadataSource for Paged {
        fn fetch_page(&self, _: &str, _: u32, page: u32, _: FetchMode) -> Result<Vec<Value>> {
            self.calls.lock().expect("lock").push(page);
            Ok(self
                .pages
                .get(page as usize - 1)
                .cloned()
                .unwrap_or_default())
        }
        fn fetch_one(&self, _: &str) -> Result<Option<Value>> {
            Ok(None)
        }
        fn fetch_raw(&self, _: &str) -> Result<String> {
            Ok(String::new())
        }
        fn mutate(&self, _: &str, _: &Value, _: Verb) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn filter_rejecting_a_whole_page_keeps_paging() {
        let src = Paged {
            pages: vec![
                vec![json!({"id": 1}), json!({"id": 2})],
                vec![json!({"id": 3})],
                vec![json!({"id": 4})],
            ],
            calls: Mutex::new(Vec::new()),
        };
        let got: Vec<u64> = Pages::new(&src, "projects", 2)
            .filtered(|v| id_of(v, "id") != Some(3))
            .map(|r| id_of(&r.expect("page"), "id").expect("id"))
            .collect();
        assert_eq!(got, vec![1, 2, 4]);
        assert_eq!(*src.calls.lock().expect("lock"), vec![1, 2, 3, 4]);
    }

    #[test]
    fn ids_accept_numeric_strings() {
        let v = json!({"id": "17", "iid": 3, "bad": true});
        assert_eq!(id_of(&v, "id"), Some(17));
        assert_eq!(key_of(&v, "iid").as_deref(), Some("3"));
        assert_eq!(id_of(&v, "bad"), None);
        assert!(require_id(&v, "missing", "projects/1").is_err());
    }
}
