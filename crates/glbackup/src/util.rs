use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde_json::Value;

use crate::error::{Error, Result};

/// Write through a temp file in the same directory, then rename, so a crash
/// never leaves a half-written dump behind.
pub fn atomic_write_text(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::config(format!("invalid dump path {}", path.display())))?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    fs::write(&tmp, body).map_err(|e| Error::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::io(path, e)
    })
}

pub fn write_json_pretty(path: &Path, v: &Value) -> Result<()> {
    let s = serde_json::to_string_pretty(v)
        .map_err(|e| Error::parse(path, format!("json encode error: {e}")))?;
    atomic_write_text(path, &s)
}

pub fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| Error::read(path, e.to_string()))
}

/// `Ok(None)` when the file does not exist.
pub fn read_text_opt(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::read(path, e.to_string())),
    }
}

pub fn read_json(path: &Path) -> Result<Value> {
    let raw = read_text(path)?;
    serde_json::from_str(&raw).map_err(|e| Error::parse(path, e.to_string()))
}

/// `Ok(None)` when the file does not exist.
pub fn read_json_opt(path: &Path) -> Result<Option<Value>> {
    match read_text_opt(path)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| Error::parse(path, e.to_string())),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn dump_is_pretty_and_overwritten() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("nested/labels.json");
        write_json_pretty(&p, &json!([{"id": 1}])).expect("write");
        write_json_pretty(&p, &json!([{"id": 2}])).expect("rewrite");
        let body = fs::read_to_string(&p).expect("read");
        assert!(body.contains('\n'));
        assert_eq!(read_json(&p).expect("json"), json!([{"id": 2}]));
        let leftovers = fs::read_dir(p.parent().expect("parent"))
            .expect("ls")
            .count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn read_errors_are_typed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let missing = tmp.path().join("missing.json");
        assert!(matches!(read_json(&missing), Err(Error::Read { .. })));
        assert!(read_json_opt(&missing).expect("opt").is_none());

        let bad = tmp.path().join("bad.json");
        fs::write(&bad, "{not json").expect("write");
        assert!(matches!(read_json(&bad), Err(Error::Parse { .. })));
    }
}
