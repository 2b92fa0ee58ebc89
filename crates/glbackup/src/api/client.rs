use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde_json::Value;
use tracing::debug;

use crate::api::source::{FetchMode, MetadataSource, Verb};
use crate::config::Config;
use crate::error::{Error, Result};

const TOKEN_HEADER: &str = "PRIVATE-TOKEN";

/// Blocking REST client authenticated with a single private token.
pub struct HttpClient {
    base: String,
    token: String,
    http: Client,
}

impl HttpClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("glbackup/", env!("CARGO_PKG_VERSION")))
            .timeout(cfg.api_timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base: cfg.api_base(),
            token: cfg.token.clone(),
            http,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    fn send(&self, req: RequestBuilder, url: &str, method: &str) -> Result<Response> {
        debug!(method, url, "request");
        let res = req
            .header(TOKEN_HEADER, &self.token)
            .send()
            .map_err(|e| Error::web(url, method, format!("request failed: {e}")))?;
        debug!(method, url, status = %res.status(), "response");
        if res.status() == StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthorized {
                url: url.to_string(),
            });
        }
        Ok(res)
    }

    fn read_body(&self, res: Response, url: &str, method: &str) -> Result<(StatusCode, String)> {
        let status = res.status();
        let body = res
            .text()
            .map_err(|e| Error::web(url, method, format!("failed to read body: {e}")))?;
        Ok((status, body))
    }

    fn read_json(&self, res: Response, url: &str, method: &str) -> Result<(StatusCode, Value)> {
        let (status, body) = self.read_body(res, url, method)?;
        Ok((status, parse_json(status, &body, url, method)?))
    }
}

fn parse_json(status: StatusCode, body: &str, url: &str, method: &str) -> Result<Value> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str::<Value>(body).map_err(|_| {
        if status.is_success() {
            Error::web(url, method, format!("response is not JSON: {}", truncate(body)))
        } else {
            Error::web(url, method, format!("HTTP {status}: {}", truncate(body)))
        }
    })
}

impl MetadataSource for HttpClient {
    fn fetch_page(
        &self,
        path: &str,
        per_page: u32,
        page: u32,
        mode: FetchMode,
    ) -> Result<Vec<Value>> {
        let sep = if path.contains('?') { '&' } else { '?' };
        let url = self.url(&format!("{path}{sep}per_page={per_page}&page={page}"));
        let res = self.send(self.http.get(&url), &url, "GET")?;
        // A body that cannot be read is a transport fault, never ignored.
        let (status, raw) = self.read_body(res, &url, "GET")?;
        let body = match parse_json(status, &raw, &url, "GET") {
            Ok(v) => v,
            Err(_) if mode == FetchMode::IgnoreErrors && !status.is_success() => {
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        if let Some(msg) = api_error_message(&body).or_else(|| status_error(status)) {
            return match mode {
                FetchMode::IgnoreErrors => Ok(Vec::new()),
                FetchMode::Strict => Err(Error::web(url, "GET", msg)),
            };
        }
        match body {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            // A single object would be served again for every page number.
            _ => Err(Error::web(url, "GET", "expected a JSON array for a collection")),
        }
    }

    fn fetch_one(&self, path: &str) -> Result<Option<Value>> {
        let url = self.url(path);
        let res = self.send(self.http.get(&url), &url, "GET")?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let (status, body) = self.read_json(res, &url, "GET")?;
        if let Some(msg) = api_error_message(&body).or_else(|| status_error(status)) {
            return Err(Error::web(url, "GET", msg));
        }
        Ok(match body {
            Value::Null => None,
            v => Some(v),
        })
    }

    fn fetch_raw(&self, path: &str) -> Result<String> {
        let url = self.url(path);
        let res = self.send(self.http.get(&url), &url, "GET")?;
        let status = res.status();
        let body = res
            .text()
            .map_err(|e| Error::web(&url, "GET", format!("failed to read body: {e}")))?;
        if !status.is_success() {
            return Err(Error::web(
                url,
                "GET",
                format!("HTTP {status}: {}", truncate(&body)),
            ));
        }
        Ok(body)
    }

    fn mutate(&self, path: &str, payload: &Value, verb: Verb) -> Result<Value> {
        let url = self.url(path);
        let method = verb.as_str();
        let req = match verb {
            Verb::Post => self.http.post(&url).json(payload),
            Verb::Put => self.http.put(&url).json(payload),
            Verb::Delete => self.http.delete(&url),
        };
        let res = self.send(req, &url, method).map_err(|e| attach_payload(e, payload))?;
        let (status, body) = self
            .read_json(res, &url, method)
            .map_err(|e| attach_payload(e, payload))?;
        if let Some(msg) = api_error_message(&body).or_else(|| status_error(status)) {
            return Err(attach_payload(Error::web(url, method, msg), payload));
        }
        if verb == Verb::Delete {
            return Ok(Value::Null);
        }
        Ok(body)
    }
}

// `{"message": ...}` / `{"error": ...}` bodies are failures regardless of status.
fn api_error_message(body: &Value) -> Option<String> {
    let obj = body.as_object()?;
    let v = obj.get("message").or_else(|| obj.get("error"))?;
    Some(match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn status_error(status: StatusCode) -> Option<String> {
    (!status.is_success()).then(|| format!("HTTP {status}"))
}

fn attach_payload(err: Error, payload: &Value) -> Error {
    match err {
        Error::Web {
            url,
            method,
            message,
            ..
        } => Error::Web {
            url,
            method,
            payload: Some(payload.to_string()),
            message,
        },
        other => other,
    }
}

fn truncate(body: &str) -> String {
    const MAX: usize = 512;
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
