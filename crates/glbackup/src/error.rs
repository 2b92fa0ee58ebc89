use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("error archiving {src} to {dest}: {message}")]
    Archive {
        src: PathBuf,
        dest: PathBuf,
        message: String,
    },

    #[error("error cloning {repository}: {message}")]
    Clone { repository: String, message: String },

    #[error("error processing URL {url} with method {method}: {message}")]
    Web {
        url: String,
        method: String,
        payload: Option<String>,
        message: String,
    },

    #[error("error reading {}: {message}", path.display())]
    Read { path: PathBuf, message: String },

    #[error("error parsing {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("request to {url} unauthorized")]
    Unauthorized { url: String },

    #[error("{0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn archive(src: &Path, dest: &Path, message: impl Into<String>) -> Self {
        Self::Archive {
            src: src.to_path_buf(),
            dest: dest.to_path_buf(),
            message: message.into(),
        }
    }

    pub fn clone_failed(repository: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Clone {
            repository: repository.into(),
            message: message.into(),
        }
    }

    pub fn web(url: impl Into<String>, method: &str, message: impl Into<String>) -> Self {
        Self::Web {
            url: url.into(),
            method: method.to_string(),
            payload: None,
            message: message.into(),
        }
    }

    pub fn read(path: &Path, message: impl Into<String>) -> Self {
        Self::Read {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }

    pub fn parse(path: &Path, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }

    /// An API record that lacks a field we need; `resource` names where it
    /// came from.
    pub fn malformed(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            path: PathBuf::from(resource.into()),
            message: message.into(),
        }
    }

    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Faults that unwind to the per-item retry boundary and earn another
    /// attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Archive { .. }
                | Self::Clone { .. }
                | Self::Web { .. }
                | Self::Read { .. }
                | Self::Parse { .. }
                | Self::Io { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
