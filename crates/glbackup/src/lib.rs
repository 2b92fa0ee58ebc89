pub mod api;
pub mod archive;
pub mod backup;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod git;
pub mod jobs;
pub mod logging;
pub mod process;
pub mod project;
pub mod restore;
pub mod util;

pub use error::{Error, Result};
