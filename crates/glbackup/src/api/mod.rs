pub mod client;
pub mod endpoints;
pub mod source;

pub use client::HttpClient;
pub use endpoints::{Capability, Component};
pub use source::{FetchMode, MetadataSource, Pages, Verb};
