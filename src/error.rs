use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum InjectError {
    #[error("usage: {0}")]
    Usage(String),

    /// An external tool invocation failed to start or exited non-zero.
    /// `tool` is the role name callers report, e.g. "groot create".
    #[error("{tool} failed: {message}")]
    ExternalTool { tool: String, message: String },

    #[error("{context}: {source}")]
    Filesystem {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("parse runtime configuration: {0}")]
    Document(#[source] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, InjectError>;
