//! Runtime error definitions.

use std::io;

use thiserror::Error;

/// Errors surfaced by fallible construction paths of the runtime.
///
/// Steady-state scheduler operations report failure through their
/// boolean results and the log instead; see the scheduler module.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to read config file {path}: {source}")]
    ConfigIo {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid cpuset item `{0}`")]
    InvalidCpuset(String),

    #[error("routine stack allocation failed: {0}")]
    StackAlloc(io::Error),

    #[error("failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: io::Error,
    },
}
