use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DoppelError {
    /// For embedders that treat a stopped engine as an error; the engine's
    /// own pipeline degrades to no reply instead.
    #[error("engine is not running")]
    NotRunning,

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("no generator bound to the engine")]
    NoGenerator,

    #[error("transport '{name}' failed: {message}")]
    Transport { name: String, message: String },

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("generator is unavailable")]
    Unavailable,

    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("generator returned an empty response")]
    EmptyResponse,

    #[error("config error: {0}")]
    Config(String),
}

impl DoppelError {
    pub fn transport(name: impl Into<String>, message: impl ToString) -> Self {
        Self::Transport {
            name: name.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DoppelError>;
