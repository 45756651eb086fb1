//! Error taxonomy shared by the supervisor, the stream client and the shell.

use std::time::Duration;

use crate::status::ServiceState;

/// Failures of the supervised backend process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("No free port between {first} and {last}")]
    NoPortAvailable { first: u16, last: u16 },

    #[error("Service failed to start: {0}")]
    StartFailed(String),

    #[error("Service exited unexpectedly (code {code:?})")]
    Crashed { code: Option<i32> },

    #[error("Service is already {0}")]
    AlreadyRunning(ServiceState),

    #[error("Service was stopped")]
    Stopped,
}

/// Failures local to one streamed chat turn.
///
/// None of these poison the session: the partial assistant message is rolled
/// back and the user can submit again.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("Malformed stream record: {0}")]
    Decode(String),

    #[error("Connection lost: {0}")]
    Transport(String),

    #[error("{0}")]
    Turn(String),

    #[error("No data received for {0:?}")]
    Idle(Duration),
}

impl StreamError {
    /// Text shown in the dismissible notification for this failure.
    pub fn user_message(&self) -> String {
        match self {
            StreamError::Turn(msg) => msg.clone(),
            StreamError::Decode(_) => {
                "The service sent a response I couldn't read, so it was discarded.".to_string()
            }
            StreamError::Transport(_) => {
                "Lost the connection to the service while it was answering.".to_string()
            }
            StreamError::Idle(after) => format!(
                "The service stopped responding (nothing received for {}s).",
                after.as_secs()
            ),
        }
    }
}

/// Failures of the request/response document operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Service returned {status}: {detail}")]
    Status { status: u16, detail: String },

    #[error("Invalid response: {0}")]
    Decode(String),

    #[error("Could not read {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
