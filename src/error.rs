// Error taxonomy for the prediction pipeline and process configuration

use std::error::Error as StdError;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("prediction request for route {route:?} failed")]
    UpstreamRequestFailure {
        route: String,
        #[source]
        source: UpstreamError,
    },

    #[error("no prediction data returned for route {route:?}")]
    MissingPredictionData { route: String },

    #[error("malformed prediction response for route {route:?}: {reason}")]
    MalformedResponse { route: String, reason: String },

    #[error("invalid route configuration: {reason}")]
    InvalidRoute { reason: String },
}

/// Failure talking to the upstream prediction API.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("HTTP transport error")]
    Transport(#[from] reqwest::Error),

    #[error("API returned status {status}")]
    Status { status: u16 },

    #[error("invalid JSON body")]
    Decode(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ScheduleError>;

/// Renders the `source()` chain below `err`, one cause per line.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut lines = Vec::new();
    let mut current = err.source();
    while let Some(cause) = current {
        lines.push(format!("caused by: {}", cause));
        current = cause.source();
    }
    lines.join("\n")
}
