use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SoundscanError {
    #[error("invalid observation id or url: {0}")]
    InvalidObservationRef(String),

    #[error("invalid coordinates: {0}")]
    InvalidCoordinates(String),

    #[error("invalid unix timestamp: {0}")]
    InvalidTimestamp(i64),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("observation API request failed: {0}")]
    UpstreamUnavailable(String),

    #[error("observation API returned status {status}: {message}")]
    UpstreamStatus { status: u16, message: String },

    #[error("malformed observation response: {0}")]
    MalformedResponse(String),

    #[error("observation {0} has no sound recordings")]
    NoAssetsFound(String),

    #[error("download of {url} failed: {cause}")]
    DownloadFailed { url: String, cause: String },

    #[error("unsupported audio format '{format}' for {path}")]
    UnsupportedFormat { format: String, path: PathBuf },

    #[error("audio codec error for {path}: {reason}")]
    CodecError { path: PathBuf, reason: String },

    #[error("classification of {recording} failed: {cause}")]
    ClassificationFailed { recording: String, cause: String },

    #[error("pipeline run timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u128 },

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
