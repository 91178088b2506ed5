use std::path::{Path, PathBuf};

use reqwest::StatusCode;

/// Result type used throughout the capture engine.
pub type Result<T> = std::result::Result<T, CaptureError>;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("I/O error while {op} `{}`: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request to {url} returned HTTP {status}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("request to {url} returned an empty body")]
    EmptyBody { url: String },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("gave up on {url} after {attempts} attempts: {source}")]
    SourceExhausted {
        url: String,
        attempts: u32,
        #[source]
        source: Box<CaptureError>,
    },

    #[error("`{name}` is not a day-bucket name: {source}")]
    InvalidBucket {
        name: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("failed to launch merger `{program}`: {source}")]
    MergerSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("merge into `{}` failed ({status}): {stderr}", output.display())]
    MergeFailed {
        output: PathBuf,
        status: String,
        stderr: String,
    },

    #[error("segment {segment} cannot move from {from} to {to}")]
    InvalidTransition {
        segment: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("background task `{name}` failed: {reason}")]
    Task { name: &'static str, reason: String },
}

impl CaptureError {
    pub fn io(op: &'static str, path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_names_operation_and_path() {
        let err = CaptureError::io(
            "creating day bucket",
            "/srv/cam/2024-01-01",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        let msg = err.to_string();
        assert!(msg.contains("creating day bucket"));
        assert!(msg.contains("/srv/cam/2024-01-01"));
    }

    #[test]
    fn exhausted_source_reports_attempts() {
        let err = CaptureError::SourceExhausted {
            url: "http://cam/video".into(),
            attempts: 3,
            source: Box::new(CaptureError::EmptyBody {
                url: "http://cam/video".into(),
            }),
        };
        assert!(err.to_string().contains("3 attempts"));
    }
}
