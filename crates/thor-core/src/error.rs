use std::path::PathBuf;
use thiserror::Error;

/// Failures of the persistence layer itself. These are the only errors the
/// store hands back to callers; job-level failures never surface here.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid job status: {0}")]
    InvalidStatus(String),

    #[error("failed to read job store {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to lock job store {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write job store {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode job store: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("job store lock poisoned")]
    LockPoisoned,
}

/// Raised while turning a job type and its parameters into a command line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unsupported job type: {0}")]
    UnsupportedJobType(String),

    #[error("{job_type}: missing required parameter(s): {}", fields.join(", "))]
    MissingParams {
        job_type: String,
        fields: Vec<String>,
    },

    #[error("{job_type}: invalid parameter '{field}': {reason}")]
    InvalidParam {
        job_type: String,
        field: String,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum PremisError {
    #[error("failed to write PREMIS log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode PREMIS event: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode config: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to load .env file: {0}")]
    Env(#[from] dotenvy::Error),
}

/// Unexpected failures while processing a claimed job. The worker turns these
/// into a job `error`; they never stop the loop.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
