use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;

/// Free-form job parameters as sent by the GUI panels.
pub type Params = Map<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Error,
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        Self::Pending,
        Self::Running,
        Self::Done,
        Self::Error,
        Self::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Canceled)
    }

    pub fn icon(&self) -> &str {
        match self {
            Self::Pending => "⏳",
            Self::Running => "⚡",
            Self::Done => "✅",
            Self::Error => "❌",
            Self::Canceled => "🚫",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| StoreError::InvalidStatus(s.to_string()))
    }
}

/// Job types the resolver knows how to run. Records keep the raw type string,
/// so anything can be enqueued and unknown types only fail at execution time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    HashManifest,
    VerifyFixity,
    BuildBag,
    BuildSip,
    FormatIdentify,
    Replicate,
    PremisEvent,
    DuplicateFinder,
}

impl JobType {
    pub fn all() -> [JobType; 8] {
        [
            Self::HashManifest,
            Self::VerifyFixity,
            Self::BuildBag,
            Self::BuildSip,
            Self::FormatIdentify,
            Self::Replicate,
            Self::PremisEvent,
            Self::DuplicateFinder,
        ]
    }

    /// Wire name, as stored in job records.
    pub fn id(&self) -> &'static str {
        match self {
            Self::HashManifest => "HASH_MANIFEST",
            Self::VerifyFixity => "VERIFY_FIXITY",
            Self::BuildBag => "BUILD_BAG",
            Self::BuildSip => "BUILD_SIP",
            Self::FormatIdentify => "FORMAT_IDENTIFY",
            Self::Replicate => "REPLICATE",
            Self::PremisEvent => "PREMIS_EVENT",
            Self::DuplicateFinder => "DUPLICATE_FINDER",
        }
    }

    /// Script file executed for this job type, relative to the scripts directory.
    pub fn script(&self) -> &'static str {
        match self {
            Self::HashManifest => "hash_files.py",
            Self::VerifyFixity => "verify_fixity.py",
            Self::BuildBag => "build_bag.py",
            Self::BuildSip => "build_sip.py",
            Self::FormatIdentify => "format_identify.py",
            Self::Replicate => "replicate_storage.py",
            Self::PremisEvent => "premis_log.py",
            Self::DuplicateFinder => "duplicate_finder.py",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::all().into_iter().find(|t| t.id() == s)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    #[serde(alias = "_id")]
    pub id: String,
    pub job_type: String,
    pub status: JobStatus,
    #[serde(default)]
    pub params: Params,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub error_msg: Option<String>,
}

impl JobRecord {
    pub fn new(id: String, job_type: String, params: Params, now: DateTime<Utc>) -> Self {
        Self {
            id,
            job_type,
            status: JobStatus::Pending,
            params,
            created_at: now,
            updated_at: now,
            error_msg: None,
        }
    }

    pub fn kind(&self) -> Option<JobType> {
        JobType::parse(&self.job_type)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    #[default]
    Info,
    Warn,
    Error,
    Debug,
}

impl LogLevel {
    /// Never fails: unknown levels become `INFO`.
    pub fn parse_lossy(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "WARN" | "WARNING" => Self::Warn,
            "ERROR" => Self::Error,
            "DEBUG" => Self::Debug,
            _ => Self::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Debug => "DEBUG",
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        Self::parse_lossy(s)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub msg: String,
}
