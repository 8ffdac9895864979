//! Append-only PREMIS event log (one JSON object per line).

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::PremisError;
use crate::job::{JobType, Params};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventOutcome {
    Success,
    Failure,
    /// Anything else found in the log, e.g. `warning` from manual events.
    Other(String),
}

impl EventOutcome {
    pub fn from_success(ok: bool) -> Self {
        if ok { Self::Success } else { Self::Failure }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for EventOutcome {
    fn from(s: String) -> Self {
        match s.as_str() {
            "success" => Self::Success,
            "failure" => Self::Failure,
            _ => Self::Other(s),
        }
    }
}

impl From<EventOutcome> for String {
    fn from(outcome: EventOutcome) -> Self {
        outcome.as_str().to_string()
    }
}

impl fmt::Display for EventOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PremisEvent {
    #[serde(default)]
    pub event_identifier: String,
    pub event_type: String,
    pub event_date_time: String,
    #[serde(default)]
    pub event_detail: String,
    pub event_outcome: EventOutcome,
    #[serde(default)]
    pub linking_object_identifier: String,
    #[serde(default)]
    pub linking_agent_name: String,
}

impl PremisEvent {
    /// Event describing the execution of a job.
    pub fn for_job(
        job_type: &str,
        params: &Params,
        outcome: EventOutcome,
        detail: impl Into<String>,
        agent: &str,
    ) -> Self {
        Self {
            event_identifier: Uuid::new_v4().to_string(),
            event_type: event_type_for_job(job_type),
            event_date_time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            event_detail: detail.into(),
            event_outcome: outcome,
            linking_object_identifier: object_id_for_job(job_type, params),
            linking_agent_name: agent.to_string(),
        }
    }
}

pub fn event_type_for_job(job_type: &str) -> String {
    let mapped = match JobType::parse(job_type) {
        Some(JobType::HashManifest) => "message digest calculation",
        Some(JobType::VerifyFixity) => "fixity check",
        Some(JobType::BuildBag) => "packaging",
        Some(JobType::BuildSip) => "ingestion preparation",
        Some(JobType::FormatIdentify) => "format identification",
        Some(JobType::Replicate) => "replication",
        _ => return job_type.to_lowercase(),
    };
    mapped.to_string()
}

/// Candidate parameter keys holding the object an event links to, in order.
fn object_id_keys(job_type: JobType) -> &'static [&'static str] {
    match job_type {
        JobType::HashManifest | JobType::FormatIdentify => &["raiz"],
        JobType::VerifyFixity => &["manifesto"],
        JobType::BuildBag => &["bag_name", "dst", "destino"],
        JobType::BuildSip => &["sip_id", "saida"],
        JobType::Replicate => &["fonte"],
        JobType::PremisEvent => &["obj_id"],
        JobType::DuplicateFinder => &["raiz", "inventario"],
    }
}

pub fn object_id_for_job(job_type: &str, params: &Params) -> String {
    let Some(kind) = JobType::parse(job_type) else {
        return String::new();
    };
    object_id_keys(kind)
        .iter()
        .filter_map(|key| match params.get(*key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .next()
        .unwrap_or_default()
}

/// Writer for the PREMIS JSONL file. Appends from this process are
/// serialized so lines never interleave.
pub struct PremisLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PremisLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: &PremisEvent) -> Result<(), PremisError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let io_err = |source| PremisError::Io {
            path: self.path.clone(),
            source,
        };

        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).map_err(io_err)?;
        Ok(())
    }
}

/// Reads up to `limit` events from a JSONL file, skipping lines that are
/// blank or not valid events. A missing file reads as empty.
pub fn read_events(path: &Path, limit: Option<usize>) -> Result<Vec<PremisEvent>, PremisError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(PremisError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let mut events = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        if limit.is_some_and(|max| events.len() >= max) {
            break;
        }
        let line = line.map_err(|source| PremisError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<PremisEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => log::debug!("Skipping line {} of {}: {e}", n + 1, path.display()),
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn event_types_follow_premis_vocabulary() {
        assert_eq!(event_type_for_job("HASH_MANIFEST"), "message digest calculation");
        assert_eq!(event_type_for_job("VERIFY_FIXITY"), "fixity check");
        assert_eq!(event_type_for_job("REPLICATE"), "replication");
        assert_eq!(event_type_for_job("DUPLICATE_FINDER"), "duplicate_finder");
        assert_eq!(event_type_for_job("Custom_Job"), "custom_job");
    }

    #[test]
    fn object_id_takes_first_non_empty_candidate() {
        let p = params(json!({"bag_name": "", "dst": "/bags/b1", "destino": "/old"}));
        assert_eq!(object_id_for_job("BUILD_BAG", &p), "/bags/b1");

        let p = params(json!({"sip_id": "SIP-7", "saida": "/out"}));
        assert_eq!(object_id_for_job("BUILD_SIP", &p), "SIP-7");

        assert_eq!(object_id_for_job("VERIFY_FIXITY", &Params::new()), "");
        assert_eq!(object_id_for_job("BOGUS_TYPE", &p), "");
    }

    #[test]
    fn event_serializes_with_premis_keys() {
        let event = PremisEvent::for_job(
            "FORMAT_IDENTIFY",
            &params(json!({"raiz": "/data"})),
            EventOutcome::Failure,
            "Exit code 2",
            "Agente",
        );
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["eventType"], "format identification");
        assert_eq!(value["eventOutcome"], "failure");
        assert_eq!(value["eventDetail"], "Exit code 2");
        assert_eq!(value["linkingObjectIdentifier"], "/data");
        assert_eq!(value["linkingAgentName"], "Agente");
        assert!(Uuid::parse_str(value["eventIdentifier"].as_str().unwrap()).is_ok());
        assert!(value["eventDateTime"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn append_creates_directories_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = PremisLog::new(dir.path().join("logs").join("premis_events.jsonl"));

        for detail in ["Exit code 0", "Exit code 1"] {
            let event = PremisEvent::for_job(
                "HASH_MANIFEST",
                &Params::new(),
                EventOutcome::Success,
                detail,
                "a",
            );
            log.append(&event).unwrap();
        }

        let events = read_events(log.path(), None).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_detail, "Exit code 1");
        assert_eq!(read_events(log.path(), Some(1)).unwrap().len(), 1);
    }

    #[test]
    fn reader_skips_garbage_and_keeps_foreign_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("premis.jsonl");
        fs::write(
            &path,
            concat!(
                "{\"eventType\":\"ingestion\",",
                "\"eventDateTime\":\"2025-03-01T12:00:00\",",
                "\"eventOutcome\":\"warning\"}\n",
                "\n",
                "not json\n",
                "{\"eventType\":\"replication\"}\n",
            ),
        )
        .unwrap();

        let events = read_events(&path, None).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_outcome, EventOutcome::Other("warning".into()));
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_events(&dir.path().join("none.jsonl"), Some(10)).unwrap().is_empty());
    }
}
