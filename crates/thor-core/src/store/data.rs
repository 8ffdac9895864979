use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::job::{JobRecord, LogEntry};

/// On-disk document: `{ "jobs": [...], "logs": { "<id>": [...] } }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobDb {
    pub jobs: Vec<JobRecord>,
    pub logs: BTreeMap<String, Vec<LogEntry>>,
}

/// Top-level shape only. Records are decoded one by one so a single bad
/// entry does not take the rest of the queue with it.
#[derive(Deserialize)]
struct RawDb {
    jobs: Vec<Value>,
    logs: BTreeMap<String, Vec<Value>>,
}

pub(crate) enum Loaded {
    Ok(JobDb),
    /// The file is absent or its top-level shape is broken.
    Reset(String),
}

impl JobDb {
    pub fn find(&self, id: &str) -> Option<&JobRecord> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut JobRecord> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    /// Reads the document. I/O failures other than a missing file are errors,
    /// never a reason to start over.
    pub(crate) fn load(path: &Path) -> Result<Loaded, StoreError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(Loaded::Reset("file does not exist".into()));
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        match serde_json::from_str::<RawDb>(&text) {
            Ok(raw) => Ok(Loaded::Ok(raw.decode(path))),
            Err(e) => Ok(Loaded::Reset(format!("invalid document: {e}"))),
        }
    }

    /// Writes the whole document to `<path>.tmp` and renames it over `path`.
    pub(crate) fn persist(&self, path: &Path) -> Result<(), StoreError> {
        let text = serde_json::to_string_pretty(self)?;
        let tmp = sibling(path, ".tmp");
        let write_err = |source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        };

        let mut file = File::create(&tmp).map_err(write_err)?;
        file.write_all(text.as_bytes()).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        drop(file);

        fs::rename(&tmp, path).map_err(write_err)?;
        Ok(())
    }
}

impl RawDb {
    fn decode(self, path: &Path) -> JobDb {
        let jobs = self
            .jobs
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<JobRecord>(value) {
                Ok(job) => Some(job),
                Err(e) => {
                    warn!("Skipping unreadable job in {}: {e}", path.display());
                    None
                }
            })
            .collect();

        let logs = self
            .logs
            .into_iter()
            .map(|(id, entries)| {
                let entries = entries
                    .into_iter()
                    .filter_map(|value| serde_json::from_value::<LogEntry>(value).ok())
                    .collect();
                (id, entries)
            })
            .collect();

        JobDb { jobs, logs }
    }
}

/// `path` with `suffix` appended to its file name.
pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;

    fn loaded(path: &Path) -> JobDb {
        match JobDb::load(path).unwrap() {
            Loaded::Ok(db) => db,
            Loaded::Reset(reason) => panic!("unexpected reset: {reason}"),
        }
    }

    #[test]
    fn missing_file_needs_reset() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            JobDb::load(&dir.path().join("jobs_db.json")),
            Ok(Loaded::Reset(_))
        ));
    }

    #[test]
    fn document_without_logs_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs_db.json");
        fs::write(&path, r#"{"jobs": []}"#).unwrap();
        assert!(matches!(JobDb::load(&path), Ok(Loaded::Reset(_))));
    }

    #[test]
    fn unreadable_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs_db.json");
        fs::create_dir(&path).unwrap();
        assert!(matches!(
            JobDb::load(&path),
            Err(StoreError::Read { .. })
        ));
    }

    #[test]
    fn bad_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs_db.json");
        fs::write(
            &path,
            r#"{
              "jobs": [
                {"_id": "a", "job_type": "HASH_MANIFEST", "status": "done", "params": {},
                 "created_at": "2024-05-01T10:00:00.000000Z",
                 "updated_at": "2024-05-01T10:00:01.000000Z", "error_msg": null},
                {"_id": "b", "job_type": "HASH_MANIFEST", "status": "exploded", "params": {},
                 "created_at": "2024-05-01T10:00:00.000000Z",
                 "updated_at": "2024-05-01T10:00:00.000000Z"},
                {"_id": "c", "job_type": "BUILD_BAG", "status": "pending", "params": {},
                 "created_at": "yesterday", "updated_at": "yesterday"}
              ],
              "logs": {
                "a": [
                  {"ts": "2024-05-01T10:00:00.500000Z", "level": "INFO", "msg": "ok"},
                  {"ts": 17, "level": "INFO", "msg": "broken"}
                ]
              }
            }"#,
        )
        .unwrap();

        let db = loaded(&path);
        assert_eq!(db.jobs.len(), 1);
        assert_eq!(db.jobs[0].id, "a");
        assert_eq!(db.jobs[0].status, JobStatus::Done);
        assert_eq!(db.logs["a"].len(), 1);
        assert_eq!(db.logs["a"][0].msg, "ok");
    }

    #[test]
    fn persist_leaves_no_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs_db.json");
        JobDb::default().persist(&path).unwrap();

        assert!(path.exists());
        assert!(!sibling(&path, ".tmp").exists());
        assert_eq!(loaded(&path), JobDb::default());
    }
}
