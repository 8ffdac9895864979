use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_PREMIS_AGENT: &str = "Gerenciador de Arquivos — Orquestração";

/// Application settings, stored as a flat JSON object. Unknown keys are
/// ignored and missing keys fall back to their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub scripts_dir: PathBuf,
    pub interpreter: String,
    pub logs_dir: PathBuf,
    pub premis_log: PathBuf,
    pub premis_agent: String,
    pub jobstore_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scripts_dir: PathBuf::from("./scripts"),
            interpreter: "python3".to_string(),
            logs_dir: PathBuf::from("./logs"),
            premis_log: PathBuf::from("./logs/premis_events.jsonl"),
            premis_agent: DEFAULT_PREMIS_AGENT.to_string(),
            jobstore_path: PathBuf::from("./jobs_db.json"),
        }
    }
}

impl Config {
    /// Reads `path`, or returns the defaults when it does not exist.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let text = serde_json::to_string_pretty(self).map_err(ConfigError::Encode)?;
        fs::write(path, text).map_err(write_err)
    }

    /// Loads `./.env` if present, then applies environment overrides.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => log::debug!("Loaded environment from {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(e.into()),
        }
        Ok(self.apply_env(|key| env::var(key).ok()))
    }

    /// Where PREMIS events are appended. A bare file name is placed inside
    /// `logs_dir`.
    pub fn premis_log_path(&self) -> PathBuf {
        let bare = self
            .premis_log
            .parent()
            .is_none_or(|p| p.as_os_str().is_empty());
        if bare {
            self.logs_dir.join(&self.premis_log)
        } else {
            self.premis_log.clone()
        }
    }

    pub fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = var("SCRIPTS_DIR") {
            self.scripts_dir = v.into();
        }
        if let Some(v) = var("PYTHON_INTERPRETER") {
            self.interpreter = v;
        }
        if let Some(v) = var("LOGS_DIR") {
            self.logs_dir = v.into();
        }
        if let Some(v) = var("PREMIS_LOG") {
            self.premis_log = v.into();
        }
        if let Some(v) = var("PREMIS_AGENT") {
            self.premis_agent = v;
        }
        if let Some(v) = var("JOBSTORE_PATH") {
            self.jobstore_path = v.into();
        }
        self
    }
}
