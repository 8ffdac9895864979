//! Job queue core of the Thor Arquivista preservation toolkit: a persistent
//! JSON job store, the job-type to script resolver, a single-threaded worker
//! and the PREMIS event log.

pub mod config;
pub mod error;
pub mod job;
pub mod params;
pub mod premis;
pub mod resolver;
pub mod store;
pub mod worker;

pub use config::Config;
pub use error::{ConfigError, PremisError, ResolveError, StoreError, WorkerError};
pub use job::{JobRecord, JobStatus, JobType, LogEntry, LogLevel, Params};
pub use premis::{EventOutcome, PremisEvent, PremisLog};
pub use resolver::{resolve, CommandLine};
pub use store::JobStore;
pub use worker::{CommandOutput, CommandRunner, SystemRunner, Worker};
