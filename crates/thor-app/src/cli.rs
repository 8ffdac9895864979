use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "thor", version, about = "Preservation job queue", long_about = None)]
pub struct Cli {
    /// JSON configuration file. Missing keys fall back to defaults.
    #[arg(long, global = true, default_value = "./config.json")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add a job to the queue.
    Enqueue {
        /// Job type, e.g. HASH_MANIFEST.
        job_type: String,

        /// Parameter as key=value. Values that parse as JSON are kept typed.
        #[arg(long = "param", short = 'p', value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Parameters as a JSON object, merged before --param.
        #[arg(long)]
        params_json: Option<String>,
    },

    /// List jobs, newest first.
    List {
        #[arg(long)]
        status: Option<String>,
    },

    /// Show one job with its log.
    Show { id: String },

    /// Count jobs per status.
    Counts,

    /// Cancel a pending job.
    Cancel { id: String },

    /// Delete all jobs in a status.
    Clear {
        #[arg(value_enum)]
        status: ClearTarget,
    },

    /// Put finished jobs back in the queue.
    Requeue {
        #[arg(value_enum)]
        scope: RequeueScope,
    },

    /// Print recorded PREMIS events.
    Events {
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Run the worker in the foreground.
    Run {
        /// Exit once nothing is pending or running.
        #[arg(long, default_value_t = false)]
        drain: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClearTarget {
    Pending,
    Done,
    Error,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequeueScope {
    /// Only jobs in error.
    Errors,
    /// Jobs in error, done or canceled.
    All,
}
