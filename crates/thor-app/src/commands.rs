use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use thor_core::premis::read_events;
use thor_core::{Config, JobRecord, JobStatus, JobStore, JobType, Params, Worker};
use tracing::{info, warn};

use crate::cli::{ClearTarget, Command, RequeueScope};

const DRAIN_POLL: Duration = Duration::from_millis(250);

/// Store, configuration and worker, built once and passed to each command.
pub struct App {
    pub config: Arc<Config>,
    pub worker: Worker,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let store = JobStore::open(&config.jobstore_path).with_context(|| {
            format!("opening job store {}", config.jobstore_path.display())
        })?;
        let worker = Worker::new(Arc::new(store), config.clone());
        Ok(Self { config, worker })
    }
}

pub fn dispatch(app: &App, command: Command) -> Result<()> {
    match command {
        Command::Enqueue {
            job_type,
            params,
            params_json,
        } => enqueue(app, &job_type, &params, params_json.as_deref()),
        Command::List { status } => list(app, status.as_deref()),
        Command::Show { id } => show(app, &id),
        Command::Counts => counts(app),
        Command::Cancel { id } => cancel(app, &id),
        Command::Clear { status } => clear(app, status),
        Command::Requeue { scope } => requeue(app, scope),
        Command::Events { limit } => events(app, limit),
        Command::Run { drain } => run(app, drain),
    }
}

fn enqueue(app: &App, job_type: &str, pairs: &[String], json: Option<&str>) -> Result<()> {
    if JobType::parse(job_type).is_none() {
        warn!("{job_type} is not a known job type; it will fail when run");
    }
    let params = build_params(pairs, json)?;
    let id = app.worker.enqueue(job_type, params)?;
    println!("{id}");
    Ok(())
}

fn build_params(pairs: &[String], json: Option<&str>) -> Result<Params> {
    let mut params = match json {
        Some(text) => match serde_json::from_str::<Value>(text).context("parsing --params-json")? {
            Value::Object(map) => map,
            other => bail!("--params-json must be a JSON object, got {other}"),
        },
        None => Params::new(),
    };

    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("expected KEY=VALUE, got '{pair}'"))?;
        // Quoted strings, numbers, booleans and lists keep their JSON type.
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        params.insert(key.trim().to_string(), value);
    }
    Ok(params)
}

fn list(app: &App, status: Option<&str>) -> Result<()> {
    let status = status.map(str::parse::<JobStatus>).transpose()?;
    for job in app.worker.list_jobs(status)? {
        print_job_line(&job);
    }
    Ok(())
}

fn print_job_line(job: &JobRecord) {
    println!(
        "{} {:<8} {:<16} {} {}",
        job.status.icon(),
        job.status,
        job.job_type,
        job.created_at.format("%Y-%m-%d %H:%M:%S"),
        job.id
    );
}

fn show(app: &App, id: &str) -> Result<()> {
    let job = app
        .worker
        .get_job(id)?
        .ok_or_else(|| anyhow!("no job with id {id}"))?;

    println!("{}", serde_json::to_string_pretty(&job)?);
    for entry in app.worker.get_logs(id)? {
        println!(
            "[{}] {:<5} {}",
            entry.ts.format("%H:%M:%S"),
            entry.level,
            entry.msg.trim_end()
        );
    }
    Ok(())
}

fn counts(app: &App) -> Result<()> {
    for (status, n) in app.worker.counts_by_status()? {
        println!("{} {status:<8} {n}", status.icon());
    }
    Ok(())
}

fn cancel(app: &App, id: &str) -> Result<()> {
    if app.worker.cancel_job(id)? {
        println!("Canceled {id}");
        return Ok(());
    }
    let job = app
        .worker
        .get_job(id)?
        .ok_or_else(|| anyhow!("no job with id {id}"))?;
    bail!(cancel_refusal(&job))
}

fn cancel_refusal(job: &JobRecord) -> String {
    if job.status.is_terminal() {
        format!("job {} already finished ({})", job.id, job.status)
    } else {
        format!("job {} is {} and cannot be canceled", job.id, job.status)
    }
}

fn clear(app: &App, target: ClearTarget) -> Result<()> {
    let removed = match target {
        ClearTarget::Pending => app.worker.clear_pending()?,
        ClearTarget::Done => app.worker.clear_done()?,
        ClearTarget::Error => app.worker.clear_error()?,
    };
    println!("Removed {removed} jobs");
    Ok(())
}

fn requeue(app: &App, scope: RequeueScope) -> Result<()> {
    let n = match scope {
        RequeueScope::Errors => app.worker.requeue_errors()?,
        RequeueScope::All => app.worker.requeue_all()?,
    };
    println!("Requeued {n} jobs");
    Ok(())
}

fn events(app: &App, limit: Option<usize>) -> Result<()> {
    let path = app.config.premis_log_path();
    let events = read_events(&path, limit)
        .with_context(|| format!("reading {}", path.display()))?;
    for event in events {
        println!(
            "{} {:<8} {:<28} {} {}",
            event.event_date_time,
            event.event_outcome,
            event.event_type,
            event.linking_object_identifier,
            event.event_detail
        );
    }
    Ok(())
}

fn run(app: &App, drain: bool) -> Result<()> {
    let recovered = app
        .worker
        .store()
        .fail_interrupted("Interrupted: application stopped while the job was running")?;
    if recovered > 0 {
        info!("Recovered {recovered} interrupted jobs");
    }

    app.worker.start().context("starting worker thread")?;
    info!("Worker running on {}", app.config.jobstore_path.display());

    if !drain {
        app.worker.join(None);
        return Ok(());
    }

    loop {
        thread::sleep(DRAIN_POLL);
        let counts = app.worker.counts_by_status()?;
        let active: usize = counts
            .iter()
            .filter(|(status, _)| status.is_active())
            .map(|(_, n)| n)
            .sum();
        if active == 0 {
            break;
        }
    }

    app.worker.stop();
    app.worker.join(None);
    let counts = app.worker.counts_by_status()?;
    info!(
        "Queue drained: {} done, {} error",
        counts.get(&JobStatus::Done).copied().unwrap_or_default(),
        counts.get(&JobStatus::Error).copied().unwrap_or_default()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pairs_keep_json_types() {
        let pairs = vec![
            "raiz=/data".to_string(),
            "progress=true".to_string(),
            "destinos=[\"/b\",\"/c\"]".to_string(),
        ];
        let params = build_params(&pairs, Some(r#"{"saida": "/out", "progress": false}"#)).unwrap();

        assert_eq!(params["raiz"], json!("/data"));
        assert_eq!(params["saida"], json!("/out"));
        assert_eq!(params["progress"], json!(true));
        assert_eq!(params["destinos"], json!(["/b", "/c"]));
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(build_params(&["no-equals".to_string()], None).is_err());
        assert!(build_params(&[], Some("[1, 2]")).is_err());
    }

    #[test]
    fn cancel_refusal_says_why() {
        let mut job: JobRecord = serde_json::from_value(json!({
            "_id": "j1",
            "job_type": "HASH_MANIFEST",
            "status": "running",
            "created_at": "2024-05-01T10:00:00Z",
            "updated_at": "2024-05-01T10:00:00Z",
        }))
        .unwrap();
        assert_eq!(cancel_refusal(&job), "job j1 is running and cannot be canceled");

        job.status = JobStatus::Done;
        assert_eq!(cancel_refusal(&job), "job j1 already finished (done)");
    }
}
