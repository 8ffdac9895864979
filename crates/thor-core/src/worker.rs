pub mod runner;

use std::any::Any;
use std::collections::BTreeMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{StoreError, WorkerError};
use crate::job::{JobRecord, JobStatus, JobType, LogEntry, LogLevel, Params};
use crate::premis::{EventOutcome, PremisEvent, PremisLog};
use crate::resolver;
use crate::store::JobStore;
pub use runner::{CommandOutput, CommandRunner, SystemRunner};

const OUTPUT_LOG_LIMIT: usize = 2000;
const ERROR_MSG_LIMIT: usize = 500;
const JOIN_POLL: Duration = Duration::from_millis(10);
const DROP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// One queued command is enough; further wake-ups coalesce with it.
const COMMAND_CAPACITY: usize = 1;

pub enum WorkerCommand {
    /// New work may be available; skip the rest of the current sleep.
    Wake,
    Shutdown,
}

struct WorkerHandle {
    command_tx: SyncSender<WorkerCommand>,
    stopping: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Background executor for the job queue.
///
/// One dedicated thread claims the oldest pending job, runs it to completion
/// and records the outcome, one job at a time. Pausing only stops new claims;
/// a job already running is always finished.
pub struct Worker {
    store: Arc<JobStore>,
    config: Arc<Config>,
    runner: Arc<dyn CommandRunner>,
    premis: Arc<PremisLog>,
    paused: Arc<AtomicBool>,
    idle_poll: Duration,
    paused_poll: Duration,
    handle: Mutex<Option<WorkerHandle>>,
}

impl Worker {
    pub fn new(store: Arc<JobStore>, config: Arc<Config>) -> Self {
        let premis = Arc::new(PremisLog::new(config.premis_log_path()));
        Self {
            store,
            config,
            runner: Arc::new(SystemRunner),
            premis,
            paused: Arc::new(AtomicBool::new(false)),
            idle_poll: Duration::from_millis(500),
            paused_poll: Duration::from_millis(300),
            handle: Mutex::new(None),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_poll_intervals(mut self, idle: Duration, paused: Duration) -> Self {
        self.idle_poll = idle;
        self.paused_poll = paused;
        self
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    fn handle(&self) -> MutexGuard<'_, Option<WorkerHandle>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Never blocks. When a command is already queued the thread is about to
    /// wake anyway, so this one is dropped.
    fn notify(&self, command: WorkerCommand) {
        if let Some(handle) = self.handle().as_ref() {
            let _ = handle.command_tx.try_send(command);
        }
    }

    // ---- lifecycle ----

    /// Spawns the worker thread. Does nothing if it is already alive.
    pub fn start(&self) -> io::Result<()> {
        let mut slot = self.handle();
        if slot.as_ref().is_some_and(|h| !h.thread.is_finished()) {
            debug!("Worker already running");
            return Ok(());
        }
        if let Some(old) = slot.take() {
            let _ = old.thread.join();
        }

        let (command_tx, command_rx) = sync_channel(COMMAND_CAPACITY);
        let stopping = Arc::new(AtomicBool::new(false));
        let job_loop = JobLoop {
            store: self.store.clone(),
            config: self.config.clone(),
            runner: self.runner.clone(),
            premis: self.premis.clone(),
            paused: self.paused.clone(),
            stopping: stopping.clone(),
            idle_poll: self.idle_poll,
            paused_poll: self.paused_poll,
        };

        let thread = thread::Builder::new()
            .name("thor-worker".into())
            .spawn(move || job_loop.run(command_rx))?;

        *slot = Some(WorkerHandle {
            command_tx,
            stopping,
            thread,
        });
        Ok(())
    }

    /// Requests shutdown. The current job, if any, still runs to completion.
    pub fn stop(&self) {
        if let Some(handle) = self.handle().as_ref() {
            handle.stopping.store(true, Ordering::SeqCst);
            // A full channel still wakes the thread, which then sees the flag.
            let _ = handle.command_tx.try_send(WorkerCommand::Shutdown);
        }
    }

    /// Waits for the thread to exit, at most `timeout` if given. Returns
    /// whether it has exited.
    pub fn join(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            {
                let mut slot = self.handle();
                let finished = match slot.as_ref() {
                    None => return true,
                    Some(h) => h.thread.is_finished(),
                };
                if finished {
                    if let Some(h) = slot.take() {
                        if h.thread.join().is_err() {
                            error!("Worker thread panicked");
                        }
                    }
                    return true;
                }
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
            thread::sleep(JOIN_POLL);
        }
    }

    /// Stops, waits and starts again. Returns `false` if the old thread did not
    /// exit within `timeout`, in which case nothing is started.
    pub fn restart(&self, timeout: Option<Duration>) -> io::Result<bool> {
        self.stop();
        if !self.join(timeout) {
            return Ok(false);
        }
        self.start()?;
        Ok(true)
    }

    pub fn is_alive(&self) -> bool {
        self.handle()
            .as_ref()
            .is_some_and(|h| !h.thread.is_finished())
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("Worker paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("Worker resumed");
        self.notify(WorkerCommand::Wake);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    // ---- queue ----

    /// Adds a pending job and wakes the worker thread.
    pub fn enqueue(&self, job_type: &str, params: Params) -> Result<String, StoreError> {
        let id = self.store.add_job(job_type, params)?;
        self.store.add_log(&id, format!("Queued {job_type}"), LogLevel::Info);
        self.notify(WorkerCommand::Wake);
        Ok(id)
    }

    pub fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>, StoreError> {
        self.store.list_jobs(status)
    }

    pub fn counts_by_status(&self) -> Result<BTreeMap<JobStatus, usize>, StoreError> {
        self.store.counts_by_status()
    }

    pub fn get_job(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        self.store.get_job(id)
    }

    pub fn get_logs(&self, id: &str) -> Result<Vec<LogEntry>, StoreError> {
        self.store.get_logs(id)
    }

    pub fn clear_pending(&self) -> Result<usize, StoreError> {
        self.store.clear_by_status(JobStatus::Pending)
    }

    pub fn clear_done(&self) -> Result<usize, StoreError> {
        self.store.clear_by_status(JobStatus::Done)
    }

    pub fn clear_error(&self) -> Result<usize, StoreError> {
        self.store.clear_by_status(JobStatus::Error)
    }

    pub fn requeue_errors(&self) -> Result<usize, StoreError> {
        self.requeue(&[JobStatus::Error])
    }

    /// Requeues finished jobs (error, done and canceled). Running jobs are
    /// left alone.
    pub fn requeue_all(&self) -> Result<usize, StoreError> {
        self.requeue(&[JobStatus::Error, JobStatus::Done, JobStatus::Canceled])
    }

    fn requeue(&self, from: &[JobStatus]) -> Result<usize, StoreError> {
        let mut total = 0;
        for status in from {
            total += self.store.requeue_from_status(*status)?;
        }
        if total > 0 {
            self.notify(WorkerCommand::Wake);
        }
        Ok(total)
    }

    /// Cancels a pending job. Running jobs cannot be canceled.
    pub fn cancel_job(&self, id: &str) -> Result<bool, StoreError> {
        self.store.cancel_job(id)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
        if !self.join(Some(DROP_JOIN_TIMEOUT)) {
            warn!("Worker thread still busy after {DROP_JOIN_TIMEOUT:?}, detaching");
        }
    }
}

/// State owned by the worker thread.
struct JobLoop {
    store: Arc<JobStore>,
    config: Arc<Config>,
    runner: Arc<dyn CommandRunner>,
    premis: Arc<PremisLog>,
    paused: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    idle_poll: Duration,
    paused_poll: Duration,
}

impl JobLoop {
    fn run(self, commands: Receiver<WorkerCommand>) {
        info!("Worker started");
        while !self.stopping.load(Ordering::SeqCst) {
            if self.paused.load(Ordering::SeqCst) {
                if self.sleep(&commands, self.paused_poll) {
                    break;
                }
                continue;
            }

            match self.store.pop_next_pending() {
                Ok(Some(job)) => self.process(job),
                Ok(None) => {
                    if self.sleep(&commands, self.idle_poll) {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to claim next job: {e}");
                    if self.sleep(&commands, self.idle_poll) {
                        break;
                    }
                }
            }
        }
        info!("Worker stopped");
    }

    /// Waits up to `timeout`. Returns `true` when shutdown was requested.
    fn sleep(&self, commands: &Receiver<WorkerCommand>, timeout: Duration) -> bool {
        match commands.recv_timeout(timeout) {
            Ok(WorkerCommand::Wake) | Err(RecvTimeoutError::Timeout) => false,
            Ok(WorkerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }

    fn process(&self, job: JobRecord) {
        info!("Claimed job {} ({})", job.id, job.job_type);

        let failure = match panic::catch_unwind(AssertUnwindSafe(|| self.execute(&job))) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(payload) => panic_message(payload.as_ref()),
        };

        error!("Job {} failed unexpectedly: {failure}", job.id);
        self.store.add_log(
            &job.id,
            format!("Unexpected failure: {failure}"),
            LogLevel::Error,
        );
        let msg = truncate(&failure, ERROR_MSG_LIMIT);
        if let Err(e) = self.store.set_status(&job.id, JobStatus::Error, Some(msg)) {
            error!("Failed to mark job {} as error: {e}", job.id);
        }
    }

    fn execute(&self, job: &JobRecord) -> Result<(), WorkerError> {
        let id = job.id.as_str();
        self.store
            .add_log(id, format!("Starting job {}", job.job_type), LogLevel::Info);

        let command = match resolver::resolve(&job.job_type, &job.params, &self.config) {
            Ok(command) => command,
            Err(e) => {
                let msg = e.to_string();
                warn!("Job {id} rejected: {msg}");
                self.store.add_log(id, msg.as_str(), LogLevel::Error);
                self.record_event(job, EventOutcome::Failure, &msg);
                self.store
                    .set_status(id, JobStatus::Error, Some(truncate(&msg, ERROR_MSG_LIMIT)))?;
                return Ok(());
            }
        };

        debug!("Job {id}: {command}");
        let output = match self.runner.run(&command) {
            Ok(output) => output,
            Err(source) => {
                let err = WorkerError::Spawn {
                    program: command.program.to_string_lossy().into_owned(),
                    source,
                };
                self.record_event(job, EventOutcome::Failure, &err.to_string());
                return Err(err);
            }
        };

        if !output.stdout.is_empty() {
            self.store
                .add_log(id, truncate(&output.stdout, OUTPUT_LOG_LIMIT), LogLevel::Info);
        }
        if !output.stderr.is_empty() {
            let level = if output.success() {
                LogLevel::Info
            } else {
                LogLevel::Error
            };
            self.store
                .add_log(id, truncate(&output.stderr, OUTPUT_LOG_LIMIT), level);
        }

        let code = output
            .exit_code
            .map_or_else(|| "none".to_string(), |c| c.to_string());
        self.record_event(
            job,
            EventOutcome::from_success(output.success()),
            &format!("Exit code {code}"),
        );

        if output.success() {
            self.store
                .add_log(id, "Completed successfully", LogLevel::Info);
            self.store.set_status(id, JobStatus::Done, None)?;
            info!("Job {id} done");
        } else {
            self.store
                .add_log(id, format!("Failed (exit code {code})"), LogLevel::Error);
            let msg = if output.stderr.trim().is_empty() {
                format!("exit code {code}")
            } else {
                truncate(&output.stderr, ERROR_MSG_LIMIT)
            };
            self.store.set_status(id, JobStatus::Error, Some(msg))?;
            warn!("Job {id} failed with exit code {code}");
        }
        Ok(())
    }

    /// Appends a PREMIS event for `job`. Failures are noted on the job and
    /// otherwise ignored.
    fn record_event(&self, job: &JobRecord, outcome: EventOutcome, detail: &str) {
        if job.kind() == Some(JobType::PremisEvent) {
            return;
        }
        let event = PremisEvent::for_job(
            &job.job_type,
            &job.params,
            outcome,
            detail,
            &self.config.premis_agent,
        );
        if let Err(e) = self.premis.append(&event) {
            warn!("Job {}: {e}", job.id);
            self.store
                .add_log(&job.id, format!("PREMIS event not recorded: {e}"), LogLevel::Warn);
        }
    }
}

/// First `max` characters of `s`.
fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((end, _)) => s[..end].to_string(),
        None => s.to_string(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_counts_characters() {
        assert_eq!(truncate("ação concluída", 4), "ação");
        assert_eq!(truncate("abc", 10), "abc");
        assert_eq!(truncate("", 5), "");
    }

    #[test]
    fn panic_payloads_become_messages() {
        let payload = panic::catch_unwind::<_, ()>(|| panic!("boom {}", 42)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 42");

        let payload = panic::catch_unwind::<_, ()>(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");
    }

    #[test]
    fn sleep_reports_shutdown_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::open(dir.path().join("jobs.json")).unwrap());
        let job_loop = JobLoop {
            store,
            config: Arc::new(Config::default()),
            runner: Arc::new(SystemRunner),
            premis: Arc::new(PremisLog::new(dir.path().join("premis.jsonl"))),
            paused: Arc::new(AtomicBool::new(false)),
            stopping: Arc::new(AtomicBool::new(false)),
            idle_poll: Duration::from_millis(1),
            paused_poll: Duration::from_millis(1),
        };

        let (tx, rx) = sync_channel(COMMAND_CAPACITY);
        assert!(!job_loop.sleep(&rx, Duration::from_millis(1)));
        tx.send(WorkerCommand::Wake).unwrap();
        assert!(!job_loop.sleep(&rx, Duration::from_secs(5)));
        tx.send(WorkerCommand::Shutdown).unwrap();
        assert!(job_loop.sleep(&rx, Duration::from_secs(5)));
        drop(tx);
        assert!(job_loop.sleep(&rx, Duration::from_secs(5)));
    }

    #[test]
    fn wake_ups_coalesce_while_the_thread_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::open(dir.path().join("jobs.json")).unwrap());
        let worker = Worker::new(store, Arc::new(Config::default()));

        let (command_tx, command_rx) = sync_channel(COMMAND_CAPACITY);
        *worker.handle() = Some(WorkerHandle {
            command_tx,
            stopping: Arc::new(AtomicBool::new(false)),
            thread: thread::spawn(|| {}),
        });
        for _ in 0..100 {
            worker.notify(WorkerCommand::Wake);
        }
        worker.resume();

        assert!(matches!(command_rx.try_recv(), Ok(WorkerCommand::Wake)));
        assert!(command_rx.try_recv().is_err());

        worker.stop();
        assert!(worker.join(Some(Duration::from_secs(5))));
    }

    #[test]
    fn start_is_idempotent_and_stop_joins() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::open(dir.path().join("jobs.json")).unwrap());
        let worker = Worker::new(store, Arc::new(Config::default()))
            .with_poll_intervals(Duration::from_millis(20), Duration::from_millis(20));

        assert!(!worker.is_alive());
        assert!(worker.join(Some(Duration::ZERO)));

        worker.start().unwrap();
        worker.start().unwrap();
        assert!(worker.is_alive());

        worker.stop();
        assert!(worker.join(Some(Duration::from_secs(5))));
        assert!(!worker.is_alive());

        assert!(worker.restart(Some(Duration::from_secs(5))).unwrap());
        assert!(worker.is_alive());
    }
}
