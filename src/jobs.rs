use crate::{
    control::JobControl,
    driver::{CapabilityDriver, DriverError, DriverFactory},
    events::{EventSink, JobEvent, JobSummary},
    models::{ApiError, ContextId, LogLine},
    orchestrator::{Job, Orchestrator},
    session::CredentialFile,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_with::skip_serializing_none;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    thread,
};
use tokio::{
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{error, info, warn};
use uuid::Uuid;

const RECENT_LOG_LINES: usize = 200;

/// Front half of the single worker: accepts commands from the HTTP layer and
/// keeps a status record per job, built from the worker's events.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<WorkerCommand>,
    statuses: Arc<Mutex<HashMap<Uuid, JobInfo>>>,
    controls: Arc<Mutex<HashMap<Uuid, JobControl>>>,
}

pub struct WorkerHandles {
    pub worker: thread::JoinHandle<()>,
    pub collector: JoinHandle<()>,
}

enum WorkerCommand {
    Run {
        job: Job,
        control: JobControl,
    },
    OpenHome {
        reply: oneshot::Sender<Result<(), DriverError>>,
    },
    SaveSession {
        reply: oneshot::Sender<Result<usize, String>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Paused,
    Completed,
    Aborted,
    Failed,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub context_id: ContextId,
    pub state: JobState,
    pub done: usize,
    pub total: usize,
    pub paused_message: Option<String>,
    pub logs: VecDeque<LogLine>,
    pub summary: Option<JobSummary>,
    pub created_at: DateTime<Utc>,
}

impl JobInfo {
    fn queued(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            context_id: job.context.clone(),
            state: JobState::Queued,
            done: 0,
            total: job.items.len(),
            paused_message: None,
            logs: VecDeque::new(),
            summary: None,
            created_at: Utc::now(),
        }
    }

    /// Folds one worker event into the record.
    fn apply(&mut self, event: JobEvent) {
        match event {
            JobEvent::Started { .. } => self.state = JobState::Running,
            JobEvent::Log { text, .. } => {
                if self.logs.len() == RECENT_LOG_LINES {
                    self.logs.pop_front();
                }
                self.logs.push_back(LogLine::new(text));
            }
            JobEvent::Progress { done, total, .. } => {
                self.done = done;
                self.total = total;
            }
            JobEvent::Paused { message, .. } => {
                self.state = JobState::Paused;
                self.paused_message = Some(message);
            }
            JobEvent::Resumed { .. } => {
                self.state = JobState::Running;
                self.paused_message = None;
            }
            JobEvent::Finished { summary, .. } => {
                self.state = if summary.fatal.is_some() {
                    JobState::Failed
                } else if summary.aborted {
                    JobState::Aborted
                } else {
                    JobState::Completed
                };
                self.paused_message = None;
                self.summary = Some(summary);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            JobState::Completed | JobState::Aborted | JobState::Failed
        )
    }
}

impl JobQueue {
    /// Starts the worker thread and the status collector. Must be called
    /// from within a tokio runtime.
    pub fn spawn(
        factory: DriverFactory,
        orchestrator: Orchestrator,
        credentials: CredentialFile,
        capacity: usize,
    ) -> std::io::Result<(Self, WorkerHandles)> {
        let (tx, rx) = mpsc::channel::<WorkerCommand>(capacity.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel::<JobEvent>();
        let statuses = Arc::new(Mutex::new(HashMap::new()));
        let controls = Arc::new(Mutex::new(HashMap::new()));

        let worker = thread::Builder::new()
            .name("reupload-worker".into())
            .spawn(move || worker_loop(rx, factory, orchestrator, credentials, events_tx))?;
        let collector = tokio::spawn(collect_events(
            events_rx,
            statuses.clone(),
            controls.clone(),
        ));

        Ok((
            Self {
                tx,
                statuses,
                controls,
            },
            WorkerHandles { worker, collector },
        ))
    }

    pub async fn enqueue(&self, job: Job) -> Result<Uuid, ApiError> {
        let id = job.id;
        let control = JobControl::new();
        {
            let mut guard = self.statuses.lock().await;
            guard.insert(id, JobInfo::queued(&job));
        }
        self.controls.lock().await.insert(id, control.clone());
        info!(
            target = "reupload.api",
            job_id = %id,
            context_id = %job.context,
            items = job.items.len(),
            "job queued"
        );
        if self
            .tx
            .send(WorkerCommand::Run { job, control })
            .await
            .is_err()
        {
            self.statuses.lock().await.remove(&id);
            self.controls.lock().await.remove(&id);
            return Err(worker_unavailable());
        }
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard.get(&id).cloned()
    }

    /// Raises abort for a job that has not finished yet. Returns false when
    /// there is nothing left to abort.
    pub async fn abort(&self, id: Uuid) -> bool {
        match self.controls.lock().await.get(&id) {
            Some(control) => {
                control.abort();
                info!(target = "reupload.api", job_id = %id, "abort requested");
                true
            }
            None => false,
        }
    }

    /// Returns whether the job was actually paused.
    pub async fn resume(&self, id: Uuid) -> bool {
        match self.controls.lock().await.get(&id) {
            Some(control) => control.resume(),
            None => false,
        }
    }

    pub async fn open_home(&self) -> Result<(), ApiError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorkerCommand::OpenHome { reply })
            .await
            .map_err(|_| worker_unavailable())?;
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ApiError {
                error: "session_action_failed".into(),
                detail: Some(err.to_string()),
            }),
            Err(_) => Err(worker_unavailable()),
        }
    }

    /// Persists the session's credentials; returns how many were written.
    pub async fn save_session(&self) -> Result<usize, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorkerCommand::SaveSession { reply })
            .await
            .map_err(|_| worker_unavailable())?;
        match rx.await {
            Ok(Ok(count)) => Ok(count),
            Ok(Err(detail)) => Err(ApiError {
                error: "session_action_failed".into(),
                detail: Some(detail),
            }),
            Err(_) => Err(worker_unavailable()),
        }
    }
}

fn worker_unavailable() -> ApiError {
    ApiError {
        error: "queue_send_failed".into(),
        detail: Some("worker not available".into()),
    }
}

async fn collect_events(
    mut rx: mpsc::UnboundedReceiver<JobEvent>,
    statuses: Arc<Mutex<HashMap<Uuid, JobInfo>>>,
    controls: Arc<Mutex<HashMap<Uuid, JobControl>>>,
) {
    while let Some(event) = rx.recv().await {
        let id = event.job_id();
        let finished = matches!(event, JobEvent::Finished { .. });
        {
            let mut guard = statuses.lock().await;
            match guard.get_mut(&id) {
                Some(info) => info.apply(event),
                None => warn!(target = "reupload.worker", job_id = %id, "event for unknown job"),
            }
        }
        if finished {
            controls.lock().await.remove(&id);
        }
    }
}

/// The live session is created on first use and dropped after it is lost,
/// so the next command starts a fresh one.
fn worker_loop(
    mut rx: mpsc::Receiver<WorkerCommand>,
    factory: DriverFactory,
    orchestrator: Orchestrator,
    credentials: CredentialFile,
    events: mpsc::UnboundedSender<JobEvent>,
) {
    let mut driver: Option<Box<dyn CapabilityDriver>> = None;
    while let Some(command) = rx.blocking_recv() {
        match command {
            WorkerCommand::Run { job, control } => {
                let sink = EventSink::new(job.id, events.clone());
                let summary = match ensure_driver(&mut driver, &factory) {
                    Ok(session) => orchestrator.run_job(&mut **session, &job, &control, &sink),
                    Err(err) => {
                        error!(target = "reupload.worker", job_id = %job.id, error = %err, "session unavailable");
                        sink.started();
                        sink.log(format!("Browser session could not start: {err}"));
                        let mut summary = JobSummary::new(job.items.len());
                        summary.fatal = Some(err.to_string());
                        sink.finished(summary.clone());
                        summary
                    }
                };
                if summary.fatal.is_some() {
                    driver = None;
                }
            }
            WorkerCommand::OpenHome { reply } => {
                let result = ensure_driver(&mut driver, &factory).and_then(|session| session.open_home());
                if matches!(result, Err(DriverError::SessionLost(_))) {
                    driver = None;
                }
                let _ = reply.send(result);
            }
            WorkerCommand::SaveSession { reply } => {
                let result = ensure_driver(&mut driver, &factory)
                    .and_then(|session| session.export_credentials())
                    .map_err(|err| err.to_string())
                    .and_then(|cookies| {
                        let cookies = cookies
                            .ok_or_else(|| "session has no credentials to save".to_string())?;
                        credentials
                            .save(&cookies)
                            .map(|()| cookies.len())
                            .map_err(|err| err.to_string())
                    });
                match &result {
                    Ok(count) => info!(
                        target = "reupload.worker",
                        count,
                        path = %credentials.path().display(),
                        "session credentials saved"
                    ),
                    Err(err) => warn!(target = "reupload.worker", error = %err, "session credentials not saved"),
                }
                let _ = reply.send(result);
            }
        }
    }
    info!(target = "reupload.worker", "command channel closed; worker exiting");
}

fn ensure_driver<'a>(
    slot: &'a mut Option<Box<dyn CapabilityDriver>>,
    factory: &DriverFactory,
) -> Result<&'a mut Box<dyn CapabilityDriver>, DriverError> {
    if slot.is_none() {
        *slot = Some(factory()?);
    }
    slot.as_mut()
        .ok_or_else(|| DriverError::SessionLost("session unavailable".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::driver::{AttemptScript, ScriptedDriver, Step};
    use crate::models::ItemId;
    use crate::pipeline::ItemPipeline;
    use crate::store::IdempotencyStore;
    use std::time::Duration;

    fn orchestrator(store: &IdempotencyStore) -> Orchestrator {
        Orchestrator::new(
            ItemPipeline::new(Duration::from_millis(5)),
            store.clone(),
            RetryPolicy {
                max_attempts: 2,
                retry_delay: Duration::from_millis(10),
                poll_interval: Duration::from_millis(5),
                max_pauses_per_item: 5,
            },
        )
    }

    fn spawn_queue(factory: DriverFactory) -> (JobQueue, IdempotencyStore, tempfile::TempDir) {
        let store = IdempotencyStore::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let credentials = CredentialFile::new(dir.path().join("cookies.json"));
        let (queue, _handles) = JobQueue::spawn(factory, orchestrator(&store), credentials, 8).unwrap();
        (queue, store, dir)
    }

    fn scripted(make: impl Fn() -> ScriptedDriver + Send + 'static) -> DriverFactory {
        Box::new(move || -> Result<Box<dyn CapabilityDriver>, DriverError> { Ok(Box::new(make())) })
    }

    fn job(items: &[&str]) -> Job {
        Job::new(
            ContextId::new("77"),
            items.iter().map(|item| ItemId::new(*item)).collect(),
            true,
        )
    }

    async fn wait_for(queue: &JobQueue, id: Uuid, pred: impl Fn(&JobInfo) -> bool) -> JobInfo {
        for _ in 0..400 {
            if let Some(info) = queue.get(id).await {
                if pred(&info) {
                    return info;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not reach the expected state");
    }

    #[test]
    fn finished_event_sets_terminal_state() {
        let job = job(&["A1"]);
        let mut info = JobInfo::queued(&job);
        info.apply(JobEvent::Started { job_id: job.id });
        info.apply(JobEvent::Paused {
            job_id: job.id,
            message: "captcha".into(),
        });
        assert_eq!(info.state, JobState::Paused);
        assert_eq!(info.paused_message.as_deref(), Some("captcha"));

        info.apply(JobEvent::Resumed { job_id: job.id });
        info.apply(JobEvent::Progress {
            job_id: job.id,
            done: 1,
            total: 1,
        });
        let mut summary = JobSummary::new(1);
        summary.aborted = true;
        info.apply(JobEvent::Finished {
            job_id: job.id,
            summary,
        });
        assert_eq!(info.state, JobState::Aborted);
        assert_eq!((info.done, info.total), (1, 1));
        assert!(info.paused_message.is_none());
    }

    #[test]
    fn log_history_is_bounded() {
        let job = job(&["A1"]);
        let mut info = JobInfo::queued(&job);
        for n in 0..(RECENT_LOG_LINES + 5) {
            info.apply(JobEvent::Log {
                job_id: job.id,
                text: format!("line {n}"),
            });
        }
        assert_eq!(info.logs.len(), RECENT_LOG_LINES);
        assert_eq!(info.logs.front().map(|l| l.text.as_str()), Some("line 5"));
    }

    #[tokio::test]
    async fn queued_job_runs_to_completion() {
        let (queue, store, _dir) = spawn_queue(scripted(ScriptedDriver::new));
        let id = queue.enqueue(job(&["A1", "A2"])).await.unwrap();

        let info = wait_for(&queue, id, JobInfo::is_finished).await;

        assert_eq!(info.state, JobState::Completed);
        assert_eq!((info.done, info.total), (2, 2));
        assert!(!info.logs.is_empty());
        assert!(
            store
                .is_completed(&ContextId::new("77"), &ItemId::new("A2"))
                .unwrap()
        );
        assert!(!queue.abort(id).await, "finished jobs have nothing to abort");
    }

    #[tokio::test]
    async fn paused_job_resumes_through_the_queue() {
        let (queue, _store, _dir) = spawn_queue(scripted(|| ScriptedDriver::new().challenge_on_start()));
        let id = queue.enqueue(job(&["A1"])).await.unwrap();

        let paused = wait_for(&queue, id, |info| info.state == JobState::Paused).await;
        assert!(paused.paused_message.unwrap().contains("A1"));
        assert!(queue.resume(id).await);

        let info = wait_for(&queue, id, JobInfo::is_finished).await;
        assert_eq!(info.state, JobState::Completed);
    }

    #[tokio::test]
    async fn aborting_a_paused_job_ends_it() {
        let (queue, _store, _dir) = spawn_queue(scripted(|| ScriptedDriver::new().challenge_on_start()));
        let id = queue.enqueue(job(&["A1", "A2"])).await.unwrap();
        wait_for(&queue, id, |info| info.state == JobState::Paused).await;

        assert!(queue.abort(id).await);
        let info = wait_for(&queue, id, JobInfo::is_finished).await;
        assert_eq!(info.state, JobState::Aborted);
        assert_eq!(info.done, 0);
    }

    #[tokio::test]
    async fn lost_session_fails_the_job_and_restarts_the_driver() {
        let launches = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = launches.clone();
        let (queue, _store, _dir) = spawn_queue(scripted(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            ScriptedDriver::new().script("A1", [AttemptScript::LoseSessionAt(Step::Navigate)])
        }));

        let first = queue.enqueue(job(&["A1"])).await.unwrap();
        let info = wait_for(&queue, first, JobInfo::is_finished).await;
        assert_eq!(info.state, JobState::Failed);
        assert!(info.summary.unwrap().fatal.is_some());

        let second = queue.enqueue(job(&["B1"])).await.unwrap();
        let info = wait_for(&queue, second, JobInfo::is_finished).await;
        assert_eq!(info.state, JobState::Completed);
        assert_eq!(launches.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn factory_failure_marks_job_failed() {
        let (queue, _store, _dir) = spawn_queue(Box::new(
            || -> Result<Box<dyn CapabilityDriver>, DriverError> {
                Err(DriverError::SessionLost("chrome not found".into()))
            },
        ));
        let id = queue.enqueue(job(&["A1"])).await.unwrap();
        let info = wait_for(&queue, id, JobInfo::is_finished).await;
        assert_eq!(info.state, JobState::Failed);
        assert!(
            info.summary
                .and_then(|summary| summary.fatal)
                .unwrap()
                .contains("chrome not found")
        );
    }

    #[tokio::test]
    async fn save_session_without_credentials_is_an_error() {
        let (queue, _store, dir) = spawn_queue(scripted(ScriptedDriver::new));
        let err = queue.save_session().await.unwrap_err();
        assert_eq!(err.error, "session_action_failed");
        assert!(!dir.path().join("cookies.json").exists());
        queue.open_home().await.unwrap();
    }
}
