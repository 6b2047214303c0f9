//! Single-connection job session.
//!
//! [`SessionManager`] owns one stable client id and one worker task.
//! Callers [`submit`](SessionManager::submit) jobs from anywhere; the
//! worker runs them strictly one at a time in submission order on the
//! current connection, because ComfyUI's `executing` events can only be
//! attributed while a single prompt is in flight per client.
//!
//! The worker connects lazily, probes the connection before each job,
//! and on a transport failure reconnects and retries the same job within
//! the [`ReconnectConfig`] budget. Every job gets exactly one outcome on
//! its [`JobTicket`].

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::api::Enqueue;
use crate::client::{Connector, Transport, TransportError};
use crate::events::SessionEvent;
use crate::job::{Job, JobClient, JobError, JobOptions, JobResult};
use crate::reconnect::{ReconnectConfig, RetryBudget};
use crate::state::{SessionState, Transition};

/// Broadcast channel capacity for session events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The terminal outcome of one submitted job.
pub type JobOutcome = Result<JobResult, JobError>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub reconnect: ReconnectConfig,
    /// Ping the current connection before starting each job.
    pub probe_before_job: bool,
    pub job: JobOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            probe_before_job: true,
            job: JobOptions::default(),
        }
    }
}

enum Request {
    Job {
        job: Job,
        reply: oneshot::Sender<JobOutcome>,
    },
    /// Sentinel: the worker exits when it dequeues this.
    Stop,
}

/// Handle to a running session.
pub struct SessionManager {
    client_id: String,
    queue: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<SessionState>,
    event_tx: broadcast::Sender<SessionEvent>,
    worker: tokio::task::JoinHandle<()>,
}

/// Result slot for one submitted job.
#[derive(Debug)]
pub struct JobTicket {
    rx: oneshot::Receiver<JobOutcome>,
}

impl JobTicket {
    /// Wait for the job's outcome.
    pub async fn outcome(self) -> JobOutcome {
        self.rx.await.unwrap_or_else(|_| Err(JobError::SessionClosed))
    }

    /// Non-blocking check for the outcome, for polling callers.
    ///
    /// Returns `None` while the job is queued or running. The outcome is
    /// handed out once; later calls report [`JobError::SessionClosed`].
    pub fn try_outcome(&mut self) -> Option<JobOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(JobError::SessionClosed)),
        }
    }
}

impl SessionManager {
    /// Spawn the session worker on the current tokio runtime.
    pub fn start<C, E>(connector: C, enqueuer: E, config: SessionConfig) -> Self
    where
        C: Connector,
        E: Enqueue,
    {
        let client_id = uuid::Uuid::new_v4().to_string();
        let (queue, requests) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SessionState::Disconnected);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let worker = SessionWorker {
            connector,
            jobs: JobClient::new(enqueuer, config.job),
            reconnect: config.reconnect,
            probe_before_job: config.probe_before_job,
            client_id: client_id.clone(),
            connection: None,
            state: state_tx,
            event_tx: event_tx.clone(),
        };
        let worker = tokio::spawn(worker.run(requests));

        tracing::info!(client_id = %client_id, "Session started");

        Self {
            client_id,
            queue,
            state,
            event_tx,
            worker,
        }
    }

    /// The client id every connection of this session registers with.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Queue a job. Returns immediately.
    pub fn submit(&self, job: Job) -> JobTicket {
        let (reply, rx) = oneshot::channel();
        if self.queue.send(Request::Job { job, reply }).is_err() {
            tracing::warn!(client_id = %self.client_id, "Session worker has exited, job rejected");
        }
        JobTicket { rx }
    }

    /// Queue the stop sentinel.
    ///
    /// Jobs submitted before this call still run; jobs submitted after
    /// it resolve to [`JobError::SessionClosed`].
    pub fn stop(&self) {
        if self.queue.send(Request::Stop).is_err() {
            tracing::debug!(client_id = %self.client_id, "Session worker already exited");
        }
    }

    /// Wait for the worker to exit.
    pub async fn join(self) {
        if let Err(e) = self.worker.await {
            tracing::error!(client_id = %self.client_id, error = %e, "Session worker panicked");
        }
    }

    /// [`stop`](Self::stop) then [`join`](Self::join).
    pub async fn shutdown(self) {
        self.stop();
        self.join().await;
    }
}

/// The task that owns the connection.
struct SessionWorker<C: Connector, E> {
    connector: C,
    jobs: JobClient<E>,
    reconnect: ReconnectConfig,
    probe_before_job: bool,
    client_id: String,
    connection: Option<C::Transport>,
    state: watch::Sender<SessionState>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl<C: Connector, E: Enqueue> SessionWorker<C, E> {
    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        while let Some(request) = requests.recv().await {
            match request {
                Request::Stop => {
                    tracing::info!(client_id = %self.client_id, "Stop sentinel received");
                    break;
                }
                Request::Job { job, reply } => {
                    let outcome = self.process(&job).await;
                    self.report(&job, &outcome);
                    if reply.send(outcome).is_err() {
                        tracing::debug!(source = %job.source.display(), "Caller dropped its ticket");
                    }
                }
            }
        }

        self.drop_connection(Transition::StopRequested, "session stopped")
            .await;
        self.emit(SessionEvent::Stopped);
        tracing::info!(client_id = %self.client_id, "Session worker exited");
    }

    /// Run one job, reconnecting and retrying within the budget.
    async fn process(&mut self, job: &Job) -> JobOutcome {
        self.emit(SessionEvent::JobStarted {
            source: job.source.clone(),
        });

        if self.probe_before_job {
            self.probe().await;
        }

        let mut budget = RetryBudget::new(&self.reconnect);
        loop {
            match self.attempt(job).await {
                Err(e) if e.invalidates_connection() => {
                    self.drop_connection(Transition::TransportLost, &e.to_string())
                        .await;
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    let Some(retry) = budget.take() else {
                        if budget.used() > 0 {
                            tracing::warn!(
                                source = %job.source.display(),
                                retries = budget.used(),
                                "Retry budget exhausted",
                            );
                        }
                        return Err(e);
                    };
                    tracing::warn!(
                        source = %job.source.display(),
                        retry,
                        error = %e,
                        "Job failed on transport, reconnecting and retrying",
                    );
                    self.emit(SessionEvent::JobRetrying {
                        source: job.source.clone(),
                        retry,
                        error: e.to_string(),
                    });
                    tokio::time::sleep(self.reconnect.delay).await;
                }
                outcome => return outcome,
            }
        }
    }

    async fn attempt(&mut self, job: &Job) -> JobOutcome {
        self.ensure_connected().await?;
        let Some(connection) = self.connection.as_mut() else {
            return Err(JobError::Transport(TransportError::Connection(
                "no current connection".into(),
            )));
        };
        self.jobs.submit(connection, &self.client_id, job).await
    }

    async fn ensure_connected(&mut self) -> Result<(), TransportError> {
        if self.connection.is_some() {
            return Ok(());
        }

        self.transition(Transition::ConnectRequested);
        match self.connector.connect(&self.client_id).await {
            Ok(connection) => {
                self.connection = Some(connection);
                self.transition(Transition::ConnectSucceeded);
                self.emit(SessionEvent::Connected {
                    client_id: self.client_id.clone(),
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!(client_id = %self.client_id, error = %e, "Connection failed");
                self.transition(Transition::ConnectFailed);
                Err(e)
            }
        }
    }

    /// Ping the current connection; drop it if the ping fails.
    async fn probe(&mut self) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        if let Err(e) = connection.ping().await {
            tracing::warn!(client_id = %self.client_id, error = %e, "Liveness probe failed");
            self.drop_connection(Transition::ProbeFailed, &e.to_string())
                .await;
        }
    }

    async fn drop_connection(&mut self, cause: Transition, reason: &str) {
        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
            tracing::info!(client_id = %self.client_id, reason, "Connection discarded");
            self.emit(SessionEvent::Disconnected {
                client_id: self.client_id.clone(),
                reason: reason.to_string(),
            });
        }
        self.transition(cause);
    }

    fn transition(&self, input: Transition) {
        let current = *self.state.borrow();
        let next = current.on(input);
        if next != current {
            tracing::debug!(from = ?current, to = ?next, ?input, "Session state changed");
            self.state.send_replace(next);
        }
    }

    fn report(&self, job: &Job, outcome: &JobOutcome) {
        let event = match outcome {
            Ok(result) => {
                tracing::info!(
                    source = %job.source.display(),
                    prompt_id = %result.prompt_id,
                    images = result.image_count(),
                    elapsed_ms = result.elapsed.as_millis() as u64,
                    "Job completed",
                );
                SessionEvent::JobCompleted {
                    source: job.source.clone(),
                    prompt_id: result.prompt_id.clone(),
                    images: result.image_count(),
                    decode_failures: result.decode_failures.len(),
                }
            }
            Err(e) => {
                tracing::error!(source = %job.source.display(), error = %e, "Job failed");
                SessionEvent::JobFailed {
                    source: job.source.clone(),
                    error: e.to_string(),
                }
            }
        };
        self.emit(event);
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}
