//! Worker supervisor - owns the worker subprocess and the restart policy.
//!
//! Flow:
//! 1. Spawn the worker with stdin/stdout piped, stderr passed through
//! 2. Relay queued requests one at a time, strictly in submission order
//! 3. Accumulate stdout bytes, decode completed frames, answer the head request
//! 4. On spawn/write/exit/framing failure: fail the in-flight request, restart
//!    the worker, and replay everything still queued against the replacement
//! 5. Past the failure limit: stop restarting and escalate (by default,
//!    terminate the host process so an external manager restarts it whole)

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;

use futures::SinkExt;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedWrite};

use crate::bridge::codec::LineCodec;
use crate::restart::{DEFAULT_MAX_FAILS, FailureCounter, RestartDecision};

/// Requests queued behind an unresponsive worker before `submit` applies
/// backpressure by waiting for channel capacity.
const SUBMIT_QUEUE_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
    #[error("failed to write request to worker: {0}")]
    Write(String),
    #[error("worker exited with code {code}")]
    UnexpectedExit { code: i32 },
    #[error("worker sent a malformed frame: {0}")]
    Framing(String),
    #[error("request is not serializable: {0}")]
    Serialization(String),
    #[error("supervisor has fatally stopped")]
    FatallyStopped,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
///
/// The returned child must have stdin and stdout piped; stderr is the worker's
/// diagnostic stream and is expected to pass through unmanaged.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<Child, SpawnError>;
}

/// Spawner running a program with arguments, stdio wired pipe/pipe/passthrough.
pub struct CommandSpawner {
    program: String,
    args: Vec<String>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = String>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().collect(),
        }
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self) -> Result<Child, SpawnError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

/// Invoked once the consecutive-failure streak exceeds the maximum.
///
/// This is an intentional external-restart signal, not a recoverable error:
/// the default implementation terminates the host process with a non-zero
/// status so an outside process manager restarts the whole host.
pub trait Escalation: Send + Sync {
    fn fatal(&self, consecutive_failures: u32);
}

/// Default escalation: exit the host process with status 1.
pub struct ExitProcess;

impl Escalation for ExitProcess {
    fn fatal(&self, consecutive_failures: u32) {
        tracing::error!(
            consecutive_failures,
            "worker kept failing, terminating host for external restart"
        );
        std::process::exit(1);
    }
}

pub struct RelayConfig {
    max_fails: u32,
    spawner: Arc<dyn WorkerSpawner>,
    escalation: Arc<dyn Escalation>,
}

impl RelayConfig {
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            max_fails: DEFAULT_MAX_FAILS,
            spawner,
            escalation: Arc::new(ExitProcess),
        }
    }

    /// Supervise `program args...` as the worker.
    pub fn command(program: impl Into<String>, args: impl IntoIterator<Item = String>) -> Self {
        Self::new(Arc::new(CommandSpawner::new(program, args)))
    }

    pub fn with_max_fails(mut self, max_fails: u32) -> Self {
        self.max_fails = max_fails;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_escalation(mut self, escalation: Arc<dyn Escalation>) -> Self {
        self.escalation = escalation;
        self
    }
}

/// Observable lifecycle state of the supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Restarting,
    /// Terminal: the failure limit was exceeded and escalation has fired.
    FatallyStopped,
}

/// One worker subprocess instance. Identity does not persist across restarts;
/// a replacement gets a fresh stdin writer, stdout reader, and inbound buffer.
struct WorkerProcess {
    child: Child,
    writer: FramedWrite<ChildStdin, LineCodec<Value>>,
    stdout: ChildStdout,
}

impl WorkerProcess {
    fn spawn(spawner: &dyn WorkerSpawner) -> Result<Self, SpawnError> {
        let mut child = spawner.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;
        Ok(Self {
            child,
            writer: FramedWrite::new(stdin, LineCodec::new()),
            stdout,
        })
    }

    /// Reap the worker and report its exit code (-1 when killed by a signal).
    async fn exit_code(&mut self) -> i32 {
        match self.child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                tracing::warn!(error = %e, "failed to reap worker");
                -1
            }
        }
    }

    async fn shutdown(mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

struct Submission {
    frame: Value,
    reply: oneshot::Sender<Result<Value, RelayError>>,
}

/// Handle for submitting requests to the supervised worker.
///
/// Cloneable; concurrent submits are queued and answered strictly in
/// submission order, one request in flight against the worker at a time.
#[derive(Clone)]
pub struct RelayHandle {
    submit_tx: mpsc::Sender<Submission>,
    state_rx: watch::Receiver<WorkerState>,
}

impl RelayHandle {
    /// Relay one request and wait for its single outcome.
    ///
    /// Serialization failure is reported here, before anything reaches the
    /// wire; it does not count toward the worker's failure streak. A worker
    /// failure while this request is in flight yields the corresponding
    /// spawn/write/exit/framing error.
    pub async fn submit<T: Serialize + ?Sized>(&self, request: &T) -> Result<Value, RelayError> {
        let frame =
            serde_json::to_value(request).map_err(|e| RelayError::Serialization(e.to_string()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit_tx
            .send(Submission {
                frame,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RelayError::FatallyStopped)?;
        reply_rx.await.map_err(|_| RelayError::FatallyStopped)?
    }

    /// Current lifecycle state of the worker.
    pub fn state(&self) -> WorkerState {
        *self.state_rx.borrow()
    }
}

enum ServeEnd {
    Failure(RelayError),
    /// Every handle is gone; no more requests can arrive.
    HandlesDropped,
}

/// Owns the worker process, the pending-request queue, and the failure streak.
pub struct WorkerSupervisor {
    config: RelayConfig,
    fails: FailureCounter,
    queue: VecDeque<Submission>,
    in_flight: Option<oneshot::Sender<Result<Value, RelayError>>>,
    state_tx: watch::Sender<WorkerState>,
}

impl WorkerSupervisor {
    /// Spawn the worker and the supervision task, returning a submit handle.
    pub fn start(config: RelayConfig) -> RelayHandle {
        let (submit_tx, submit_rx) = mpsc::channel(SUBMIT_QUEUE_DEPTH);
        let (state_tx, state_rx) = watch::channel(WorkerState::Starting);
        let supervisor = Self {
            fails: FailureCounter::new(config.max_fails),
            config,
            queue: VecDeque::new(),
            in_flight: None,
            state_tx,
        };
        tokio::spawn(supervisor.run(submit_rx));
        RelayHandle {
            submit_tx,
            state_rx,
        }
    }

    async fn run(mut self, mut submit_rx: mpsc::Receiver<Submission>) {
        loop {
            self.state_tx.send_replace(WorkerState::Starting);
            let mut worker = match WorkerProcess::spawn(self.config.spawner.as_ref()) {
                Ok(worker) => worker,
                Err(e) => {
                    match self.record_failure(RelayError::Spawn(e.to_string())) {
                        RestartDecision::Restart => {
                            self.state_tx.send_replace(WorkerState::Restarting);
                            continue;
                        }
                        RestartDecision::Escalate => return self.fatal(&mut submit_rx),
                    }
                }
            };
            self.state_tx.send_replace(WorkerState::Running);
            tracing::info!("worker running");

            match self.serve(&mut worker, &mut submit_rx).await {
                ServeEnd::Failure(err) => {
                    worker.shutdown().await;
                    match self.record_failure(err) {
                        RestartDecision::Restart => {
                            self.state_tx.send_replace(WorkerState::Restarting);
                            tracing::info!(
                                queued = self.queue.len(),
                                "restarting worker, queued requests will be replayed"
                            );
                        }
                        RestartDecision::Escalate => return self.fatal(&mut submit_rx),
                    }
                }
                ServeEnd::HandlesDropped => {
                    tracing::debug!("all handles dropped, stopping worker");
                    worker.shutdown().await;
                    return;
                }
            }
        }
    }

    /// Drive one worker instance until it fails or the handles go away.
    ///
    /// The inbound buffer and codec are scoped here, so a replacement worker
    /// always starts from an empty accumulator.
    async fn serve(
        &mut self,
        worker: &mut WorkerProcess,
        submit_rx: &mut mpsc::Receiver<Submission>,
    ) -> ServeEnd {
        let mut buf = BytesMut::new();
        let mut codec = LineCodec::<Value>::new();

        // Replay anything queued before the previous worker went down.
        if let Err(e) = self.pump(worker).await {
            return ServeEnd::Failure(e);
        }

        loop {
            tokio::select! {
                biased;

                read = worker.stdout.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        // The worker runs indefinitely by contract: EOF means it
                        // died or abandoned its output stream. Kill before reaping
                        // so a worker that merely closed stdout cannot stall the
                        // restart path.
                        let _ = worker.child.start_kill();
                        let code = worker.exit_code().await;
                        return ServeEnd::Failure(RelayError::UnexpectedExit { code });
                    }
                    Ok(_) => {
                        // Any inbound data breaks the failure streak, complete
                        // frame or not.
                        self.fails.reset();
                        loop {
                            match codec.decode(&mut buf) {
                                Ok(Some(response)) => self.complete(response),
                                Ok(None) => break,
                                Err(e) => {
                                    // The stream is in an unknown state past a
                                    // corrupt frame; drop the buffer with the worker.
                                    return ServeEnd::Failure(RelayError::Framing(e.to_string()));
                                }
                            }
                        }
                        if let Err(e) = self.pump(worker).await {
                            return ServeEnd::Failure(e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "worker stdout read failed");
                        let _ = worker.child.start_kill();
                        let code = worker.exit_code().await;
                        return ServeEnd::Failure(RelayError::UnexpectedExit { code });
                    }
                },

                submission = submit_rx.recv() => match submission {
                    Some(submission) => {
                        self.queue.push_back(submission);
                        if let Err(e) = self.pump(worker).await {
                            return ServeEnd::Failure(e);
                        }
                    }
                    None => return ServeEnd::HandlesDropped,
                },
            }
        }
    }

    /// Write the next queued request unless one is already outstanding.
    async fn pump(&mut self, worker: &mut WorkerProcess) -> Result<(), RelayError> {
        if self.in_flight.is_some() {
            return Ok(());
        }
        let Some(submission) = self.queue.pop_front() else {
            return Ok(());
        };
        self.in_flight = Some(submission.reply);
        worker
            .writer
            .send(submission.frame)
            .await
            .map_err(|e| RelayError::Write(e.to_string()))
    }

    /// Deliver a decoded response to the request at the head of the line.
    fn complete(&mut self, response: Value) {
        match self.in_flight.take() {
            Some(reply) => {
                let _ = reply.send(Ok(response));
            }
            None => {
                tracing::warn!("worker sent a response with no request in flight, dropping it");
            }
        }
    }

    /// Record one lifecycle failure: answer the in-flight request with the
    /// error and decide between restart and escalation.
    fn record_failure(&mut self, err: RelayError) -> RestartDecision {
        let decision = self.fails.record();
        tracing::error!(
            error = %err,
            consecutive_failures = self.fails.count(),
            "worker failure"
        );
        if let Some(reply) = self.in_flight.take() {
            let _ = reply.send(Err(err));
        }
        decision
    }

    /// Terminal path: reject everything pending, then hand off to escalation.
    fn fatal(&mut self, submit_rx: &mut mpsc::Receiver<Submission>) {
        self.state_tx.send_replace(WorkerState::FatallyStopped);
        submit_rx.close();
        while let Ok(submission) = submit_rx.try_recv() {
            self.queue.push_back(submission);
        }
        for submission in self.queue.drain(..) {
            let _ = submission.reply.send(Err(RelayError::FatallyStopped));
        }
        self.config.escalation.fatal(self.fails.count());
    }
}
