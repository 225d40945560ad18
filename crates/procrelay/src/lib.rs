//! procrelay: supervised newline-delimited JSON bridge to a worker subprocess.
//!
//! A long-lived worker process speaks one JSON frame per line over its
//! stdin/stdout pipes. The supervisor relays one request and one response per
//! invocation, restarts the worker after failures, and escalates to a host
//! exit once failures stay consecutive past a bounded limit.

pub mod bridge;
mod restart;
mod supervisor;
pub mod worker;

pub use restart::{DEFAULT_MAX_FAILS, FailureCounter, RestartDecision};
pub use supervisor::{
    CommandSpawner, Escalation, ExitProcess, RelayConfig, RelayError, RelayHandle, SpawnError,
    WorkerSpawner, WorkerState, WorkerSupervisor,
};
pub use worker::{RequestHandler, run_worker, run_worker_stdio};
