//! Events emitted by a session worker.
//!
//! Broadcast to every receiver obtained from
//! [`SessionManager::subscribe`](crate::session::SessionManager::subscribe).
//! They report what the worker did; job outcomes themselves are only
//! delivered through each job's ticket.

use std::path::PathBuf;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub enum SessionEvent {
    /// A new connection was established.
    Connected { client_id: String },

    /// The current connection was discarded.
    Disconnected { client_id: String, reason: String },

    /// The worker dequeued a job and started it.
    JobStarted { source: PathBuf },

    /// A job failed with a retryable error and is being retried.
    JobRetrying {
        source: PathBuf,
        retry: u32,
        error: String,
    },

    /// A job finished and its outputs were written.
    JobCompleted {
        source: PathBuf,
        prompt_id: String,
        images: usize,
        decode_failures: usize,
    },

    /// A job failed for good.
    JobFailed { source: PathBuf, error: String },

    /// The worker dequeued the stop sentinel and exited.
    Stopped,
}
