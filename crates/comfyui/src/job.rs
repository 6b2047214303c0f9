//! Single-job submission over one connection.
//!
//! [`JobClient::submit`] queues a [`Job`]'s graph, demultiplexes the
//! connection's events for the returned prompt id, then decodes and
//! writes every output image:
//!
//! 1. labels in lexicographic order,
//! 2. payloads of one label in arrival order,
//! 3. `{prefix}_{label}.png`, then `{prefix}_{label}_{n}.png`.
//!
//! Files already written stay on disk when a later step fails.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use naturalis_core::naming;
use naturalis_core::timing::Stopwatch;

use crate::api::{ComfyUIApiError, Enqueue};
use crate::client::{Transport, TransportError};
use crate::demux::{DemuxError, DemuxOutput, EventDemultiplexer};
use crate::workflow::OutputSlots;

/// A workflow bound to one input image, ready for submission.
///
/// Built with [`WorkflowDescriptor::job`](crate::workflow::WorkflowDescriptor::job).
#[derive(Debug, Clone)]
pub struct Job {
    /// Workflow graph with the input image bound.
    pub graph: serde_json::Value,
    /// Node id -> output label, shared with the descriptor.
    pub output_slots: Arc<OutputSlots>,
    /// The input image.
    pub source: PathBuf,
    /// Path prefix for written outputs.
    pub output_prefix: PathBuf,
}

/// A file the server writes to a fixed path, copied next to each job's
/// outputs.
///
/// Correlation is by path only: if two clients share the server, a copy
/// may belong to the other client's job.
#[derive(Debug, Clone)]
pub struct SideArtifact {
    pub path: PathBuf,
    /// Before queueing each job, remove the file at `path` and every
    /// `*.png` and `*.mp4` under its directory, subdirectories included.
    /// Point `path` into a directory holding only server renders.
    pub clear_before_submit: bool,
}

/// Render outputs removed from the side artifact's directory.
const STALE_RENDER_PATTERNS: [&str; 2] = ["**/*.png", "**/*.mp4"];

/// Per-job behaviour shared by all jobs of a session.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Upper bound on waiting for the prompt to finish; `None` waits forever.
    pub completion_timeout: Option<Duration>,
    pub side_artifact: Option<SideArtifact>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            completion_timeout: Some(Duration::from_secs(600)),
            side_artifact: None,
        }
    }
}

/// One decoded and written output image.
#[derive(Debug, Clone)]
pub struct OutputImage {
    pub path: PathBuf,
    pub image: image::DynamicImage,
}

/// A payload that could not be decoded and was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFailure {
    pub label: String,
    /// Arrival index of the payload within its label.
    pub index: usize,
    pub message: String,
}

/// Everything a finished job produced.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub source: PathBuf,
    pub prompt_id: String,
    /// Label -> images in arrival order; iterates labels sorted.
    pub images: BTreeMap<String, Vec<OutputImage>>,
    /// Where the side artifact was copied to, if it existed.
    pub side_artifact: Option<PathBuf>,
    pub decode_failures: Vec<DecodeFailure>,
    pub elapsed: Duration,
}

impl JobResult {
    pub fn image_count(&self) -> usize {
        self.images.values().map(Vec::len).sum()
    }

    /// Images in write order: sorted labels, then arrival.
    pub fn ordered_images(&self) -> impl Iterator<Item = (&str, &OutputImage)> {
        self.images
            .iter()
            .flat_map(|(label, images)| images.iter().map(move |image| (label.as_str(), image)))
    }

    /// True when at least one payload failed to decode.
    pub fn is_partial(&self) -> bool {
        !self.decode_failures.is_empty()
    }
}

/// Terminal failure of one job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Failed to queue prompt: {0}")]
    Enqueue(#[from] ComfyUIApiError),

    #[error("Transport failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Event stream ended before prompt {prompt_id} finished")]
    StreamInterrupted { prompt_id: String },

    #[error("Prompt {prompt_id} did not finish within {waited:?}")]
    Timeout { prompt_id: String, waited: Duration },

    #[error("Prompt {prompt_id} failed in node {node_id}: {message}")]
    Execution {
        prompt_id: String,
        node_id: String,
        message: String,
    },

    #[error("Failed to write {path}: {source}")]
    Persist {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("Output writer failed: {0}")]
    Worker(String),

    #[error("Session stopped before the job ran")]
    SessionClosed,
}

impl JobError {
    /// Whether a reconnect-and-retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::Transport(_) | JobError::StreamInterrupted { .. }
        )
    }

    /// Whether the connection the job ran on must be discarded.
    ///
    /// After a timeout the server may still send events for the
    /// abandoned prompt, so the connection is not reused either.
    pub fn invalidates_connection(&self) -> bool {
        self.is_retryable() || matches!(self, JobError::Timeout { .. })
    }
}

impl From<DemuxError> for JobError {
    fn from(err: DemuxError) -> Self {
        match err {
            DemuxError::Transport(e) => JobError::Transport(e),
            DemuxError::StreamInterrupted { prompt_id } => JobError::StreamInterrupted { prompt_id },
            DemuxError::Execution {
                prompt_id,
                node_id,
                message,
            } => JobError::Execution {
                prompt_id,
                node_id,
                message,
            },
        }
    }
}

/// Submits jobs through an [`Enqueue`] side-channel and a [`Transport`].
pub struct JobClient<E> {
    enqueuer: E,
    options: JobOptions,
}

impl<E: Enqueue> JobClient<E> {
    pub fn new(enqueuer: E, options: JobOptions) -> Self {
        Self { enqueuer, options }
    }

    /// Run `job` to completion on `transport`.
    pub async fn submit<T>(
        &self,
        transport: &mut T,
        client_id: &str,
        job: &Job,
    ) -> Result<JobResult, JobError>
    where
        T: Transport + ?Sized,
    {
        let mut stopwatch = Stopwatch::start();
        self.clear_side_artifact().await;

        tracing::info!(source = %job.source.display(), "Sending new query");
        let prompt_id = self.enqueuer.enqueue(&job.graph, client_id).await?;
        tracing::debug!(prompt_id = %prompt_id, lap_ms = stopwatch.lap_ms(), "Prompt queued");

        let demux = EventDemultiplexer::new(&prompt_id, &job.output_slots);
        let outputs = match self.options.completion_timeout {
            Some(limit) => tokio::time::timeout(limit, demux.run(transport.events()))
                .await
                .map_err(|_| JobError::Timeout {
                    prompt_id: prompt_id.clone(),
                    waited: limit,
                })??,
            None => demux.run(transport.events()).await?,
        };

        let payloads: usize = outputs.values().map(Vec::len).sum();
        tracing::info!(
            prompt_id = %prompt_id,
            labels = outputs.len(),
            payloads,
            lap_ms = stopwatch.lap_ms(),
            "Received images from the server",
        );

        let prefix = job.output_prefix.clone();
        let (images, decode_failures) =
            tokio::task::spawn_blocking(move || persist_outputs(&prefix, outputs))
                .await
                .map_err(|e| JobError::Worker(e.to_string()))??;

        let side_artifact = self.copy_side_artifact(&job.output_prefix).await;

        tracing::info!(
            prompt_id = %prompt_id,
            written = images.values().map(Vec::len).sum::<usize>(),
            failed = decode_failures.len(),
            lap_ms = stopwatch.lap_ms(),
            "Finished writing to disk",
        );

        Ok(JobResult {
            source: job.source.clone(),
            prompt_id,
            images,
            side_artifact,
            decode_failures,
            elapsed: stopwatch.total(),
        })
    }

    async fn clear_side_artifact(&self) {
        let Some(artifact) = &self.options.side_artifact else {
            return;
        };
        if !artifact.clear_before_submit {
            return;
        }
        let path = artifact.path.clone();
        match tokio::task::spawn_blocking(move || clear_render_dir(&path)).await {
            Ok(removed) => {
                tracing::debug!(path = %artifact.path.display(), removed, "Cleared stale renders");
            }
            Err(e) => {
                tracing::warn!(path = %artifact.path.display(), error = %e, "Stale render cleanup failed");
            }
        }
    }

    async fn copy_side_artifact(&self, prefix: &Path) -> Option<PathBuf> {
        let artifact = self.options.side_artifact.as_ref()?;
        if tokio::fs::metadata(&artifact.path).await.is_err() {
            tracing::debug!(path = %artifact.path.display(), "No side artifact to copy");
            return None;
        }

        let target = naming::side_artifact_path(prefix, &artifact.path);
        match tokio::fs::copy(&artifact.path, &target).await {
            Ok(_) => Some(target),
            Err(e) => {
                tracing::warn!(
                    from = %artifact.path.display(),
                    to = %target.display(),
                    error = %e,
                    "Failed to copy side artifact",
                );
                None
            }
        }
    }
}

/// Remove `artifact` and the stale renders around it. Returns the number
/// of files removed; failures are logged and skipped.
fn clear_render_dir(artifact: &Path) -> usize {
    let mut removed = 0;
    match std::fs::remove_file(artifact) {
        Ok(()) => removed += 1,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %artifact.display(), error = %e, "Failed to remove stale side artifact");
        }
    }

    let Some(dir) = artifact.parent().filter(|dir| !dir.as_os_str().is_empty()) else {
        return removed;
    };
    let root = glob::Pattern::escape(&dir.to_string_lossy());
    for pattern in STALE_RENDER_PATTERNS {
        let paths = match glob::glob(&format!("{root}/{pattern}")) {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Invalid cleanup pattern");
                continue;
            }
        };
        for path in paths.flatten().filter(|p| p.is_file()) {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale render");
                }
            }
        }
    }
    removed
}

/// Decode and write every payload, sorted label first.
fn persist_outputs(
    prefix: &Path,
    outputs: DemuxOutput,
) -> Result<(BTreeMap<String, Vec<OutputImage>>, Vec<DecodeFailure>), JobError> {
    let mut images: BTreeMap<String, Vec<OutputImage>> = BTreeMap::new();
    let mut failures = Vec::new();

    for (label, payloads) in outputs {
        for (index, payload) in payloads.iter().enumerate() {
            let image = match image::load_from_memory(payload) {
                Ok(image) => image,
                Err(e) => {
                    tracing::warn!(label = %label, index, error = %e, "Skipping undecodable image");
                    failures.push(DecodeFailure {
                        label: label.clone(),
                        index,
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let path = naming::output_image_path(prefix, &label, index);
            image.save(&path).map_err(|source| JobError::Persist {
                path: path.clone(),
                source,
            })?;
            tracing::debug!(path = %path.display(), "Wrote output image");

            images
                .entry(label.clone())
                .or_default()
                .push(OutputImage { path, image });
        }
    }

    Ok((images, failures))
}
