//! Planning and running jobs for the two CLI modes.
//!
//! Single mode runs one input image with a caller-chosen output prefix.
//! Directory mode runs every `*.png` and `*.jpg` file of a source
//! directory, sorted by path, writing each one's outputs to
//! `{target_dir}/{file_stem}_{label}.png`. Both modes submit through one
//! [`SessionManager`] and wait for the tickets in submission order.

use std::path::{Path, PathBuf};

use naturalis_comfyui::job::Job;
use naturalis_comfyui::session::SessionManager;
use naturalis_comfyui::workflow::WorkflowDescriptor;
use naturalis_core::naming;
use naturalis_core::timing::Stopwatch;

/// File extensions picked up in directory mode.
pub const INPUT_EXTENSIONS: [&str; 2] = ["png", "jpg"];

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("Source directory {} does not exist", .0.display())]
    MissingSourceDir(PathBuf),

    #[error("Target directory {} does not exist", .0.display())]
    MissingTargetDir(PathBuf),

    #[error("Failed to list {}: {source}", path.display())]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Per-run tally of job outcomes.
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub succeeded: usize,
    /// Jobs that finished with at least one undecodable payload.
    pub partial: usize,
    /// Source path and error message of every failed job.
    pub failed: Vec<(PathBuf, String)>,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Input images of `dir` with an accepted extension, sorted by path.
pub fn collect_inputs(dir: &Path) -> Result<Vec<PathBuf>, BatchError> {
    let entries = std::fs::read_dir(dir).map_err(|source| BatchError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut inputs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| BatchError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() && has_input_extension(&path) {
            inputs.push(path);
        }
    }
    inputs.sort();
    Ok(inputs)
}

fn has_input_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| INPUT_EXTENSIONS.contains(&ext))
}

/// One job per input image of `source_dir`, writing into `target_dir`.
pub fn plan_directory(
    descriptor: &WorkflowDescriptor,
    source_dir: &Path,
    target_dir: &Path,
) -> Result<Vec<Job>, BatchError> {
    if !source_dir.is_dir() {
        return Err(BatchError::MissingSourceDir(source_dir.to_path_buf()));
    }
    if !target_dir.is_dir() {
        return Err(BatchError::MissingTargetDir(target_dir.to_path_buf()));
    }

    let jobs: Vec<Job> = collect_inputs(source_dir)?
        .into_iter()
        .map(|source| {
            let prefix = naming::prefix_in_dir(target_dir, &source);
            descriptor.job(source, prefix)
        })
        .collect();

    tracing::info!(
        source_dir = %source_dir.display(),
        target_dir = %target_dir.display(),
        jobs = jobs.len(),
        "Planned directory run",
    );
    Ok(jobs)
}

/// Submit every job, then wait for each outcome in submission order.
pub async fn run_jobs(session: &SessionManager, jobs: Vec<Job>) -> BatchSummary {
    let stopwatch = Stopwatch::start();
    let tickets: Vec<_> = jobs
        .into_iter()
        .map(|job| (job.source.clone(), session.submit(job)))
        .collect();

    let mut summary = BatchSummary::default();
    for (source, ticket) in tickets {
        match ticket.outcome().await {
            Ok(result) => {
                summary.succeeded += 1;
                if result.is_partial() {
                    summary.partial += 1;
                    tracing::warn!(
                        source = %source.display(),
                        failed = result.decode_failures.len(),
                        "Some outputs could not be decoded",
                    );
                }
                for (label, image) in result.ordered_images() {
                    tracing::debug!(label, path = %image.path.display(), "Output");
                }
            }
            Err(e) => {
                tracing::error!(source = %source.display(), error = %e, "Job failed");
                summary.failed.push((source, e.to_string()));
            }
        }
    }

    tracing::info!(
        total = summary.total(),
        succeeded = summary.succeeded,
        partial = summary.partial,
        failed = summary.failed.len(),
        elapsed_ms = stopwatch.total().as_millis() as u64,
        "Run finished",
    );
    summary
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use naturalis_comfyui::reconnect::ReconnectConfig;
    use naturalis_comfyui::session::SessionConfig;
    use naturalis_comfyui::{ComfyUIApi, ComfyUIClient};

    use super::*;

    fn descriptor() -> WorkflowDescriptor {
        WorkflowDescriptor::from_json_str(
            r#"{
                "1": {"class_type": "LoadImage", "_meta": {"title": "INPUT_0"}, "inputs": {"image": "x"}},
                "2": {"class_type": "SaveImageWebsocket", "_meta": {"title": "OUT_face"}, "inputs": {}}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn collects_png_and_jpg_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.jpg", "a.png", "c.webp", "notes.txt", "d.PNG"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        fs::create_dir(dir.path().join("e.png")).unwrap();

        let inputs = collect_inputs(dir.path()).unwrap();
        assert_eq!(
            inputs,
            vec![dir.path().join("a.png"), dir.path().join("b.jpg")]
        );
    }

    #[test]
    fn plans_one_job_per_input_with_stem_prefix() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        fs::write(source.path().join("cat.png"), b"").unwrap();
        fs::write(source.path().join("dog.jpg"), b"").unwrap();

        let jobs = plan_directory(&descriptor(), source.path(), target.path()).unwrap();

        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].source, source.path().join("cat.png"));
        assert_eq!(jobs[0].output_prefix, target.path().join("cat"));
        assert_eq!(jobs[1].output_prefix, target.path().join("dog"));
        assert_eq!(
            jobs[1].graph["1"]["inputs"]["image"],
            source.path().join("dog.jpg").to_string_lossy().as_ref()
        );
    }

    #[test]
    fn missing_directories_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");

        assert!(matches!(
            plan_directory(&descriptor(), &missing, dir.path()),
            Err(BatchError::MissingSourceDir(p)) if p == missing
        ));
        assert!(matches!(
            plan_directory(&descriptor(), dir.path(), &missing),
            Err(BatchError::MissingTargetDir(p)) if p == missing
        ));
    }

    #[tokio::test]
    async fn unreachable_server_fails_every_job() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig {
            reconnect: ReconnectConfig {
                delay: Duration::from_millis(1),
                max_job_retries: 1,
            },
            ..Default::default()
        };
        let session = SessionManager::start(
            ComfyUIClient::new("ws://127.0.0.1:9"),
            ComfyUIApi::new("http://127.0.0.1:9", Duration::from_secs(5)).unwrap(),
            config,
        );

        let wf = descriptor();
        let jobs = vec![
            wf.job("a.png", dir.path().join("a")),
            wf.job("b.png", dir.path().join("b")),
        ];
        let summary = run_jobs(&session, jobs).await;
        session.shutdown().await;

        assert_eq!(summary.total(), 2);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.failed[0].0, PathBuf::from("a.png"));
        assert!(!summary.all_succeeded());
    }
}
