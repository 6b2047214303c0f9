//! `naturalis-worker` -- runs input images through a ComfyUI workflow.
//!
//! Loads an API-format workflow, binds each input image to its
//! `INPUT_0` node, queues it on a ComfyUI server and writes every
//! `SaveImageWebsocket` output next to the given prefix.
//!
//! ```bash
//! # One image: writes ./out/sketch_face.png, ...
//! naturalis-worker ./in/sketch.jpg ./out/sketch
//!
//! # Every *.png / *.jpg of ./in into ./out
//! naturalis-worker --dir ./in ./out
//! ```
//!
//! Server address, timeouts and retries come from the environment; see
//! [`WorkerConfig::from_env`](naturalis_worker::config::WorkerConfig::from_env).

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use naturalis_comfyui::{ComfyUIApi, ComfyUIClient, SessionManager, WorkflowDescriptor};
use naturalis_worker::batch;
use naturalis_worker::config::WorkerConfig;

#[derive(Debug, Parser)]
#[command(name = "naturalis-worker")]
#[command(about = "Run images through a ComfyUI workflow")]
#[command(version)]
struct Cli {
    /// Input image, or the source directory with `--dir`.
    #[arg(value_name = "IMAGE_IN")]
    image_in: PathBuf,

    /// Output path prefix, or the target directory with `--dir`.
    #[arg(value_name = "IMAGE_OUT_PREFIX")]
    image_out_prefix: PathBuf,

    /// API-format workflow JSON exported from ComfyUI.
    #[arg(long, default_value = "./template/workflow_api.json")]
    workflow_file: PathBuf,

    /// Treat both positionals as directories and process every image.
    #[arg(long)]
    dir: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "naturalis_worker=info,naturalis_comfyui=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;

    let descriptor = WorkflowDescriptor::load_file(&cli.workflow_file).with_context(|| {
        format!("Failed to load workflow {}", cli.workflow_file.display())
    })?;
    tracing::info!(
        workflow = %cli.workflow_file.display(),
        input_node = %descriptor.input_node().node_id,
        outputs = descriptor.output_slots().len(),
        "Workflow loaded",
    );

    let jobs = if cli.dir {
        batch::plan_directory(&descriptor, &cli.image_in, &cli.image_out_prefix)?
    } else {
        vec![descriptor.job(&cli.image_in, &cli.image_out_prefix)]
    };

    tracing::info!(
        address = %config.comfyui_address,
        jobs = jobs.len(),
        "Starting naturalis-worker",
    );

    let api = ComfyUIApi::new(config.api_url(), config.enqueue_timeout)
        .context("Failed to build the HTTP client")?;
    let session = SessionManager::start(ComfyUIClient::new(config.ws_url()), api, config.session);
    let summary = batch::run_jobs(&session, jobs).await;
    session.shutdown().await;

    if !summary.all_succeeded() {
        anyhow::bail!(
            "{} of {} jobs failed",
            summary.failed.len(),
            summary.total()
        );
    }
    Ok(())
}
