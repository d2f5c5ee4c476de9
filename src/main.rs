use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use comfy_cloud::client::RunpodClient;
use comfy_cloud::config::RunCfg;
use comfy_cloud::io::DiskSink;
use comfy_cloud::orchestrator::{run_workflow, TerminalResult};
use comfy_cloud::progress::ConsoleReporter;

#[derive(Parser)]
#[command(name = "comfy-cloud")]
#[command(about = "Run ComfyUI workflows on a RunPod serverless endpoint")]
#[command(version)]
struct Cli {
    /// YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a workflow, follow its progress and save the images
    Run {
        /// Path to the workflow JSON file (ComfyUI API format)
        workflow: PathBuf,

        /// Directory to save output images
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Endpoint URL, e.g. https://api.runpod.ai/v2/<endpoint-id>
        #[arg(long)]
        endpoint: Option<String>,

        /// API key (defaults to $RUNPOD_API_KEY)
        #[arg(long)]
        api_key: Option<String>,
    },

    /// Serve the HTTP API (run, progress events, save, gallery)
    Serve {
        #[arg(long, default_value = "127.0.0.1:8189")]
        bind: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = RunCfg::load(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Run {
            workflow,
            output_dir,
            endpoint,
            api_key,
        } => {
            if let Some(url) = endpoint {
                cfg.endpoint.url = url;
            }
            if let Some(key) = api_key {
                cfg.endpoint.api_key = Some(key);
            }
            if let Some(dir) = output_dir {
                cfg.output.out_dir = dir;
            }
            run_command(&cfg, &workflow).await
        }
        Commands::Serve { bind } => comfy_cloud::api::serve(bind, cfg).await,
    }
}

async fn run_command(cfg: &RunCfg, workflow_path: &Path) -> Result<()> {
    cfg.validate()?;

    let txt = tokio::fs::read_to_string(workflow_path)
        .await
        .with_context(|| format!("Failed to read workflow: {}", workflow_path.display()))?;
    let raw: serde_json::Value = serde_json::from_str(&txt).context("Workflow is not valid JSON")?;
    let workflow = unwrap_workflow(raw);
    if !workflow.is_object() {
        bail!("workflow must be a JSON object (ComfyUI API format)");
    }

    let client = RunpodClient::new(cfg.endpoint_url(), cfg.api_key()?.to_string(), cfg.request_timeout())
        .context("Failed to build HTTP client")?;
    let sink = DiskSink::new(cfg.output.out_dir.clone(), client.http().clone());
    let console = ConsoleReporter::new();

    tracing::info!(workflow = %workflow_path.display(), endpoint = client.endpoint(), "Submitting workflow");
    let outcome = run_workflow(&client, &sink, &workflow, cfg.poll_config(), &console, &console).await?;
    console.finish();

    println!("{}", serde_json::to_string_pretty(&outcome)?);

    match &outcome.result {
        TerminalResult::Success { .. } => Ok(()),
        TerminalResult::Failure { error } => bail!("job {} failed: {error}", outcome.job_id),
        TerminalResult::Timeout => bail!("job {} timed out waiting for results", outcome.job_id),
    }
}

/// Accept a bare workflow or one wrapped as `{"workflow": ..}` / `{"input": {"workflow": ..}}`.
fn unwrap_workflow(raw: serde_json::Value) -> serde_json::Value {
    let inner = raw
        .get("input")
        .and_then(|i| i.get("workflow"))
        .or_else(|| raw.get("workflow"))
        .cloned();
    inner.unwrap_or(raw)
}
