use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{sse::{Event, Sse}, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::{cors::CorsLayer, services::ServeDir};
use uuid::Uuid;

use crate::client::RunpodClient;
use crate::config::RunCfg;
use crate::events::{BroadcastReporter, RunEvent};
use crate::io::{DiskSink, ImageSink, SaveError};
use crate::messages::ImageDescriptor;
use crate::orchestrator::{run_workflow, PollConfig, TerminalResult};

#[derive(Clone)]
pub struct AppState {
    client: Arc<RunpodClient>,
    sink: Arc<DiskSink>,
    poll: PollConfig,
    current_run: Arc<Mutex<Option<String>>>,
    events_tx: broadcast::Sender<RunEvent>,
}

impl AppState {
    pub fn new(client: Arc<RunpodClient>, sink: Arc<DiskSink>, poll: PollConfig) -> Self {
        let (tx, _rx) = broadcast::channel::<RunEvent>(256);
        Self {
            client,
            sink,
            poll,
            current_run: Arc::new(Mutex::new(None)),
            events_tx: tx,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let images = ServeDir::new(state.sink.out_dir());
    Router::new()
        .route("/api/run", post(start_run))
        .route("/api/run/current", get(get_current_run))
        .route("/api/run/{id}/events", get(run_events))
        .route("/api/save", post(save_image))
        .route("/api/images", get(list_images))
        .nest_service("/images", images)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(bind: String, cfg: RunCfg) -> Result<()> {
    cfg.validate()?;
    tokio::fs::create_dir_all(&cfg.output.out_dir)
        .await
        .with_context(|| format!("Failed to create output directory: {}", cfg.output.out_dir.display()))?;

    let client = RunpodClient::new(cfg.endpoint_url(), cfg.api_key()?.to_string(), cfg.request_timeout())
        .context("Failed to build HTTP client")?;
    let sink = DiskSink::new(cfg.output.out_dir.clone(), client.http().clone());
    let state = AppState::new(Arc::new(client), Arc::new(sink), cfg.poll_config());

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(bind = %bind, out_dir = %cfg.output.out_dir.display(), "comfy-cloud API listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[derive(Deserialize)]
struct RunReq {
    workflow: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct StartRunResp {
    run_id: String,
}

async fn start_run(
    State(st): State<AppState>,
    Json(req): Json<RunReq>,
) -> Result<Json<StartRunResp>, ApiErr> {
    if !req.workflow.is_object() {
        return Err(ApiErr::bad_request("'workflow' must be a JSON object (ComfyUI API format)"));
    }

    let run_id = format!("run-{}", Uuid::new_v4());
    {
        let mut current = st.current_run.lock().await;
        if let Some(existing_id) = &*current {
            return Err(ApiErr::run_already_active(existing_id));
        }
        *current = Some(run_id.clone());
    }

    let task = tokio::spawn(execute_run(st.clone(), run_id.clone(), req.workflow));
    supervise(task, run_id.clone(), st.current_run.clone(), st.events_tx.clone());

    Ok(Json(StartRunResp { run_id }))
}

async fn execute_run(st: AppState, run_id: String, workflow: serde_json::Value) {
    // brief delay lets the SSE subscriber connect
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    let reporter = BroadcastReporter::new(run_id.clone(), st.events_tx.clone());
    reporter.send(RunEvent::Started { run_id });

    let result = run_workflow(
        st.client.as_ref(),
        st.sink.as_ref(),
        &workflow,
        st.poll.clone(),
        &reporter,
        &reporter,
    )
    .await;

    match result {
        Ok(outcome) => {
            if let TerminalResult::Success { .. } = outcome.result {
                let saved = outcome.saved.iter().filter(|o| o.result.is_ok()).count();
                reporter.finished(&outcome.job_id, saved);
            }
        }
        Err(e) => reporter.failed(e.to_string()),
    }
}

/// Release the single-flight slot once `task` ends, however it ends.
fn supervise(
    task: JoinHandle<()>,
    run_id: String,
    current_run: Arc<Mutex<Option<String>>>,
    events_tx: broadcast::Sender<RunEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = task.await {
            tracing::error!(run_id = %run_id, error = %e, "Run task aborted");
            let _ = events_tx.send(RunEvent::Failed {
                run_id: run_id.clone(),
                error: format!("run aborted: {e}"),
            });
        }
        let mut current = current_run.lock().await;
        if current.as_deref() == Some(run_id.as_str()) {
            *current = None;
        }
    })
}

#[derive(Serialize)]
struct CurrentRunResp {
    run_id: Option<String>,
}

async fn get_current_run(State(st): State<AppState>) -> Json<CurrentRunResp> {
    let current = st.current_run.lock().await;
    Json(CurrentRunResp { run_id: current.clone() })
}

async fn run_events(
    State(st): State<AppState>,
    Path(run_id): Path<String>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, axum::Error>>> {
    let rx = st.events_tx.subscribe();

    let stream = BroadcastStream::new(rx)
        .filter_map(|msg| async move { msg.ok() })
        .filter(move |evt: &RunEvent| futures_util::future::ready(evt.run_id() == run_id))
        .map(|evt| Event::default().event("message").json_data(&evt));

    Sse::new(stream)
}

#[derive(Deserialize)]
struct SaveReq {
    filename: Option<String>,
    data: Option<String>,
    url: Option<String>,
}

#[derive(Serialize)]
struct SaveResp {
    filename: String,
    path: PathBuf,
}

async fn save_image(
    State(st): State<AppState>,
    Json(req): Json<SaveReq>,
) -> Result<Json<SaveResp>, ApiErr> {
    let image = ImageDescriptor {
        filename: req.filename,
        data: req.data,
        url: req.url,
    };
    match st.sink.save(&image).await {
        Ok(saved) => Ok(Json(SaveResp {
            filename: saved.filename,
            path: saved.path,
        })),
        Err(SaveError::MissingData) => Err(ApiErr::bad_request("No image data or URL provided")),
        Err(e @ (SaveError::Download(_) | SaveError::DownloadStatus(_))) => Err(ApiErr::bad_gateway(e)),
        Err(SaveError::Decode(e)) => Err(ApiErr::bad_request(format!("Invalid image data: {e}"))),
        Err(e) => Err(ApiErr::internal(e)),
    }
}

#[derive(Serialize)]
struct ImageItem {
    name: String,
    url: String,
    modified_at: Option<DateTime<Utc>>,
}

async fn list_images(State(st): State<AppState>) -> Result<Json<Vec<ImageItem>>, ApiErr> {
    let mut items = vec![];
    let mut rd = tokio::fs::read_dir(st.sink.out_dir()).await.map_err(ApiErr::internal)?;
    while let Some(ent) = rd.next_entry().await.map_err(ApiErr::internal)? {
        let path = ent.path();
        if !is_image_file(&path) {
            continue;
        }
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let modified_at = ent
            .metadata()
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);

        items.push(ImageItem {
            url: format!("/images/{name}"),
            name,
            modified_at,
        });
    }

    items.sort_by_key(|i| std::cmp::Reverse(i.modified_at));
    Ok(Json(items))
}

fn is_image_file(path: &FsPath) -> bool {
    matches!(
        path.extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_ascii_lowercase())
            .as_deref(),
        Some("png" | "jpg" | "jpeg" | "webp")
    )
}

#[derive(Debug)]
struct ApiErr {
    status: StatusCode,
    code: String,
    message: String,
    suggestion: Option<String>,
}

impl ApiErr {
    fn internal(e: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error".to_string(),
            message: format!("Internal error: {}", e),
            suggestion: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request".to_string(),
            message: message.into(),
            suggestion: None,
        }
    }

    fn bad_gateway(e: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            code: "upstream_error".to_string(),
            message: e.to_string(),
            suggestion: None,
        }
    }

    fn run_already_active(run_id: &str) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            code: "run_already_active".to_string(),
            message: format!("A run is already in progress: {}", run_id),
            suggestion: Some("Wait for the current run to finish, or follow it via /api/run/{id}/events.".to_string()),
        }
    }
}

impl IntoResponse for ApiErr {
    fn into_response(self) -> axum::response::Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            code: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            suggestion: Option<String>,
        }
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
                code: self.code,
                suggestion: self.suggestion,
            }),
        )
            .into_response()
    }
}
