use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, Instant};

use crate::client::{JobEndpoint, SubmissionError};
use crate::io::{save_all, ImageSink, SaveOutcome};
use crate::messages::{EventPayload, ImageDescriptor, JobStatus, PayloadKind};
use crate::progress::{ProgressReporter, ProgressUpdate, ResultConsumer};
use crate::state::{Phase, RunState};

#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Fixed delay between ticks, awaited even after a productive tick.
    pub interval: Duration,
    /// Wall-clock budget for observing one job.
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// How a job ended. Produced exactly once per run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalResult {
    Success { images: Vec<ImageDescriptor> },
    Failure { error: String },
    Timeout,
}

impl TerminalResult {
    /// Turn a terminal payload into a result. A payload with neither
    /// usable images nor an error counts as a failure.
    fn from_payload(payload: EventPayload) -> Self {
        match payload.classify() {
            PayloadKind::Error(error) => TerminalResult::Failure {
                error: error.to_string(),
            },
            PayloadKind::Images(images) if !images.is_empty() => TerminalResult::Success {
                images: images.to_vec(),
            },
            _ => TerminalResult::Failure {
                error: "No images in output".to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TerminalResult::Success { .. })
    }
}

/// Observes one job through its stream and status channels and folds
/// both into a single [`RunState`].
pub struct Reconciler<'a> {
    endpoint: &'a dyn JobEndpoint,
    reporter: &'a dyn ProgressReporter,
    job_id: String,
    config: PollConfig,
    seen: HashSet<i64>,
    state: RunState,
    started: Instant,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        endpoint: &'a dyn JobEndpoint,
        reporter: &'a dyn ProgressReporter,
        job_id: impl Into<String>,
        config: PollConfig,
    ) -> Self {
        Self {
            endpoint,
            reporter,
            job_id: job_id.into(),
            config,
            seen: HashSet::new(),
            state: RunState::new(),
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Drive ticks until a terminal result or the deadline.
    pub async fn run(&mut self) -> TerminalResult {
        let deadline = self.started + self.config.timeout;
        let result = match tokio::time::timeout_at(deadline, self.poll_until_terminal()).await {
            Ok(result) => result,
            Err(_) => TerminalResult::Timeout,
        };

        match &result {
            TerminalResult::Success { images } => {
                tracing::info!(job_id = %self.job_id, images = images.len(), "Job completed");
            }
            TerminalResult::Failure { error } => {
                self.state.fail();
                tracing::warn!(job_id = %self.job_id, error = %error, "Job failed");
            }
            TerminalResult::Timeout => {
                self.state.fail();
                tracing::warn!(
                    job_id = %self.job_id,
                    elapsed_ms = self.started.elapsed().as_millis() as u64,
                    "Timed out waiting for results"
                );
            }
        }
        result
    }

    async fn poll_until_terminal(&mut self) -> TerminalResult {
        loop {
            if let Some(result) = self.tick().await {
                return result;
            }
            sleep(self.config.interval).await;
        }
    }

    /// One observation round: stream first, then status.
    pub async fn tick(&mut self) -> Option<TerminalResult> {
        let mut pending_success = None;

        if let Some(events) = self.endpoint.poll_stream(&self.job_id).await {
            for event in events {
                if !self.seen.insert(event.index) {
                    continue;
                }
                match event.output.classify() {
                    PayloadKind::Error(error) => {
                        tracing::debug!(job_id = %self.job_id, index = event.index, "Stream reported error");
                        return Some(TerminalResult::Failure {
                            error: error.to_string(),
                        });
                    }
                    PayloadKind::Images(_) => pending_success = Some(event.output.clone()),
                    PayloadKind::Progress => {
                        self.state.fold(&event.output, Instant::now());
                    }
                }
            }
        }

        self.reporter.report(&self.snapshot());

        if let Some(payload) = pending_success {
            return Some(TerminalResult::from_payload(payload));
        }

        let report = self.endpoint.poll_status(&self.job_id).await?;
        match report.job_status() {
            JobStatus::Completed => Some(TerminalResult::from_payload(report.terminal_payload())),
            JobStatus::Failed => {
                let mut error = format!(
                    "Job failed after {:.1}s",
                    self.started.elapsed().as_secs_f64()
                );
                if let Some(detail) = report.error.as_deref().filter(|e| !e.is_empty()) {
                    error.push_str(": ");
                    error.push_str(detail);
                }
                Some(TerminalResult::Failure { error })
            }
            JobStatus::Pending(status) => {
                tracing::trace!(job_id = %self.job_id, status = %status, "Job still pending");
                None
            }
        }
    }

    fn snapshot(&self) -> ProgressUpdate {
        let elapsed = if self.state.elapsed() > 0.0 {
            self.state.elapsed()
        } else {
            self.started.elapsed().as_secs_f64()
        };
        ProgressUpdate {
            phase: self.state.phase(),
            message: self
                .state
                .status_text()
                .unwrap_or("Waiting for worker...")
                .to_string(),
            overall_percent: self.state.overall_percent(),
            step_percent: self.state.step_percent(),
            elapsed_secs: elapsed,
            eta_secs: self.state.eta_secs(),
        }
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub job_id: String,
    pub result: TerminalResult,
    pub saved: Vec<SaveOutcome>,
}

/// Submit `workflow`, observe the job to completion and persist its images.
///
/// Only a submission failure is an `Err`; job errors and timeouts come
/// back as the outcome's [`TerminalResult`].
pub async fn run_workflow(
    endpoint: &dyn JobEndpoint,
    sink: &dyn ImageSink,
    workflow: &serde_json::Value,
    config: PollConfig,
    reporter: &dyn ProgressReporter,
    consumer: &dyn ResultConsumer,
) -> Result<RunOutcome, SubmissionError> {
    reporter.report(&ProgressUpdate::new(Phase::Starting, "Submitting workflow..."));
    let job_id = endpoint.submit(workflow).await.map_err(|e| {
        tracing::error!(error = %e, "Workflow submission failed");
        e
    })?;
    tracing::info!(job_id = %job_id, "Job submitted");
    consumer.on_submitted(&job_id);
    let short: String = job_id.chars().take(12).collect();
    reporter.report(&ProgressUpdate::new(Phase::Starting, format!("Job submitted: {short}...")));

    let result = Reconciler::new(endpoint, reporter, job_id.clone(), config).run().await;
    consumer.on_result(&job_id, &result);

    let mut saved = Vec::new();
    match &result {
        TerminalResult::Success { images } => {
            reporter.report(
                &ProgressUpdate::new(Phase::Saving, format!("Saving {} image(s)...", images.len()))
                    .with_overall(Some(100.0)),
            );
            saved = save_all(sink, images).await;
            for outcome in &saved {
                consumer.on_image_saved(outcome);
            }
            let ok = saved.iter().filter(|o| o.result.is_ok()).count();
            reporter.report(
                &ProgressUpdate::new(Phase::Done, format!("Done: {ok} image(s) saved"))
                    .with_overall(Some(100.0)),
            );
        }
        TerminalResult::Failure { error } => {
            reporter.report(&ProgressUpdate::new(Phase::Error, format!("Error: {error}")));
        }
        TerminalResult::Timeout => {
            reporter.report(&ProgressUpdate::new(Phase::Error, "Timed out waiting for results"));
        }
    }

    Ok(RunOutcome {
        job_id,
        result,
        saved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::io::{SaveError, SavedImage};
    use crate::messages::{StatusReport, StreamEvent, StreamResponse};

    /// Plays back scripted responses; the last entry of each script repeats.
    #[derive(Default)]
    struct ScriptedEndpoint {
        submit_error: Option<u16>,
        streams: Mutex<VecDeque<Option<Vec<StreamEvent>>>>,
        statuses: Mutex<VecDeque<Option<StatusReport>>>,
        status_calls: AtomicUsize,
    }

    impl ScriptedEndpoint {
        fn new(streams: Vec<Option<serde_json::Value>>, statuses: Vec<Option<serde_json::Value>>) -> Self {
            let streams = streams
                .into_iter()
                .map(|s| s.map(|v| serde_json::from_value::<StreamResponse>(v).unwrap().stream))
                .collect();
            let statuses = statuses
                .into_iter()
                .map(|s| s.map(|v| serde_json::from_value(v).unwrap()))
                .collect();
            Self {
                streams: Mutex::new(streams),
                statuses: Mutex::new(statuses),
                ..Default::default()
            }
        }

        fn next<T: Clone>(script: &Mutex<VecDeque<Option<T>>>) -> Option<T> {
            let mut script = script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().flatten()
            } else {
                script.front().cloned().flatten()
            }
        }
    }

    #[async_trait]
    impl JobEndpoint for ScriptedEndpoint {
        async fn submit(&self, _workflow: &serde_json::Value) -> Result<String, SubmissionError> {
            match self.submit_error {
                Some(status) => Err(SubmissionError::Rejected {
                    status,
                    body: "nope".into(),
                }),
                None => Ok("abc123".into()),
            }
        }

        async fn poll_stream(&self, _job_id: &str) -> Option<Vec<StreamEvent>> {
            Self::next(&self.streams)
        }

        async fn poll_status(&self, _job_id: &str) -> Option<StatusReport> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            Self::next(&self.statuses)
        }
    }

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<ProgressUpdate>>,
        results: Mutex<Vec<TerminalResult>>,
        saved: Mutex<Vec<SaveOutcome>>,
    }

    impl ProgressReporter for Recorder {
        fn report(&self, update: &ProgressUpdate) {
            self.updates.lock().unwrap().push(update.clone());
        }
    }

    impl ResultConsumer for Recorder {
        fn on_result(&self, _job_id: &str, result: &TerminalResult) {
            self.results.lock().unwrap().push(result.clone());
        }

        fn on_image_saved(&self, outcome: &SaveOutcome) {
            self.saved.lock().unwrap().push(outcome.clone());
        }
    }

    /// Fails every image whose filename starts with `bad`.
    struct PickySink;

    #[async_trait]
    impl ImageSink for PickySink {
        async fn save(&self, image: &ImageDescriptor) -> Result<SavedImage, SaveError> {
            if image.filename().starts_with("bad") {
                return Err(SaveError::MissingData);
            }
            Ok(SavedImage {
                filename: image.filename().to_string(),
                path: format!("/out/{}", image.filename()).into(),
                width: None,
                height: None,
            })
        }
    }

    fn fast() -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(5),
            timeout: Duration::from_secs(5),
        }
    }

    fn running() -> Option<serde_json::Value> {
        Some(json!({"status": "IN_PROGRESS"}))
    }

    #[tokio::test]
    async fn progress_then_completed_status() {
        let endpoint = ScriptedEndpoint::new(
            vec![
                Some(json!({"stream": [{"index": 0, "output": {"status": "running"}}]})),
                Some(json!({"stream": [
                    {"index": 0, "output": {"status": "running"}},
                    {"index": 1, "output": {"node_index": 1, "total_nodes": 4}},
                ]})),
            ],
            vec![
                running(),
                Some(json!({"status": "COMPLETED", "output": {"images": [{"filename": "a.png", "data": "AA=="}]}})),
            ],
        );
        let recorder = Recorder::default();
        let mut reconciler = Reconciler::new(&endpoint, &recorder, "abc123", fast());

        assert_eq!(reconciler.tick().await, None);
        assert_eq!(reconciler.state().phase(), Phase::Executing);
        assert_eq!(reconciler.state().overall_percent(), None);

        let result = reconciler.tick().await.unwrap();
        assert_eq!(reconciler.state().nodes_done(), 1);
        assert_eq!(reconciler.state().overall_percent(), Some(25.0));
        match result {
            TerminalResult::Success { images } => assert_eq!(images[0].filename(), "a.png"),
            other => panic!("expected success, got {other:?}"),
        }

        let updates = recorder.updates.lock().unwrap();
        assert_eq!(updates[0].overall_percent, None);
        assert_eq!(updates[1].overall_percent, Some(25.0));
    }

    #[tokio::test]
    async fn repeated_and_reordered_snapshots_fold_each_index_once() {
        let endpoint = ScriptedEndpoint::new(
            vec![
                Some(json!({"stream": [
                    {"index": 2, "output": {"node_index": 2, "total_nodes": 10}},
                    {"index": 0, "output": {"node_index": 1}},
                ]})),
                Some(json!({"stream": [
                    {"index": 0, "output": {"node_index": 1}},
                    {"index": 2, "output": {"node_index": 2}},
                    {"index": 2, "output": {"node_index": 9}},
                ]})),
            ],
            vec![running()],
        );
        let recorder = Recorder::default();
        let mut reconciler = Reconciler::new(&endpoint, &recorder, "job", fast());

        for _ in 0..4 {
            assert_eq!(reconciler.tick().await, None);
        }
        // the second index-2 event was a duplicate and never folded
        assert_eq!(reconciler.state().nodes_done(), 2);
        assert_eq!(reconciler.seen.len(), 2);
    }

    #[tokio::test]
    async fn stream_error_short_circuits_the_tick() {
        let endpoint = ScriptedEndpoint::new(
            vec![Some(json!({"stream": [
                {"index": 0, "output": {"error": "CUDA out of memory", "node_index": 3}},
                {"index": 1, "output": {"node_index": 5, "total_nodes": 6}},
            ]}))],
            vec![running()],
        );
        let recorder = Recorder::default();
        let mut reconciler = Reconciler::new(&endpoint, &recorder, "job", fast());

        let result = reconciler.run().await;
        assert_eq!(
            result,
            TerminalResult::Failure {
                error: "CUDA out of memory".into()
            }
        );
        assert_eq!(reconciler.state().nodes_done(), 0);
        assert_eq!(reconciler.state().phase(), Phase::Error);
        assert_eq!(endpoint.status_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stream_success_wins_over_status_aggregate() {
        let endpoint = ScriptedEndpoint::new(
            vec![Some(json!({"stream": [
                {"index": 0, "output": {"images": [{"filename": "stream.png", "data": "AA=="}]}},
            ]}))],
            vec![Some(json!({"status": "COMPLETED", "output": {"images": [{"filename": "status.png"}]}}))],
        );
        let recorder = Recorder::default();
        let result = Reconciler::new(&endpoint, &recorder, "job", fast()).run().await;

        match result {
            TerminalResult::Success { images } => assert_eq!(images[0].filename(), "stream.png"),
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(endpoint.status_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_status_without_stream_reports_elapsed() {
        let endpoint = ScriptedEndpoint::new(
            vec![None],
            vec![None, running(), Some(json!({"status": "FAILED", "error": "worker crashed"}))],
        );
        let recorder = Recorder::default();
        let result = Reconciler::new(&endpoint, &recorder, "job", fast()).run().await;

        match result {
            TerminalResult::Failure { error } => {
                assert!(error.starts_with("Job failed after "), "{error}");
                assert!(error.ends_with("s: worker crashed"), "{error}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(endpoint.status_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_message_carries_elapsed_at_default_interval() {
        let endpoint = ScriptedEndpoint::new(
            vec![None],
            vec![None, running(), Some(json!({"status": "FAILED"}))],
        );
        let recorder = Recorder::default();
        let result = Reconciler::new(&endpoint, &recorder, "job", PollConfig::default()).run().await;

        // three ticks, two 500ms sleeps
        assert_eq!(
            result,
            TerminalResult::Failure {
                error: "Job failed after 1.0s".into()
            }
        );
    }

    #[tokio::test]
    async fn null_payload_next_to_error_still_fails_the_tick() {
        let endpoint = ScriptedEndpoint::new(
            vec![Some(json!({"stream": [
                {"index": 0, "output": {"error": "CUDA out of memory"}},
                {"index": 1, "output": null},
            ]}))],
            vec![running()],
        );
        let recorder = Recorder::default();
        let mut reconciler = Reconciler::new(&endpoint, &recorder, "job", fast());

        assert_eq!(
            reconciler.tick().await,
            Some(TerminalResult::Failure {
                error: "CUDA out of memory".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn eta_follows_the_paused_clock() {
        let endpoint = ScriptedEndpoint::new(
            vec![
                Some(json!({"stream": [{"index": 0, "output": {"node_index": 1, "total_nodes": 5}}]})),
                Some(json!({"stream": [{"index": 1, "output": {"node_index": 2}}]})),
            ],
            vec![running()],
        );
        let recorder = Recorder::default();
        let mut reconciler = Reconciler::new(&endpoint, &recorder, "job", PollConfig::default());

        reconciler.tick().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        reconciler.tick().await;
        // one 2s interval, three nodes left
        assert_eq!(reconciler.state().eta_secs(), Some(6.0));
    }

    #[tokio::test]
    async fn deadline_yields_timeout() {
        let endpoint = ScriptedEndpoint::new(
            vec![Some(json!({"stream": [{"index": 0, "output": {"node_index": 3, "total_nodes": 4}}]}))],
            vec![running()],
        );
        let recorder = Recorder::default();
        let config = PollConfig {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(60),
        };
        let mut reconciler = Reconciler::new(&endpoint, &recorder, "job", config);

        assert_eq!(reconciler.run().await, TerminalResult::Timeout);
        assert_eq!(reconciler.state().phase(), Phase::Error);
        assert!(endpoint.status_calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn completed_list_aggregate_prefers_last_qualifying_entry() {
        let endpoint = ScriptedEndpoint::new(
            vec![None],
            vec![Some(json!({"status": "COMPLETED", "output": [
                {"status": "ok"},
                {"error": "bad"},
                {"images": [{"filename": "final.png", "data": "AA=="}]},
            ]}))],
        );
        let recorder = Recorder::default();
        let result = Reconciler::new(&endpoint, &recorder, "job", fast()).run().await;
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn completed_without_images_is_a_failure() {
        let endpoint = ScriptedEndpoint::new(
            vec![None],
            vec![Some(json!({"status": "COMPLETED", "output": [{"status": "collecting"}]}))],
        );
        let recorder = Recorder::default();
        let result = Reconciler::new(&endpoint, &recorder, "job", fast()).run().await;
        assert_eq!(
            result,
            TerminalResult::Failure {
                error: "No images in output".into()
            }
        );
    }

    #[tokio::test]
    async fn partial_save_failure_is_still_success() {
        let endpoint = ScriptedEndpoint::new(
            vec![Some(json!({"stream": [{"index": 7, "output": {"images": [
                {"filename": "good.png", "data": "AA=="},
                {"filename": "bad.png", "data": "AA=="},
            ]}}]}))],
            vec![running()],
        );
        let recorder = Recorder::default();
        let outcome = run_workflow(&endpoint, &PickySink, &json!({"3": {}}), fast(), &recorder, &recorder)
            .await
            .unwrap();

        assert_eq!(outcome.job_id, "abc123");
        assert!(outcome.result.is_success());
        assert_eq!(outcome.saved.len(), 2);
        assert!(outcome.saved[0].saved_path().is_some());
        assert!(outcome.saved[1].error().is_some());
        assert_eq!(recorder.saved.lock().unwrap().len(), 2);
        assert_eq!(recorder.results.lock().unwrap().len(), 1);

        let updates = recorder.updates.lock().unwrap();
        let last = updates.last().unwrap();
        assert_eq!(last.phase, Phase::Done);
        assert_eq!(last.message, "Done: 1 image(s) saved");
    }

    #[tokio::test]
    async fn submission_error_aborts_before_polling() {
        let endpoint = ScriptedEndpoint {
            submit_error: Some(500),
            ..ScriptedEndpoint::new(vec![None], vec![None])
        };
        let recorder = Recorder::default();
        let err = run_workflow(&endpoint, &PickySink, &json!({}), fast(), &recorder, &recorder)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("500"));
        assert_eq!(endpoint.status_calls.load(Ordering::SeqCst), 0);
        assert!(recorder.results.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn each_run_starts_from_fresh_state() {
        let script = || {
            ScriptedEndpoint::new(
                vec![Some(json!({"stream": [{"index": 0, "output": {"node_index": 3, "total_nodes": 4}}]}))],
                vec![running()],
            )
        };
        let recorder = Recorder::default();
        let first_endpoint = script();
        let mut first = Reconciler::new(&first_endpoint, &recorder, "one", fast());
        first.tick().await;
        assert_eq!(first.state().nodes_done(), 3);

        let second_endpoint = ScriptedEndpoint::new(vec![None], vec![running()]);
        let mut second = Reconciler::new(&second_endpoint, &recorder, "two", fast());
        second.tick().await;
        assert_eq!(second.state().nodes_done(), 0);
        assert_eq!(second.state().eta_secs(), None);
    }
}
