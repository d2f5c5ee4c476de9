use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::io::SaveOutcome;
use crate::orchestrator::TerminalResult;
use crate::progress::{ProgressReporter, ProgressUpdate, ResultConsumer};
use crate::state::Phase;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Started { run_id: String },
    Submitted { run_id: String, job_id: String },
    Progress {
        run_id: String,
        phase: Phase,
        message: String,
        overall_percent: Option<f64>,
        step_percent: Option<f64>,
        elapsed_secs: f64,
        eta_secs: Option<f64>,
    },
    ImageSaved {
        run_id: String,
        filename: String,
        path: Option<String>,
        error: Option<String>,
    },
    Finished { run_id: String, job_id: String, saved: usize },
    Failed { run_id: String, error: String },
    TimedOut { run_id: String },
}

impl RunEvent {
    pub fn run_id(&self) -> &str {
        match self {
            RunEvent::Started { run_id }
            | RunEvent::Submitted { run_id, .. }
            | RunEvent::Progress { run_id, .. }
            | RunEvent::ImageSaved { run_id, .. }
            | RunEvent::Finished { run_id, .. }
            | RunEvent::Failed { run_id, .. }
            | RunEvent::TimedOut { run_id } => run_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::Finished { .. } | RunEvent::Failed { .. } | RunEvent::TimedOut { .. }
        )
    }
}

/// Publishes a run's progress on a broadcast channel for SSE subscribers.
pub struct BroadcastReporter {
    run_id: String,
    tx: broadcast::Sender<RunEvent>,
}

impl BroadcastReporter {
    pub fn new(run_id: String, tx: broadcast::Sender<RunEvent>) -> Self {
        Self { run_id, tx }
    }

    pub fn send(&self, event: RunEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn finished(&self, job_id: &str, saved: usize) {
        self.send(RunEvent::Finished {
            run_id: self.run_id.clone(),
            job_id: job_id.to_string(),
            saved,
        });
    }

    pub fn failed(&self, error: impl Into<String>) {
        self.send(RunEvent::Failed {
            run_id: self.run_id.clone(),
            error: error.into(),
        });
    }
}

impl ProgressReporter for BroadcastReporter {
    fn report(&self, update: &ProgressUpdate) {
        self.send(RunEvent::Progress {
            run_id: self.run_id.clone(),
            phase: update.phase,
            message: update.message.clone(),
            overall_percent: update.overall_percent,
            step_percent: update.step_percent,
            elapsed_secs: update.elapsed_secs,
            eta_secs: update.eta_secs,
        });
    }
}

impl ResultConsumer for BroadcastReporter {
    fn on_submitted(&self, job_id: &str) {
        self.send(RunEvent::Submitted {
            run_id: self.run_id.clone(),
            job_id: job_id.to_string(),
        });
    }

    fn on_result(&self, _job_id: &str, result: &TerminalResult) {
        match result {
            // `Finished` follows once the images are saved
            TerminalResult::Success { .. } => {}
            TerminalResult::Failure { error } => self.failed(error.clone()),
            TerminalResult::Timeout => self.send(RunEvent::TimedOut {
                run_id: self.run_id.clone(),
            }),
        }
    }

    fn on_image_saved(&self, outcome: &SaveOutcome) {
        self.send(RunEvent::ImageSaved {
            run_id: self.run_id.clone(),
            filename: outcome.filename.clone(),
            path: outcome.saved_path().map(|p| p.display().to_string()),
            error: outcome.error().map(str::to_string),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_tag() {
        let evt = RunEvent::TimedOut { run_id: "run-1".into() };
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["type"], "timed_out");
        assert_eq!(json["run_id"], "run-1");
    }

    #[test]
    fn progress_phase_serializes_snake_case() {
        let (tx, mut rx) = broadcast::channel(8);
        BroadcastReporter::new("run-3".into(), tx).report(&ProgressUpdate::new(Phase::Collecting, "Collecting outputs"));

        let json = serde_json::to_value(rx.try_recv().unwrap()).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["phase"], "collecting");
    }

    #[test]
    fn reporter_tags_every_event_with_its_run() {
        let (tx, mut rx) = broadcast::channel(8);
        let reporter = BroadcastReporter::new("run-7".into(), tx);

        reporter.on_submitted("abc123");
        reporter.report(&ProgressUpdate::new(Phase::Executing, "KSampler"));
        reporter.on_result("abc123", &TerminalResult::Failure { error: "bad".into() });

        let submitted = rx.try_recv().unwrap();
        assert!(matches!(submitted, RunEvent::Submitted { ref job_id, .. } if job_id == "abc123"));

        match rx.try_recv().unwrap() {
            RunEvent::Progress { run_id, phase, .. } => {
                assert_eq!(run_id, "run-7");
                assert_eq!(phase, Phase::Executing);
            }
            other => panic!("expected progress, got {other:?}"),
        }

        let failed = rx.try_recv().unwrap();
        assert!(failed.is_terminal());
        assert_eq!(failed.run_id(), "run-7");
    }

    #[test]
    fn success_result_waits_for_finished() {
        let (tx, mut rx) = broadcast::channel(8);
        let reporter = BroadcastReporter::new("run-8".into(), tx);
        reporter.on_result("job", &TerminalResult::Success { images: vec![] });
        assert!(rx.try_recv().is_err());
    }
}
