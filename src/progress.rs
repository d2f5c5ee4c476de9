//! Sinks for run progress and results.
//!
//! The run loop never renders anything itself; it hands
//! [`ProgressUpdate`]s to a [`ProgressReporter`] and terminal results
//! and per-image save outcomes to a [`ResultConsumer`].

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::io::SaveOutcome;
use crate::orchestrator::TerminalResult;
use crate::state::Phase;

/// Snapshot of a run's progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub phase: Phase,
    pub message: String,
    pub overall_percent: Option<f64>,
    pub step_percent: Option<f64>,
    pub elapsed_secs: f64,
    pub eta_secs: Option<f64>,
}

impl ProgressUpdate {
    pub fn new(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            overall_percent: None,
            step_percent: None,
            elapsed_secs: 0.0,
            eta_secs: None,
        }
    }

    pub fn with_overall(mut self, percent: Option<f64>) -> Self {
        self.overall_percent = percent;
        self
    }

    /// `12s elapsed, ~1m 5s remaining`
    pub fn meta_line(&self) -> String {
        let mut parts = Vec::new();
        if self.elapsed_secs > 0.0 {
            parts.push(format!("{} elapsed", format_time(self.elapsed_secs)));
        }
        if let Some(eta) = self.eta_secs {
            parts.push(format!("~{} remaining", format_time(eta)));
        }
        parts.join(", ")
    }
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, update: &ProgressUpdate);
}

pub trait ResultConsumer: Send + Sync {
    fn on_submitted(&self, _job_id: &str) {}

    fn on_result(&self, job_id: &str, result: &TerminalResult);

    fn on_image_saved(&self, outcome: &SaveOutcome);
}

/// Format seconds as `42s` or `3m 7s`.
pub fn format_time(seconds: f64) -> String {
    let s = seconds.round().max(0.0) as u64;
    if s < 60 {
        return format!("{s}s");
    }
    format!("{}m {}s", s / 60, s % 60)
}

/// Terminal progress bar for the CLI.
pub struct ConsoleReporter {
    bar: ProgressBar,
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::with_template("{spinner:.green} {prefix:>10.bold} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);
        bar.set_prefix(Phase::Starting.label());
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish();
    }
}

impl ProgressReporter for ConsoleReporter {
    fn report(&self, update: &ProgressUpdate) {
        self.bar.set_prefix(update.phase.label());
        if let Some(pct) = update.overall_percent {
            self.bar.set_position(pct.clamp(0.0, 100.0) as u64);
        }
        let mut msg = update.message.clone();
        if let Some(step) = update.step_percent {
            msg.push_str(&format!(" [{:.0}%]", step.clamp(0.0, 100.0)));
        }
        let meta = update.meta_line();
        if !meta.is_empty() {
            msg.push_str(&format!(" ({meta})"));
        }
        self.bar.set_message(msg);
    }
}

impl ResultConsumer for ConsoleReporter {
    fn on_result(&self, job_id: &str, result: &TerminalResult) {
        match result {
            TerminalResult::Success { images } => {
                self.bar.println(format!("Job {job_id} produced {} image(s)", images.len()));
            }
            TerminalResult::Failure { error } => {
                self.bar.abandon_with_message(format!("Error: {error}"));
            }
            TerminalResult::Timeout => {
                self.bar.abandon_with_message("Timed out waiting for results");
            }
        }
    }

    fn on_image_saved(&self, outcome: &SaveOutcome) {
        match &outcome.result {
            Ok(saved) => self.bar.println(format!("  Saved: {}", saved.path.display())),
            Err(e) => self.bar.println(format!("  Save failed for {}: {e}", outcome.filename)),
        }
    }
}
