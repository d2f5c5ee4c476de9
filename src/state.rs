//! Per-run progress state folded from stream events.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::messages::EventPayload;

/// Lifecycle phase of a run. Success-path phases only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    Executing,
    Collecting,
    Saving,
    Done,
    Error,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Starting => "Starting",
            Phase::Executing => "Executing",
            Phase::Collecting => "Collecting",
            Phase::Saving => "Saving",
            Phase::Done => "Done",
            Phase::Error => "Error",
        }
    }
}

/// Mutable view of one run. Built fresh for every job, never reused.
#[derive(Debug)]
pub struct RunState {
    phase: Phase,
    nodes_done: u64,
    total_nodes: u64,
    elapsed: f64,
    completions: Vec<Instant>,
    current_node: Option<String>,
    /// `(progress, max)` of the most recent progress-bearing event.
    step: Option<(f64, f64)>,
    status_text: Option<String>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Starting,
            nodes_done: 0,
            total_nodes: 0,
            elapsed: 0.0,
            completions: Vec::new(),
            current_node: None,
            step: None,
            status_text: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn nodes_done(&self) -> u64 {
        self.nodes_done
    }

    pub fn total_nodes(&self) -> u64 {
        self.total_nodes
    }

    /// Remote-reported seconds since execution started.
    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    pub fn current_node(&self) -> Option<&str> {
        self.current_node.as_deref()
    }

    pub fn status_text(&self) -> Option<&str> {
        self.status_text.as_deref()
    }

    /// Move forward to `next`. Backward moves and moves out of `Error` are ignored.
    pub fn advance(&mut self, next: Phase) {
        if self.phase != Phase::Error && next > self.phase {
            tracing::debug!(from = ?self.phase, to = ?next, "Phase transition");
            self.phase = next;
        }
    }

    pub fn fail(&mut self) {
        self.phase = Phase::Error;
    }

    /// Fold a progress-only payload observed at `now`.
    pub fn fold(&mut self, payload: &EventPayload, now: Instant) {
        if let Some(total) = payload.total_nodes.filter(|t| *t > 0) {
            self.total_nodes = total;
        }
        if let Some(elapsed) = payload.elapsed {
            self.elapsed = elapsed;
        }
        if let Some(index) = payload.node_index {
            if index > self.nodes_done {
                self.nodes_done = index;
                self.completions.push(now);
            }
        }
        if let Some(node_type) = &payload.node_type {
            self.current_node = Some(node_type.clone());
        }

        match payload.status.as_deref() {
            Some("executing" | "running") => {
                if self.phase == Phase::Starting {
                    self.advance(Phase::Executing);
                }
            }
            Some("collecting") => self.advance(Phase::Collecting),
            _ => {}
        }

        self.step = match (payload.progress, payload.max) {
            (Some(progress), Some(max)) if max > 0.0 => Some((progress, max)),
            _ => None,
        };

        if let Some(text) = self.describe(payload) {
            self.status_text = Some(text);
        }
    }

    fn describe(&self, payload: &EventPayload) -> Option<String> {
        let count = if self.total_nodes > 0 {
            format!(" ({} of {})", self.nodes_done, self.total_nodes)
        } else {
            String::new()
        };
        if let Some((progress, max)) = self.step {
            let label = payload
                .node_type
                .as_deref()
                .or(payload.node.as_deref())
                .unwrap_or("?");
            return Some(format!("{label}{count}: step {progress}/{max}"));
        }
        if let Some(message) = payload.message.as_deref().filter(|m| !m.is_empty()) {
            return Some(format!("{message}{count}"));
        }
        payload.status.clone().filter(|s| !s.is_empty())
    }

    /// Workflow completion in percent, unknown until the node count is.
    pub fn overall_percent(&self) -> Option<f64> {
        if self.total_nodes > 0 {
            Some(self.nodes_done as f64 / self.total_nodes as f64 * 100.0)
        } else {
            None
        }
    }

    /// Completion of the node currently sampling, in percent.
    pub fn step_percent(&self) -> Option<f64> {
        self.step.map(|(progress, max)| progress / max * 100.0)
    }

    /// Seconds left, extrapolated from the mean interval between node
    /// completions. A plain moving rate: no weighting or decay, so long
    /// sampler nodes late in a workflow make it optimistic.
    pub fn eta_secs(&self) -> Option<f64> {
        let count = self.completions.len();
        if count < 2 || self.nodes_done >= self.total_nodes {
            return None;
        }
        let span = self.completions[count - 1].duration_since(self.completions[0]);
        let avg = span.as_secs_f64() / (count - 1) as f64;
        Some(avg * (self.total_nodes - self.nodes_done) as f64)
    }
}
