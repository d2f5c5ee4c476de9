//! Wire types for the serverless job endpoint.
//!
//! The `/stream/{id}` endpoint returns the full, index-ordered event log
//! of a job and `/status/{id}` returns its coarse lifecycle status plus,
//! once completed, the aggregated output. Event payloads carry no
//! explicit tag: their meaning is decided by which fields are present
//! (see [`EventPayload::classify`]).

use serde::{Deserialize, Serialize};

/// One entry of the job's append-only event log.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamEvent {
    /// Per-job sequence number. Unique, not necessarily contiguous.
    pub index: i64,
    /// A missing, `null` or malformed payload reads as an empty one.
    #[serde(default, deserialize_with = "lenient_output")]
    pub output: EventPayload,
}

/// Body of `GET /stream/{id}`.
///
/// Entries decode independently, so one bad entry never hides the rest
/// of the log.
#[derive(Debug, Default, Deserialize)]
pub struct StreamResponse {
    #[serde(default, deserialize_with = "lenient_stream")]
    pub stream: Vec<StreamEvent>,
}

fn lenient_output<'de, D: serde::Deserializer<'de>>(de: D) -> Result<EventPayload, D::Error> {
    let value = serde_json::Value::deserialize(de)?;
    Ok(lenient_payload(&value))
}

fn lenient_stream<'de, D: serde::Deserializer<'de>>(de: D) -> Result<Vec<StreamEvent>, D::Error> {
    let entries = Option::<Vec<serde_json::Value>>::deserialize(de)?.unwrap_or_default();
    Ok(entries
        .iter()
        .filter_map(|entry| match StreamEvent::deserialize(entry) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::debug!(error = %e, "Dropping stream entry without a usable index");
                None
            }
        })
        .collect())
}

/// Node counters arrive as integers or as whole floats (`2.0`).
fn lenient_count<'de, D: serde::Deserializer<'de>>(de: D) -> Result<Option<u64>, D::Error> {
    let raw = Option::<f64>::deserialize(de)?;
    Ok(raw.filter(|v| v.is_finite() && *v >= 0.0).map(|v| v as u64))
}

/// An output image as produced by the remote worker.
///
/// Exactly one of `data` (base64) or `url` is expected to be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ImageDescriptor {
    pub fn filename(&self) -> &str {
        self.filename.as_deref().unwrap_or("output.png")
    }
}

/// Untagged event payload. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<ImageDescriptor>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_count", skip_serializing_if = "Option::is_none")]
    pub node_index: Option<u64>,
    #[serde(default, deserialize_with = "lenient_count", skip_serializing_if = "Option::is_none")]
    pub total_nodes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<f64>,
}

/// What an [`EventPayload`] means once precedence has been applied.
#[derive(Debug, PartialEq)]
pub enum PayloadKind<'a> {
    /// The job reported an error. Overrides every other field.
    Error(&'a str),
    /// Terminal success payload. Progress fields on the same event are ignored.
    Images(&'a [ImageDescriptor]),
    /// Progress-only update.
    Progress,
}

impl EventPayload {
    /// Apply the field precedence: `error`, then `images`, then progress.
    pub fn classify(&self) -> PayloadKind<'_> {
        if let Some(error) = &self.error {
            return PayloadKind::Error(error);
        }
        if let Some(images) = &self.images {
            return PayloadKind::Images(images);
        }
        PayloadKind::Progress
    }

    fn is_terminal(&self) -> bool {
        self.error.is_some() || self.images.is_some()
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Coarse job status reported by `/status/{id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Completed,
    Failed,
    /// Anything else (`IN_QUEUE`, `IN_PROGRESS`, ...) means keep polling.
    Pending(String),
}

impl JobStatus {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("COMPLETED") => JobStatus::Completed,
            Some("FAILED") => JobStatus::Failed,
            Some(other) => JobStatus::Pending(other.to_string()),
            None => JobStatus::Pending(String::new()),
        }
    }
}

/// Body of `GET /status/{id}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusReport {
    #[serde(default)]
    pub status: Option<String>,
    /// Either a single payload or the list of payloads the worker yielded.
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    /// Set by the queue on `FAILED` jobs.
    #[serde(default)]
    pub error: Option<String>,
}

impl StatusReport {
    pub fn job_status(&self) -> JobStatus {
        JobStatus::parse(self.status.as_deref())
    }

    /// Pick the terminal payload out of the aggregated output.
    ///
    /// Lists are scanned from the end for the first entry carrying
    /// `images` or `error`; failing that the last entry is used. A
    /// missing output or an empty list yields `{"error": "No output"}`.
    pub fn terminal_payload(&self) -> EventPayload {
        match &self.output {
            Some(serde_json::Value::Array(entries)) => {
                let payloads: Vec<EventPayload> = entries.iter().map(lenient_payload).collect();
                if let Some(hit) = payloads.iter().rev().find(|p| p.is_terminal()) {
                    return hit.clone();
                }
                payloads
                    .last()
                    .cloned()
                    .unwrap_or_else(|| EventPayload::failure("No output"))
            }
            Some(serde_json::Value::Null) | None => EventPayload::failure("No output"),
            Some(other) => lenient_payload(other),
        }
    }
}

/// Entries that do not look like a payload are treated as empty ones.
fn lenient_payload(value: &serde_json::Value) -> EventPayload {
    EventPayload::deserialize(value).unwrap_or_default()
}
