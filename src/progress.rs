//! Document-processing progress reporting.
//!
//! A pipeline run emits an ordered sequence of [`ProgressEvent`]s:
//! `total_pages`, then `page_start`/`page_complete` for each page, then
//! `saving`, then exactly one terminal `complete` or `error`. An `error` may
//! end the sequence early.
//!
//! Reporters never fail the run: a reporter whose observer has gone away
//! silently drops events and the pipeline carries on.

use serde::Serialize;
use std::io::Write;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::error::PipelineError;

/// A single progress event. Serializes as `{"type": "...", ...payload}`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    TotalPages {
        total: usize,
    },
    PageStart {
        page: usize,
        total: usize,
    },
    PageComplete {
        page: usize,
        total: usize,
        records: usize,
    },
    Saving {
        message: String,
    },
    Complete {
        message: String,
        records: usize,
        training_file: String,
    },
    Error {
        stage: String,
        code: String,
        message: String,
    },
}

impl ProgressEvent {
    pub fn from_error(err: &PipelineError) -> Self {
        ProgressEvent::Error {
            stage: err.stage().to_string(),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Complete { .. } | ProgressEvent::Error { .. }
        )
    }

    pub fn to_json(&self) -> String {
        // Serializing this enum cannot fail: every field is a string or integer.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// One server-sent-events frame: `data: <json>\n\n`.
    pub fn to_sse_frame(&self) -> String {
        format!("data: {}\n\n", self.to_json())
    }
}

/// Receives progress events from a running pipeline.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "page 3 / 12 ...".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::TotalPages { total } => format!("document has {} pages\n", total),
            ProgressEvent::PageStart { page, total } => {
                format!("page {} / {}  extracting...\n", page, total)
            }
            ProgressEvent::PageComplete {
                page,
                total,
                records,
            } => format!("page {} / {}  {} pairs\n", page, total, records),
            ProgressEvent::Saving { message } => format!("{}\n", message),
            ProgressEvent::Complete { message, .. } => format!("{}\n", message),
            ProgressEvent::Error { stage, message, .. } => {
                format!("error ({}): {}\n", stage, message)
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}", event.to_json());
        let _ = stderr.flush();
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Forwards events to one observer over an unbounded channel.
///
/// The terminal event closes the channel. Send failures (observer gone) are
/// ignored.
pub struct ChannelProgress {
    tx: Mutex<Option<mpsc::UnboundedSender<ProgressEvent>>>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

impl ProgressReporter for ChannelProgress {
    fn report(&self, event: ProgressEvent) {
        let mut slot = self.tx.lock().unwrap_or_else(|p| p.into_inner());
        let terminal = event.is_terminal();
        if let Some(tx) = slot.as_ref() {
            if tx.send(event).is_err() {
                tracing::debug!("progress observer disconnected");
            }
        }
        if terminal {
            slot.take();
        }
    }
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
