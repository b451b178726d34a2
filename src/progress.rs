//! Index update progress reporting.
//!
//! Progress goes to **stderr** so stdout stays parseable. Human mode is
//! the default when stderr is a terminal; `--progress json` emits one JSON
//! object per line for wrappers such as editor plugins.

use std::io::Write;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Walking a connector root and extracting text. Total unknown.
    Scanning { source: String },
    /// Writing changed documents: `n` of `total` candidates handled.
    Indexing { source: String, n: u64, total: u64 },
    /// Embedding pending chunks after all sources are written.
    Embedding { pending: u64 },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// `update filesystem:vault  indexing  120 / 1,430 files`
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Scanning { source } => format!("update {}  scanning...", source),
            ProgressEvent::Indexing { source, n, total } => format!(
                "update {}  indexing  {} / {} files",
                source,
                format_number(*n),
                format_number(*total)
            ),
            ProgressEvent::Embedding { pending } => {
                format!("update  embedding {} chunks", format_number(*pending))
            }
        };
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{}", line);
        let _ = err.flush();
    }
}

pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Scanning { source } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "scanning"
            }),
            ProgressEvent::Indexing { source, n, total } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "indexing",
                "n": n,
                "total": total
            }),
            ProgressEvent::Embedding { pending } => serde_json::json!({
                "event": "progress",
                "phase": "embedding",
                "pending": pending
            }),
        };
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{}", obj);
        let _ = err.flush();
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// `1234567` → `1,234,567`
pub fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
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
