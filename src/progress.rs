//! Sync progress reporting.
//!
//! Progress goes to **stderr** so the run summary on stdout stays
//! parseable. The human form is one line per event:
//!
//! ```text
//! sync nate  fetching feed
//! sync nate  [3/12] Some Title
//! sync nate  done: 11 ok, 1 failed
//! ```

use std::io::{IsTerminal, Write};

use serde_json::{json, Value};

#[derive(Clone, Debug, PartialEq)]
pub enum SyncProgressEvent {
    /// Requesting the feed for this source.
    Fetching { source: String },
    /// Item `n` (1-based) of `total` is being ingested.
    Ingesting {
        source: String,
        n: u64,
        total: u64,
        title: String,
    },
    /// The item loop ended, possibly early.
    Finished {
        source: String,
        succeeded: u64,
        failed: u64,
    },
}

impl SyncProgressEvent {
    fn human_line(&self) -> String {
        match self {
            SyncProgressEvent::Fetching { source } => format!("sync {}  fetching feed", source),
            SyncProgressEvent::Ingesting {
                source,
                n,
                total,
                title,
            } => format!("sync {}  [{}/{}] {}", source, n, total, title),
            SyncProgressEvent::Finished {
                source,
                succeeded,
                failed,
            } => format!("sync {}  done: {} ok, {} failed", source, succeeded, failed),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            SyncProgressEvent::Fetching { source } => json!({
                "event": "fetching",
                "source": source,
            }),
            SyncProgressEvent::Ingesting {
                source,
                n,
                total,
                title,
            } => json!({
                "event": "ingesting",
                "source": source,
                "n": n,
                "total": total,
                "title": title,
            }),
            SyncProgressEvent::Finished {
                source,
                succeeded,
                failed,
            } => json!({
                "event": "finished",
                "source": source,
                "succeeded": succeeded,
                "failed": failed,
            }),
        }
    }
}

pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}", event.human_line());
    }
}

/// One JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}", event.to_json());
    }
}

pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

/// Value of `--progress`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a terminal, otherwise off.
    pub fn default_for_tty() -> Self {
        if std::io::stderr().is_terminal() {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_lines() {
        let ingesting = SyncProgressEvent::Ingesting {
            source: "nate".into(),
            n: 3,
            total: 12,
            title: "Some Title".into(),
        };
        assert_eq!(ingesting.human_line(), "sync nate  [3/12] Some Title");

        let finished = SyncProgressEvent::Finished {
            source: "nate".into(),
            succeeded: 11,
            failed: 1,
        };
        assert_eq!(finished.human_line(), "sync nate  done: 11 ok, 1 failed");
    }

    #[test]
    fn json_events_are_tagged() {
        let value = SyncProgressEvent::Fetching {
            source: "nate".into(),
        }
        .to_json();
        assert_eq!(value["event"], "fetching");
        assert_eq!(value["source"], "nate");

        let value = SyncProgressEvent::Ingesting {
            source: "nate".into(),
            n: 1,
            total: 2,
            title: "A \"quoted\" title".into(),
        }
        .to_json();
        let line = value.to_string();
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["title"], "A \"quoted\" title");
        assert_eq!(parsed["total"], 2);
    }
}
