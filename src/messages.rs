//! # Daemon-wide message log.
//!
//! [`MessageLog`] is an append-only ring of timestamped, severity-tagged
//! diagnostic lines, optionally attributed to a task. Every line is mirrored
//! to `backend.log` and emitted through `tracing`; the periodic trimmer drops
//! lines older than the configured max age.
//!
//! Rendered form: `[SEV][YYYY-MM-DD HH-MM-SS] content (task id=N, name)`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Local};

/// Severity of a logged message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

impl Severity {
    fn as_tag(self) -> &'static str {
        match self {
            Severity::Info => " INFO",
            Severity::Error => "ERROR",
        }
    }
}

/// A single diagnostic line.
#[derive(Clone, Debug)]
pub struct Message {
    at: DateTime<Local>,
    severity: Severity,
    content: String,
    task_label: Option<String>,
}

impl Message {
    fn render(&self) -> String {
        let date = self.at.format("%Y-%m-%d %H-%M-%S");
        let task = match &self.task_label {
            Some(label) => format!(" ({label})"),
            None => String::new(),
        };
        format!("[{}][{}] {}{}", self.severity.as_tag(), date, self.content, task)
    }
}

struct Inner {
    messages: Vec<Message>,
    // Closed and dropped on the first write failure.
    log_file: Option<File>,
}

/// Append-only message ring mirrored to a file.
pub struct MessageLog {
    inner: Mutex<Inner>,
}

impl MessageLog {
    /// Opens the mirror file (truncating it) and returns the log.
    pub fn new(log_file_path: &Path) -> std::io::Result<Self> {
        let log_file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(log_file_path)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                messages: Vec::new(),
                log_file: Some(log_file),
            }),
        })
    }

    /// Appends a message, mirrors it to the file, and emits it via `tracing`.
    pub fn add(&self, severity: Severity, task_label: Option<&str>, content: impl Into<String>) {
        let msg = Message {
            at: Local::now(),
            severity,
            content: content.into(),
            task_label: task_label.map(str::to_string),
        };
        let rendered = msg.render();

        match severity {
            Severity::Info => tracing::info!("{rendered}"),
            Severity::Error => tracing::error!("{rendered}"),
        }

        let mut inner = self.inner.lock().expect("message log poisoned");
        inner.messages.push(msg);

        if let Some(file) = inner.log_file.as_mut() {
            let failed = file
                .write_all(rendered.as_bytes())
                .and_then(|()| file.write_all(b"\n"))
                .is_err();
            if failed {
                inner.log_file = None;
            }
        }
    }

    /// Drops messages older than `max_age`.
    pub fn trim(&self, max_age: Duration) {
        let cutoff = Local::now()
            - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let mut inner = self.inner.lock().expect("message log poisoned");
        inner.messages.retain(|msg| msg.at > cutoff);
    }

    /// Renders every retained message, oldest first.
    pub fn render_all(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("message log poisoned");
        inner.messages.iter().map(Message::render).collect()
    }

    /// Closes the mirror file.
    pub fn cleanup(&self) {
        let mut inner = self.inner.lock().expect("message log poisoned");
        inner.log_file = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_in(dir: &Path) -> MessageLog {
        let path = dir.join("backend.log");
        File::create(&path).unwrap();
        MessageLog::new(&path).unwrap()
    }

    #[test]
    fn renders_severity_and_task_label() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());

        log.add(Severity::Error, Some("task id=3, builds"), "Failed logging.");
        log.add(Severity::Info, None, "Trimmed task");

        let rendered = log.render_all();
        assert_eq!(rendered.len(), 2);
        assert!(rendered[0].starts_with("[ERROR]["));
        assert!(rendered[0].ends_with("Failed logging. (task id=3, builds)"));
        assert!(rendered[1].starts_with("[ INFO]["));
        assert!(rendered[1].ends_with("Trimmed task"));
    }

    #[test]
    fn mirrors_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.log");
        File::create(&path).unwrap();
        let log = MessageLog::new(&path).unwrap();

        log.add(Severity::Info, None, "hello");
        log.cleanup();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("hello"));
        assert!(contents.ends_with('\n'));
    }

    #[test]
    fn trim_drops_old_messages() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());

        log.add(Severity::Info, None, "recent");
        log.trim(Duration::from_secs(3600));
        assert_eq!(log.render_all().len(), 1);

        log.trim(Duration::ZERO);
        assert_eq!(log.render_all().len(), 0);
    }
}
