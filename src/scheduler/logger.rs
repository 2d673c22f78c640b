//! # Per-task logging pipeline.
//!
//! Each supervised task owns one [`TaskLogger`]: a dedicated writer holding
//! the task log file and a rolling per-execution stdout file. The supervisor
//! worker and its output pumps feed it typed messages; on every execution
//! boundary the writer rotates the stdout file and reports the closed file's
//! path back over a reply channel.
//!
//! Write failures are published on a single-shot error channel; the writer
//! keeps draining messages afterwards so senders never block on a dead
//! consumer.

use std::path::PathBuf;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::lifecycle::Lifecycle;
use crate::paths::FilePathProvider;

/// A message for the per-task writer.
#[derive(Clone, Debug)]
pub enum LogMessage {
    /// One line of child stdout or stderr.
    Stdout(String),
    /// A wrapped diagnostic line; with `is_separator` it also marks the end
    /// of an execution and rotates the stdout file.
    Diagnostic { text: String, is_separator: bool },
    /// Close both files and exit.
    Stop,
}

/// Handle to one task's logging writer.
pub struct TaskLogger {
    tx: mpsc::Sender<LogMessage>,
    error_rx: mpsc::Receiver<()>,
    stdout_path_rx: mpsc::Receiver<String>,
    writer: Option<JoinHandle<()>>,
}

impl TaskLogger {
    /// Creates the task log file and starts the writer worker.
    pub async fn spawn(
        files: &FilePathProvider,
        lifecycle: &Lifecycle,
        task_id: u32,
        capture_stdout: bool,
    ) -> std::io::Result<Self> {
        let task_log_path = files.task_log_file(task_id);
        let task_log = File::create(&task_log_path).await?;

        let (tx, rx) = mpsc::channel(256);
        let (error_tx, error_rx) = mpsc::channel(1);
        let (stdout_path_tx, stdout_path_rx) = mpsc::channel(1);

        let writer = Writer {
            rx,
            error_tx,
            stdout_path_tx,
            task_log,
            capture_stdout,
            task_id,
            execution_id: 0,
            stdout_path: files.stdout_log_file(task_id, 0),
            stdout_file: None,
            stdout_dir: files
                .stdout_log_file(task_id, 0)
                .parent()
                .expect("stdout log has a parent dir")
                .to_path_buf(),
        };
        let handle = lifecycle.start_worker(writer.run());

        Ok(Self {
            tx,
            error_rx,
            stdout_path_rx,
            writer: Some(handle),
        })
    }

    /// A sender the output pumps can own.
    pub fn sender(&self) -> mpsc::Sender<LogMessage> {
        self.tx.clone()
    }

    /// Appends a diagnostic line to the task log.
    pub async fn diagnostic(&self, text: impl Into<String>) {
        let _ = self
            .tx
            .send(LogMessage::Diagnostic {
                text: text.into(),
                is_separator: false,
            })
            .await;
    }

    /// Marks the end of an execution: rotates the stdout file and returns
    /// the closed file's path, empty when capture is disabled.
    pub async fn end_execution(&mut self) -> String {
        let sent = self
            .tx
            .send(LogMessage::Diagnostic {
                text: String::new(),
                is_separator: true,
            })
            .await;
        if sent.is_err() {
            return String::new();
        }
        self.stdout_path_rx.recv().await.unwrap_or_default()
    }

    /// Resolves when the writer reports a write failure. At most one error
    /// is ever published.
    pub async fn write_failed(&mut self) {
        if self.error_rx.recv().await.is_none() {
            // Writer gone without reporting; never resolve.
            std::future::pending::<()>().await;
        }
    }

    /// Stops the writer and waits for it to flush and close both files.
    pub async fn close(mut self) {
        let _ = self.tx.send(LogMessage::Stop).await;
        if let Some(handle) = self.writer.take() {
            let _ = handle.await;
        }
    }
}

struct Writer {
    rx: mpsc::Receiver<LogMessage>,
    error_tx: mpsc::Sender<()>,
    stdout_path_tx: mpsc::Sender<String>,
    task_log: File,
    capture_stdout: bool,
    task_id: u32,
    execution_id: u32,
    stdout_path: PathBuf,
    stdout_file: Option<File>,
    stdout_dir: PathBuf,
}

impl Writer {
    async fn run(mut self) {
        if self.capture_stdout {
            self.open_stdout_file().await;
        }

        while let Some(message) = self.rx.recv().await {
            match message {
                LogMessage::Stop => break,
                LogMessage::Stdout(line) => self.on_stdout(line).await,
                LogMessage::Diagnostic { text, is_separator } => {
                    self.on_diagnostic(text, is_separator).await;
                }
            }
        }

        let _ = self.task_log.flush().await;
        if let Some(mut file) = self.stdout_file.take() {
            let _ = file.flush().await;
        }
    }

    async fn on_stdout(&mut self, line: String) {
        let chunk = format!("{line}\n");
        self.write_task_log(chunk.as_bytes()).await;

        if let Some(file) = self.stdout_file.as_mut() {
            if file.write_all(chunk.as_bytes()).await.is_err() {
                self.report_error();
            }
        }
    }

    async fn on_diagnostic(&mut self, text: String, is_separator: bool) {
        if !text.is_empty() {
            let chunk = format!("--------------------- {text} ---------------------\n");
            self.write_task_log(chunk.as_bytes()).await;
        }

        if is_separator {
            self.write_task_log(b"\n\n\n").await;
            self.rotate_stdout_file().await;
        }
    }

    /// Closes the current stdout file, reports its path, and opens the next
    /// one. The reply is empty when capture is disabled.
    async fn rotate_stdout_file(&mut self) {
        let closed_path = if self.capture_stdout {
            if let Some(mut file) = self.stdout_file.take() {
                let _ = file.flush().await;
            }
            self.stdout_path.to_string_lossy().into_owned()
        } else {
            String::new()
        };

        self.execution_id += 1;
        self.stdout_path = self.stdout_dir.join(format!(
            "task_{:03}_stdout_{:03}.log",
            self.task_id, self.execution_id
        ));
        if self.capture_stdout {
            self.open_stdout_file().await;
        }

        let _ = self.stdout_path_tx.send(closed_path).await;
    }

    async fn open_stdout_file(&mut self) {
        match File::create(&self.stdout_path).await {
            Ok(file) => self.stdout_file = Some(file),
            Err(_) => {
                self.stdout_file = None;
                self.report_error();
            }
        }
    }

    async fn write_task_log(&mut self, bytes: &[u8]) {
        if self.task_log.write_all(bytes).await.is_err() {
            self.report_error();
        }
    }

    fn report_error(&self) {
        let _ = self.error_tx.try_send(());
        tracing::debug!(task_id = self.task_id, "per-task logger write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::FilePathProvider;

    async fn setup(capture: bool) -> (tempfile::TempDir, FilePathProvider, Lifecycle, TaskLogger) {
        let root = tempfile::tempdir().unwrap();
        let files = FilePathProvider::with_cache_root(root.path().join("cache")).unwrap();
        let lifecycle = Lifecycle::new();
        let logger = TaskLogger::spawn(&files, &lifecycle, 0, capture).await.unwrap();
        (root, files, lifecycle, logger)
    }

    #[tokio::test]
    async fn stdout_goes_to_both_files_and_rotates() {
        let (_root, files, lifecycle, mut logger) = setup(true).await;

        logger.sender().send(LogMessage::Stdout("one".to_string())).await.unwrap();
        let first = logger.end_execution().await;
        assert_eq!(first, files.stdout_log_file(0, 0).to_string_lossy());

        logger.sender().send(LogMessage::Stdout("two".to_string())).await.unwrap();
        let second = logger.end_execution().await;
        assert_eq!(second, files.stdout_log_file(0, 1).to_string_lossy());

        logger.close().await;
        lifecycle.cancel();
        lifecycle.join().await;

        assert_eq!(std::fs::read_to_string(&first).unwrap(), "one\n");
        assert_eq!(std::fs::read_to_string(&second).unwrap(), "two\n");

        let task_log = std::fs::read_to_string(files.task_log_file(0)).unwrap();
        assert!(task_log.contains("one\n"));
        assert!(task_log.contains("two\n"));
        assert!(task_log.contains("\n\n\n"));
    }

    #[tokio::test]
    async fn capture_disabled_reports_empty_path() {
        let (_root, files, lifecycle, mut logger) = setup(false).await;

        logger.sender().send(LogMessage::Stdout("line".to_string())).await.unwrap();
        assert_eq!(logger.end_execution().await, "");

        logger.close().await;
        lifecycle.cancel();
        lifecycle.join().await;

        // No stdout file was ever created.
        assert!(!files.stdout_log_file(0, 0).exists());
        // The task log still received the line.
        let task_log = std::fs::read_to_string(files.task_log_file(0)).unwrap();
        assert!(task_log.contains("line\n"));
    }

    #[tokio::test]
    async fn diagnostics_are_wrapped() {
        let (_root, files, lifecycle, logger) = setup(false).await;

        logger.diagnostic("Command started.").await;
        logger.close().await;
        lifecycle.cancel();
        lifecycle.join().await;

        let task_log = std::fs::read_to_string(files.task_log_file(0)).unwrap();
        assert!(task_log
            .contains("--------------------- Command started. ---------------------\n"));
    }
}
