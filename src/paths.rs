//! # Cache directory layout.
//!
//! [`FilePathProvider`] owns every path the daemon writes under the user's
//! cache home:
//!
//! ```text
//! $HOME/.cache/spieven/
//!   tasks/                   task_<id>.log, task_<id>_stdout_<exec>.log
//!   tmp/                     scratch files for the spill-file rewrite
//!   deactivatedTasks.ndjson  one JSON record per deactivated task
//!   backend.log              mirror of the message log
//! ```
//!
//! The whole layout is created empty on daemon start and removed on clean
//! shutdown. The provider is immutable after construction.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::DaemonError;

/// Owns the cache directory layout and derives per-task file paths.
#[derive(Debug)]
pub struct FilePathProvider {
    cache_dir: PathBuf,
    tmp_dir: PathBuf,
    task_logs_dir: PathBuf,
    deactivated_tasks_file: PathBuf,
    message_log_file: PathBuf,
}

impl FilePathProvider {
    /// Builds the layout under `$HOME/.cache/spieven`, emptying anything a
    /// previous run left behind.
    pub fn new() -> Result<Self, DaemonError> {
        let home = std::env::var_os("HOME").ok_or(DaemonError::HomeNotSet)?;
        Self::with_cache_root(Path::new(&home).join(".cache").join("spieven"))
    }

    /// Builds the layout under an explicit cache root. Used by tests.
    pub fn with_cache_root(cache_dir: PathBuf) -> Result<Self, DaemonError> {
        ensure_dir_exists_and_is_empty(&cache_dir)?;

        let tmp_dir = cache_dir.join("tmp");
        ensure_dir_exists_and_is_empty(&tmp_dir)?;

        let task_logs_dir = cache_dir.join("tasks");
        ensure_dir_exists_and_is_empty(&task_logs_dir)?;

        let deactivated_tasks_file = cache_dir.join("deactivatedTasks.ndjson");
        ensure_file_exists_and_is_empty(&deactivated_tasks_file)?;

        let message_log_file = cache_dir.join("backend.log");
        ensure_file_exists_and_is_empty(&message_log_file)?;

        Ok(Self {
            cache_dir,
            tmp_dir,
            task_logs_dir,
            deactivated_tasks_file,
            message_log_file,
        })
    }

    /// A scratch file in the tmp dir, used while rewriting the spill file.
    pub fn tmp_file(&self) -> std::io::Result<NamedTempFile> {
        NamedTempFile::new_in(&self.tmp_dir)
    }

    pub fn deactivated_tasks_file(&self) -> &Path {
        &self.deactivated_tasks_file
    }

    pub fn message_log_file(&self) -> &Path {
        &self.message_log_file
    }

    /// Per-task log, e.g. `tasks/task_007.log`.
    pub fn task_log_file(&self, task_id: u32) -> PathBuf {
        self.task_logs_dir.join(format!("task_{task_id:03}.log"))
    }

    /// Per-execution stdout log, e.g. `tasks/task_007_stdout_002.log`.
    pub fn stdout_log_file(&self, task_id: u32, execution_id: u32) -> PathBuf {
        self.task_logs_dir
            .join(format!("task_{task_id:03}_stdout_{execution_id:03}.log"))
    }

    /// Removes the whole cache directory.
    pub fn cleanup(&self) -> std::io::Result<()> {
        fs::remove_dir_all(&self.cache_dir)
    }
}

fn ensure_dir_exists_and_is_empty(dir: &Path) -> Result<(), DaemonError> {
    let layout_err = |source| DaemonError::CacheLayout {
        path: dir.to_path_buf(),
        source,
    };

    match fs::metadata(dir) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return fs::create_dir_all(dir).map_err(layout_err);
        }
        Err(err) => return Err(layout_err(err)),
        Ok(meta) if !meta.is_dir() => {
            return Err(DaemonError::CachePathKind {
                path: dir.to_path_buf(),
                expected: "directory",
            });
        }
        Ok(_) => {}
    }

    for entry in fs::read_dir(dir).map_err(layout_err)? {
        let entry = entry.map_err(layout_err)?;
        let path = entry.path();
        let removed = if entry.file_type().map_err(layout_err)?.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.map_err(layout_err)?;
    }

    Ok(())
}

fn ensure_file_exists_and_is_empty(file: &Path) -> Result<(), DaemonError> {
    match fs::metadata(file) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
            return Err(DaemonError::CacheLayout {
                path: file.to_path_buf(),
                source: err,
            });
        }
        Ok(meta) if !meta.is_file() => {
            return Err(DaemonError::CachePathKind {
                path: file.to_path_buf(),
                expected: "file",
            });
        }
        _ => {}
    }

    fs::File::create(file)
        .map(|_| ())
        .map_err(|source| DaemonError::CacheLayout {
            path: file.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_layout_and_empties_leftovers() {
        let root = tempfile::tempdir().unwrap();
        let cache = root.path().join("spieven");

        fs::create_dir_all(cache.join("tasks")).unwrap();
        fs::write(cache.join("tasks").join("task_000.log"), "stale").unwrap();
        fs::write(cache.join("deactivatedTasks.ndjson"), "stale\n").unwrap();

        let files = FilePathProvider::with_cache_root(cache.clone()).unwrap();

        assert!(files.deactivated_tasks_file().exists());
        assert_eq!(
            fs::read_to_string(files.deactivated_tasks_file()).unwrap(),
            ""
        );
        assert_eq!(fs::read_dir(cache.join("tasks")).unwrap().count(), 0);
    }

    #[test]
    fn derived_paths_are_zero_padded() {
        let root = tempfile::tempdir().unwrap();
        let files = FilePathProvider::with_cache_root(root.path().join("c")).unwrap();

        assert!(files
            .task_log_file(7)
            .ends_with("tasks/task_007.log"));
        assert!(files
            .stdout_log_file(7, 12)
            .ends_with("tasks/task_007_stdout_012.log"));
    }

    #[test]
    fn cleanup_removes_cache_dir() {
        let root = tempfile::tempdir().unwrap();
        let cache = root.path().join("c");
        let files = FilePathProvider::with_cache_root(cache.clone()).unwrap();

        files.cleanup().unwrap();
        assert!(!cache.exists());
    }
}
