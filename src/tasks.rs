//! Real-world task suggestions, read from a plain-text file.

use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Handed out when the task file is missing, empty, or unreadable.
pub const FALLBACK_TASK: &str = "Выполни простое задание: улыбнись!";

pub struct TaskStore {
    path: PathBuf,
}

impl TaskStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    /// One random task. Re-reads the file on every call so edits take
    /// effect without a restart; never fails.
    pub fn random_task(&self) -> String {
        let tasks = self.read_tasks();
        tasks
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| FALLBACK_TASK.to_string())
    }

    fn read_tasks(&self) -> Vec<String> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to read task file {:?}: {e}", self.path);
                return Vec::new();
            }
        };

        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_random_task_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "позвони другу\n\nсходи на прогулку").unwrap();

        let store = TaskStore::new(file.path());
        for _ in 0..10 {
            let task = store.random_task();
            assert!(task == "позвони другу" || task == "сходи на прогулку");
        }
    }

    #[test]
    fn test_empty_file_falls_back() {
        let file = NamedTempFile::new().unwrap();
        let store = TaskStore::new(file.path());
        assert_eq!(store.random_task(), FALLBACK_TASK);
    }

    #[test]
    fn test_blank_lines_only_falls_back() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "\n   \n\t\n").unwrap();
        let store = TaskStore::new(file.path());
        assert_eq!(store.random_task(), FALLBACK_TASK);
    }

    #[test]
    fn test_missing_file_falls_back() {
        let store = TaskStore::new("/nonexistent/tasks.txt");
        assert_eq!(store.random_task(), FALLBACK_TASK);
    }
}
