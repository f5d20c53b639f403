//! Append-only run ledger kept next to the outputs (`.history.jsonl`).

use crate::pipeline::RunState;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub const HISTORY_FILE_NAME: &str = ".history.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub timestamp: String,
    pub command: String,
    pub inputs: Vec<String>,
    pub output: String,
    pub state: RunState,
    pub items: usize,
    pub annotations: usize,
    #[serde(default)]
    pub removed: usize,
}

impl RunRecord {
    pub fn new(command: &str, inputs: &[PathBuf], output: &Path, state: RunState) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            command: command.to_string(),
            inputs: inputs.iter().map(|p| p.to_string_lossy().into_owned()).collect(),
            output: output.to_string_lossy().into_owned(),
            state,
            items: 0,
            annotations: 0,
            removed: 0,
        }
    }

    pub fn with_counts(mut self, items: usize, annotations: usize, removed: usize) -> Self {
        self.items = items;
        self.annotations = annotations;
        self.removed = removed;
        self
    }
}

pub fn history_path(dir: &Path) -> PathBuf {
    dir.join(HISTORY_FILE_NAME)
}

/// Append `record` as one JSON line to the ledger in `dir`.
pub fn append(dir: &Path, record: &RunRecord) -> io::Result<PathBuf> {
    let path = history_path(dir);
    let mut out = OpenOptions::new().create(true).append(true).open(&path)?;
    writeln!(out, "{}", serde_json::to_string(record)?)?;
    Ok(path)
}

/// Read every well-formed record, paired with its line index. Malformed
/// lines are logged and skipped.
pub fn load(dir: &Path) -> io::Result<Vec<(usize, RunRecord)>> {
    let reader = BufReader::new(File::open(history_path(dir))?);
    let mut records = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RunRecord>(&line) {
            Ok(record) => records.push((i, record)),
            Err(err) => log::warn!("Skipping malformed history entry {}: {}", i, err),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_append_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let inputs = vec![PathBuf::from("a"), PathBuf::from("b")];
        let first = RunRecord::new("merge", &inputs, temp_dir.path(), RunState::Merged).with_counts(10, 25, 2);
        let second = RunRecord::new("concat", &inputs, temp_dir.path(), RunState::Aborted);

        append(temp_dir.path(), &first).unwrap();
        let path = append(temp_dir.path(), &second).unwrap();
        assert_eq!(path, temp_dir.path().join(".history.jsonl"));

        let records = load(temp_dir.path()).unwrap();
        assert_eq!(records, vec![(0, first), (1, second)]);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let record = RunRecord::new("dedup", &[PathBuf::from("in")], temp_dir.path(), RunState::Merged);
        fs::write(
            history_path(temp_dir.path()),
            format!("not json\n{}\n", serde_json::to_string(&record).unwrap()),
        )
        .unwrap();

        let records = load(temp_dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, 1);
        assert_eq!(records[0].1.command, "dedup");
    }

    #[test]
    fn test_single_dataset_runs_are_completed() {
        let temp_dir = TempDir::new().unwrap();
        let record = RunRecord::new("filter", &[PathBuf::from("in")], temp_dir.path(), RunState::Completed);
        append(temp_dir.path(), &record).unwrap();

        let line = fs::read_to_string(history_path(temp_dir.path())).unwrap();
        assert!(line.contains("\"state\":\"Completed\""));
        assert_eq!(load(temp_dir.path()).unwrap()[0].1.state, RunState::Completed);
    }

    #[test]
    fn test_missing_ledger_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        assert!(load(temp_dir.path()).is_err());
    }
}
