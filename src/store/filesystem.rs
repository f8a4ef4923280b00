use super::{EventRecord, IterationRecord, Run, RunStore, StoreError};
use crate::shared::fs_atomic::{append_line, atomic_write_file};
use crate::shared::utc_now_iso;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// File-backed run store. Layout under the runs root:
///
/// ```text
/// <runs_dir>/<run_id>/state.json
/// <runs_dir>/<run_id>/iterations.jsonl
/// <runs_dir>/<run_id>/events.log
/// <runs_dir>/<run_id>/artifacts/...
/// ```
#[derive(Debug, Clone)]
pub struct FilesystemRunStore {
    runs_dir: PathBuf,
}

impl FilesystemRunStore {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    fn state_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("state.json")
    }

    fn iterations_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("iterations.jsonl")
    }

    fn events_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("events.log")
    }

    fn artifacts_dir(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("artifacts")
    }

    fn validate_artifact_path(rel_path: &str) -> Result<PathBuf, StoreError> {
        let normalized = rel_path.trim().replace('\\', "/");
        if normalized.is_empty() {
            return Err(StoreError::ArtifactPath {
                path: rel_path.to_string(),
                reason: "path is empty".to_string(),
            });
        }
        let candidate = Path::new(&normalized);
        if candidate.is_absolute() {
            return Err(StoreError::ArtifactPath {
                path: rel_path.to_string(),
                reason: "path must be relative".to_string(),
            });
        }
        if candidate
            .components()
            .any(|part| matches!(part, std::path::Component::ParentDir))
        {
            return Err(StoreError::ArtifactPath {
                path: rel_path.to_string(),
                reason: "path must not traverse upward".to_string(),
            });
        }
        Ok(candidate.to_path_buf())
    }

    fn list_files_recursive(root: &Path, base: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                Self::list_files_recursive(&path, base, out)?;
            } else if let Ok(rel) = path.strip_prefix(base) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }
}

impl RunStore for FilesystemRunStore {
    fn init_run(&self, run: &Run) -> Result<(), StoreError> {
        let artifacts = self.artifacts_dir(&run.run_id);
        fs::create_dir_all(&artifacts).map_err(|source| io_error(&artifacts, source))?;
        self.write_state(run)?;
        self.append_event(&run.run_id, &format!("run initialized task={:?}", run.task))
    }

    fn write_state(&self, run: &Run) -> Result<(), StoreError> {
        let path = self.state_path(&run.run_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
        }
        let body = serde_json::to_vec_pretty(run).map_err(|source| json_error(&path, source))?;
        atomic_write_file(&path, &body).map_err(|source| io_error(&path, source))
    }

    fn read_state(&self, run_id: &str) -> Result<Run, StoreError> {
        let path = self.state_path(run_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(source) if source.kind() == ErrorKind::NotFound => {
                return Err(StoreError::UnknownRun {
                    run_id: run_id.to_string(),
                })
            }
            Err(source) => return Err(io_error(&path, source)),
        };
        serde_json::from_str(&raw).map_err(|source| json_error(&path, source))
    }

    fn run_exists(&self, run_id: &str) -> bool {
        self.state_path(run_id).is_file()
    }

    fn append_iteration(&self, record: &IterationRecord) -> Result<(), StoreError> {
        let path = self.iterations_path(&record.run_id);
        let line =
            serde_json::to_string(record).map_err(|source| json_error(&path, source))?;
        append_line(&path, &line).map_err(|source| io_error(&path, source))
    }

    fn read_iterations(&self, run_id: &str) -> Result<Vec<IterationRecord>, StoreError> {
        let path = self.iterations_path(run_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(source) if source.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(io_error(&path, source)),
        };
        let mut records = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(line).map_err(|source| json_error(&path, source))?);
        }
        Ok(records)
    }

    fn append_event(&self, run_id: &str, message: &str) -> Result<(), StoreError> {
        let path = self.events_path(run_id);
        let line = format!("{} {}", utc_now_iso(), message);
        append_line(&path, &line).map_err(|source| io_error(&path, source))
    }

    fn read_events(&self, run_id: &str, from_offset: u64) -> Result<Vec<EventRecord>, StoreError> {
        let path = self.events_path(run_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(source) if source.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(io_error(&path, source)),
        };
        let mut events = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            let offset = index as u64;
            if offset < from_offset || line.trim().is_empty() {
                continue;
            }
            let (timestamp, message) = match line.split_once(' ') {
                Some((ts, rest)) => (ts.to_string(), rest.to_string()),
                None => (String::new(), line.to_string()),
            };
            events.push(EventRecord {
                offset,
                timestamp,
                message,
            });
        }
        Ok(events)
    }

    fn write_artifact(&self, run_id: &str, rel_path: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let rel = Self::validate_artifact_path(rel_path)?;
        let target = self.artifacts_dir(run_id).join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
        }
        fs::write(&target, bytes).map_err(|source| io_error(&target, source))
    }

    fn list_artifacts(&self, run_id: &str) -> Result<Vec<String>, StoreError> {
        let root = self.artifacts_dir(run_id);
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        Self::list_files_recursive(&root, &root, &mut out)
            .map_err(|source| io_error(&root, source))?;
        out.sort();
        Ok(out)
    }

    fn request_cancel(&self, run_id: &str) -> Result<(), StoreError> {
        let mut run = self.read_state(run_id)?;
        run.cancel_requested = true;
        run.updated_at = utc_now_iso();
        self.write_state(&run)?;
        self.append_event(run_id, "cancel requested")
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn json_error(path: &Path, source: serde_json::Error) -> StoreError {
    StoreError::Json {
        path: path.display().to_string(),
        source,
    }
}
