//! Recording file naming and lifecycle in the app-private directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

const PREFIX: &str = "recording_";
const EXTENSION: &str = "wav";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RecordingStore {
    dir: PathBuf,
}

impl RecordingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    /// A fresh, never-reused path: `recording_<unix>_<uuid>.wav`.
    pub fn allocate_path(&self) -> PathBuf {
        let timestamp = Utc::now().timestamp();
        let id = uuid::Uuid::new_v4();
        self.dir
            .join(format!("{}{}_{}.{}", PREFIX, timestamp, id, EXTENSION))
    }

    /// Remove a recording. Already-absent files are not an error.
    pub fn delete(path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Ok(()) => {
                log::info!("Deleted recording {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Recordings in the directory, newest first. A missing directory is empty.
    pub fn list(&self) -> io::Result<Vec<RecordingInfo>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut recordings = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !is_recording_file(&path) {
                continue;
            }
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            recordings.push(RecordingInfo {
                path,
                size_bytes: metadata.len(),
                modified: metadata.modified()?.into(),
            });
        }
        recordings.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));
        Ok(recordings)
    }
}

fn is_recording_file(path: &Path) -> bool {
    let name_ok = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(PREFIX));
    let ext_ok = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(EXTENSION));
    name_ok && ext_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_paths_are_unique_and_well_formed() {
        let store = RecordingStore::new("/tmp/recordings");
        let a = store.allocate_path();
        let b = store.allocate_path();
        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(Path::new("/tmp/recordings")));
        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("recording_"));
        assert!(name.ends_with(".wav"));
        let stem = name.trim_start_matches("recording_").trim_end_matches(".wav");
        let (timestamp, id) = stem.split_once('_').unwrap();
        assert!(timestamp.parse::<i64>().is_ok());
        assert!(uuid::Uuid::parse_str(id).is_ok());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recording_1_x.wav");
        fs::write(&path, b"RIFF").unwrap();
        RecordingStore::delete(&path).unwrap();
        assert!(!path.exists());
        RecordingStore::delete(&path).unwrap();
    }

    #[test]
    fn delete_surfaces_other_errors() {
        let dir = tempfile::tempdir().unwrap();
        // Removing a directory with remove_file fails with something other than NotFound.
        assert!(RecordingStore::delete(dir.path()).is_err());
    }

    #[test]
    fn lists_only_recordings() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordingStore::new(dir.path().join("nested"));
        assert!(store.list().unwrap().is_empty());

        store.ensure_dir().unwrap();
        let first = store.allocate_path();
        fs::write(&first, b"one").unwrap();
        fs::write(store.dir().join("notes.txt"), b"ignored").unwrap();
        let second = store.allocate_path();
        fs::write(&second, b"second").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|r| r.path == first && r.size_bytes == 3));
        assert!(listed.iter().any(|r| r.path == second && r.size_bytes == 6));
        assert!(listed[0].modified >= listed[1].modified);
    }

    #[test]
    fn listing_serializes_with_rfc3339_times() {
        let info = RecordingInfo {
            path: PathBuf::from("/tmp/recording_1_x.wav"),
            size_bytes: 44,
            modified: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["size_bytes"], 44);
        assert_eq!(json["modified"], "2023-11-14T22:13:20Z");
    }
}
