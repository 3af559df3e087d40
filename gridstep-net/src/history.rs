//! Append-only client connection history.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;

use gridstep_core::ClientKind;

/// Audit log of client connect/disconnect events.
///
/// One line per event, `<+S|+A|->,<name>,<unix timestamp>`. Write failures
/// are logged and swallowed; an unwritable history never takes a session
/// down with it.
pub struct HistoryWriter {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl HistoryWriter {
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(
                    "cannot open client history at {}: {}; history disabled",
                    path.display(),
                    e
                );
                None
            }
        };
        HistoryWriter {
            path,
            file: Mutex::new(file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records a completed registration.
    pub fn connected(&self, kind: ClientKind, name: &str) {
        self.append(kind.history_tag(), name);
    }

    /// Records the disconnect of a registered client.
    pub fn disconnected(&self, name: &str) {
        self.append("-", name);
    }

    fn append(&self, tag: &str, name: &str) {
        let mut file = self.file.lock().unwrap();
        if let Some(file) = file.as_mut() {
            let line = format!("{},{},{}\n", tag, name, Utc::now().timestamp());
            if let Err(e) = file.write_all(line.as_bytes()) {
                warn!("client history write failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_append_one_line_each() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.txt");
        let history = HistoryWriter::open(&path);
        history.connected(ClientKind::Synchronous, "house-1");
        history.connected(ClientKind::Asynchronous, "pv-array");
        history.disconnected("house-1");

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("+S,house-1,"));
        assert!(lines[1].starts_with("+A,pv-array,"));
        assert!(lines[2].starts_with("-,house-1,"));
        for line in lines {
            let ts = line.rsplit(',').next().unwrap();
            assert!(ts.parse::<i64>().unwrap() > 0);
        }
    }

    #[test]
    fn unwritable_path_disables_history_quietly() {
        let history = HistoryWriter::open("/nonexistent-dir/history.txt");
        // no panic, events are dropped
        history.connected(ClientKind::Synchronous, "house-1");
        history.disconnected("house-1");
    }
}
