//! Append-only `sessions.jsonl` sibling to `state.json`. Load reads the
//! whole file, dedupes by `id` (last write wins), returns newest-first;
//! prune dedupes first, then drops the oldest entries beyond the repo cap,
//! then rewrites the file.

use std::collections::HashMap;
use std::path::PathBuf;

use hydra_core::SessionLog;

#[derive(Debug, thiserror::Error)]
pub enum SessionLogError {
    #[error("failed to read sessions file {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("failed to write sessions file {0}: {1}")]
    Write(PathBuf, #[source] std::io::Error),
}

pub struct SessionLogStore {
    path: PathBuf,
}

impl SessionLogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append one session record. Does not dedupe on write — dedup happens
    /// on read, so a crash mid-append never loses the previous record.
    pub fn append(&self, session: &SessionLog) -> Result<(), SessionLogError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SessionLogError::Write(self.path.clone(), e))?;
        }
        let line = serde_json::to_string(session).expect("SessionLog always serializes");
        use std::io::Write as _;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SessionLogError::Write(self.path.clone(), e))?;
        writeln!(file, "{line}").map_err(|e| SessionLogError::Write(self.path.clone(), e))?;
        Ok(())
    }

    /// Newest-first, deduplicated by id (last write in the file wins).
    pub fn load(&self) -> Result<Vec<SessionLog>, SessionLogError> {
        let sessions = self.load_deduped()?;
        Ok(sessions)
    }

    pub fn get(&self, id: &str) -> Result<Option<SessionLog>, SessionLogError> {
        Ok(self.load_deduped()?.into_iter().find(|s| s.id == id))
    }

    fn load_deduped(&self) -> Result<Vec<SessionLog>, SessionLogError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SessionLogError::Read(self.path.clone(), e)),
        };

        let mut by_id: HashMap<String, SessionLog> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(session) = serde_json::from_str::<SessionLog>(line) else {
                continue;
            };
            if !by_id.contains_key(&session.id) {
                order.push(session.id.clone());
            }
            by_id.insert(session.id.clone(), session);
        }

        let mut sessions: Vec<SessionLog> =
            order.into_iter().filter_map(|id| by_id.remove(&id)).collect();
        sessions.reverse(); // newest-first: last line for an id wins and sorts first
        Ok(sessions)
    }

    /// Dedupe, then keep only the newest `cap` entries, then rewrite the
    /// file from scratch.
    pub fn prune(&self, cap: usize) -> Result<(), SessionLogError> {
        let mut sessions = self.load_deduped()?;
        sessions.truncate(cap);
        sessions.reverse(); // back to oldest-first for on-disk order
        self.rewrite(&sessions)
    }

    fn rewrite(&self, sessions: &[SessionLog]) -> Result<(), SessionLogError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SessionLogError::Write(self.path.clone(), e))?;
        }
        let mut out = String::new();
        for s in sessions {
            out.push_str(&serde_json::to_string(s).expect("SessionLog always serializes"));
            out.push('\n');
        }
        std::fs::write(&self.path, out).map_err(|e| SessionLogError::Write(self.path.clone(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hydra_core::SessionStatus;

    fn session(id: &str) -> SessionLog {
        SessionLog {
            id: id.to_string(),
            repo: "owner/repo".into(),
            started_at: Utc::now(),
            ended_at: None,
            issues_processed: vec![],
            issues_succeeded: 0,
            issues_failed: 0,
            status: SessionStatus::Active,
        }
    }

    #[test]
    fn dedup_keeps_last_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionLogStore::new(dir.path().join("sessions.jsonl"));
        let mut first = session("a");
        store.append(&first).unwrap();
        first.status = SessionStatus::Completed;
        store.append(&first).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, SessionStatus::Completed);
    }

    #[test]
    fn prune_drops_oldest_beyond_cap() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionLogStore::new(dir.path().join("sessions.jsonl"));
        for i in 0..5 {
            store.append(&session(&i.to_string())).unwrap();
        }
        store.prune(3).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].id, "4");
        assert_eq!(loaded[2].id, "2");
    }
}
