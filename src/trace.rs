//! Append-only audit log of agent decisions.
//!
//! Every pipeline stage records what it did and why through a shared
//! [`TraceLogger`]. The log is a pure side channel — nothing reads it back
//! into pipeline logic, and a failed write never propagates to the caller.
//!
//! The logger is constructed once in the composition root and injected into
//! each stage as `Arc<TraceLogger>`; there is no ambient global.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub timestamp: String,
    pub agent: String,
    pub action: String,
    pub details: serde_json::Value,
}

/// Crash-safe audit sink: the full entry array is rewritten on every
/// append so a crash loses at most the in-flight entry.
pub struct TraceLogger {
    path: PathBuf,
    // Single writer lock — all three stages log concurrently.
    lock: Mutex<()>,
}

impl TraceLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    /// Append one entry. Failures are reported via `tracing` and swallowed;
    /// losing the audit log must never stall the pipeline.
    pub fn log(&self, agent: &str, action: &str, details: serde_json::Value) {
        let entry = TraceEntry {
            timestamp: Utc::now().to_rfc3339(),
            agent: agent.to_string(),
            action: action.to_string(),
            details,
        };

        let guard = match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = self.append(entry) {
            warn!(error = %err, "trace append failed");
        }
        drop(guard);
    }

    /// Read-modify-write of the JSON array file. A missing or unparsable
    /// file is treated as empty.
    fn append(&self, entry: TraceEntry) -> anyhow::Result<()> {
        use anyhow::Context;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }

        let mut entries: Vec<TraceEntry> = match std::fs::read_to_string(&self.path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        entries.push(entry);

        let json = serde_json::to_string_pretty(&entries)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("failed to write trace log {}", self.path.display()))?;
        Ok(())
    }

    /// All entries currently on disk. Unparsable or missing files read as
    /// empty.
    pub fn entries(&self) -> Vec<TraceEntry> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let logger = TraceLogger::new(dir.path().join("trace.json"));

        logger.log("Perception", "routed", serde_json::json!({"action": "NORMALIZE"}));
        logger.log("Linker", "linked", serde_json::json!({"entities": 2}));

        let entries = logger.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].agent, "Perception");
        assert_eq!(entries[1].action, "linked");
    }

    #[test]
    fn corrupt_file_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.json");
        std::fs::write(&path, "not json at all").unwrap();

        let logger = TraceLogger::new(&path);
        assert!(logger.entries().is_empty());

        logger.log("Normalizer", "fallback", serde_json::Value::Null);
        assert_eq!(logger.entries().len(), 1);
    }
}
