//! Append-only workspace audit log.
//!
//! Every externally observable mutation a tool performs is recorded as a
//! single JSONL line in `<workspace_root>/.coworker_audit.jsonl`. Appends
//! are serialized by the kernel's `O_APPEND` semantics and flushed to disk
//! before the append call returns; the file is never truncated or
//! rewritten.
//!
//! Records carry the originating `job_id`. A job re-executed after lease
//! expiry may legitimately append duplicate entries; consumers reconcile
//! by `job_id`.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name of the audit log inside each workspace root.
pub const AUDIT_FILE_NAME: &str = ".coworker_audit.jsonl";

/// Errors from audit log operations.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The log file could not be opened, written, or synced.
    #[error("audit log I/O failed at {path}: {source}")]
    Io {
        /// The audit file path.
        path: PathBuf,
        /// The underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// An entry could not be serialized to JSON.
    #[error("audit entry serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A single append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Wall-clock milliseconds since the Unix epoch at append time.
    pub ts_ms: u64,
    /// The job that performed the mutation.
    pub job_id: String,
    /// Short action name, e.g. `move`, `soft_delete`, `restore`.
    pub action: String,
    /// Primary path the action touched, absolute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Action-specific detail (destination path, skip reason, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// Handle on one workspace root's audit log.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// The audit log for a workspace root.
    #[must_use]
    pub fn for_workspace(workspace_root: &Path) -> Self {
        Self {
            path: workspace_root.join(AUDIT_FILE_NAME),
        }
    }

    /// The on-disk path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one entry as a single JSON line and syncs it to disk.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] on open/write/sync failure and
    /// [`AuditError::Serialize`] if the entry cannot be encoded.
    pub fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let io_err = |source: std::io::Error| AuditError::Io {
            path: self.path.clone(),
            source,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(&io_err)?;
        file.write_all(&line).map_err(&io_err)?;
        file.sync_data().map_err(&io_err)?;
        Ok(())
    }

    /// Binds this log to a job, producing an appender that stamps every
    /// entry with the job id and a caller-supplied clock value.
    #[must_use]
    pub fn scoped(&self, job_id: impl Into<String>) -> JobAudit {
        JobAudit {
            log: self.clone(),
            job_id: job_id.into(),
        }
    }

    /// Case-insensitive substring search over the log, returning up to the
    /// last `limit` matching lines in file order.
    ///
    /// A missing log file yields an empty result rather than an error.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] if the file exists but cannot be read.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<String>, AuditError> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(AuditError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let needle = query.to_lowercase();
        let mut matches = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|source| AuditError::Io {
                path: self.path.clone(),
                source,
            })?;
            if line.to_lowercase().contains(&needle) {
                matches.push(line);
            }
        }
        if matches.len() > limit {
            matches.drain(..matches.len() - limit);
        }
        Ok(matches)
    }
}

/// Append capability scoped to a single job.
///
/// This is the only handle tool handlers receive for recording mutations;
/// it forces every record to carry the owning `job_id`.
#[derive(Debug, Clone)]
pub struct JobAudit {
    log: AuditLog,
    job_id: String,
}

impl JobAudit {
    /// Appends an action record for the owning job.
    ///
    /// # Errors
    ///
    /// Propagates [`AuditError`] from the underlying log.
    pub fn append(
        &self,
        ts_ms: u64,
        action: &str,
        path: Option<&Path>,
        extra: Option<serde_json::Value>,
    ) -> Result<(), AuditError> {
        self.log.append(&AuditEntry {
            ts_ms,
            job_id: self.job_id.clone(),
            action: action.to_string(),
            path: path.map(|p| p.display().to_string()),
            extra,
        })
    }

    /// The job this appender is bound to.
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn entry(job_id: &str, action: &str) -> AuditEntry {
        AuditEntry {
            ts_ms: 1_700_000_000_000,
            job_id: job_id.to_string(),
            action: action.to_string(),
            path: Some("/w/a.txt".to_string()),
            extra: None,
        }
    }

    #[test]
    fn appends_one_line_per_entry() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::for_workspace(dir.path());

        log.append(&entry("j1", "move")).unwrap();
        log.append(&entry("j2", "soft_delete")).unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: AuditEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.job_id, "j1");
        assert_eq!(first.action, "move");
    }

    #[test]
    fn file_only_grows() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::for_workspace(dir.path());

        let mut last = 0;
        for i in 0..5 {
            log.append(&entry(&format!("j{i}"), "move")).unwrap();
            let size = std::fs::metadata(log.path()).unwrap().len();
            assert!(size > last);
            last = size;
        }
    }

    #[test]
    fn scoped_appender_stamps_job_id() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::for_workspace(dir.path());
        let audit = log.scoped("job-42");

        audit
            .append(
                7,
                "restore",
                Some(Path::new("/w/x")),
                Some(serde_json::json!({"to": "/w/y"})),
            )
            .unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        let parsed: AuditEntry = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(parsed.job_id, "job-42");
        assert_eq!(parsed.ts_ms, 7);
        assert_eq!(parsed.extra.unwrap()["to"], "/w/y");
    }

    #[test]
    fn search_is_case_insensitive_and_bounded() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::for_workspace(dir.path());

        for i in 0..30 {
            log.append(&entry(&format!("Job-{i}"), "MOVE")).unwrap();
        }

        let hits = log.search("move", 20).unwrap();
        assert_eq!(hits.len(), 20);
        assert!(hits[0].contains("Job-10"));

        assert!(log.search("no_such_action", 20).unwrap().is_empty());
    }

    #[test]
    fn search_on_missing_log_is_empty() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::for_workspace(dir.path());
        assert!(log.search("anything", 5).unwrap().is_empty());
    }
}
