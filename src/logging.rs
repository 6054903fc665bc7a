//! Diagnostics journal: a bounded ring of recent notable events, mirrored to a JSONL file.
//!
//! Regular request logging goes through `tracing`. The journal keeps the things an
//! operator wants to inspect after the fact (upstream failures, malformed upstream
//! bodies, skipped stream chunks) and serves them at `GET /debug/diagnostics`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const MAX_ENTRIES: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    Startup,
    /// The upstream answered with a non-2xx status.
    UpstreamStatus,
    /// A 2xx upstream body without the expected shape.
    UpstreamProtocol,
    /// The connection to the upstream failed.
    Transport,
    /// One stream payload could not be decoded and was skipped.
    SkippedChunk,
    /// The caller sent something we could not parse.
    MalformedInput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: DiagnosticKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl DiagnosticEntry {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            upstream: None,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_upstream(mut self, alias: impl Into<String>) -> Self {
        self.upstream = Some(alias.into());
        self
    }

    pub fn with_context(mut self, ctx: serde_json::Value) -> Self {
        self.context = Some(ctx);
        self
    }
}

struct Journal {
    entries: VecDeque<DiagnosticEntry>,
    file: Option<JournalFile>,
}

/// Backing JSONL file. Rewritten from the ring once it holds twice the ring's
/// capacity, so it stays bounded across long runs.
struct JournalFile {
    path: PathBuf,
    writer: BufWriter<File>,
    lines: usize,
}

impl JournalFile {
    fn append(path: &Path, lines: usize) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            lines,
        })
    }

    fn write(&mut self, entry: &DiagnosticEntry) -> std::io::Result<()> {
        let json = serde_json::to_string(entry)?;
        writeln!(self.writer, "{}", json)?;
        self.writer.flush()?;
        self.lines += 1;
        Ok(())
    }

    /// Replace the file contents with `entries`.
    fn rewrite<'a>(
        &mut self,
        entries: impl Iterator<Item = &'a DiagnosticEntry>,
    ) -> std::io::Result<()> {
        let mut out = BufWriter::new(File::create(&self.path)?);
        let mut lines = 0;
        for entry in entries {
            writeln!(out, "{}", serde_json::to_string(entry)?)?;
            lines += 1;
        }
        out.flush()?;
        *self = Self::append(&self.path, lines)?;
        Ok(())
    }
}

impl Journal {
    fn in_memory() -> Self {
        Self {
            entries: VecDeque::with_capacity(64),
            file: None,
        }
    }

    /// Reload what an earlier run left in `file_path` and keep appending to it.
    fn open(file_path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut entries = VecDeque::with_capacity(64);
        let mut lines = 0;
        if file_path.exists() {
            let reader = BufReader::new(File::open(file_path)?);
            for line in reader.lines().map_while(std::result::Result::ok) {
                lines += 1;
                if let Ok(entry) = serde_json::from_str::<DiagnosticEntry>(&line) {
                    if entries.len() >= MAX_ENTRIES {
                        entries.pop_front();
                    }
                    entries.push_back(entry);
                }
            }
        }

        let mut file = JournalFile::append(file_path, lines)?;
        if lines > entries.len() {
            file.rewrite(entries.iter())?;
        }

        Ok(Self {
            entries,
            file: Some(file),
        })
    }

    fn record(&mut self, entry: DiagnosticEntry) {
        if self.entries.len() >= MAX_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);

        let Some(file) = self.file.as_mut() else {
            return;
        };
        let result = if file.lines >= 2 * MAX_ENTRIES {
            file.rewrite(self.entries.iter())
        } else {
            self.entries.back().map_or(Ok(()), |e| file.write(e))
        };
        if let Err(e) = result {
            tracing::warn!(path = %file.path.display(), "Failed to write diagnostics journal: {}", e);
        }
    }
}

/// Cloneable handle to the journal; clones share the same entries.
#[derive(Clone)]
pub struct DiagnosticsLog(Arc<Mutex<Journal>>);

impl DiagnosticsLog {
    pub fn in_memory() -> Self {
        Self(Arc::new(Mutex::new(Journal::in_memory())))
    }

    pub fn open(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self(Arc::new(Mutex::new(Journal::open(file_path.as_ref())?))))
    }

    pub fn record(&self, entry: DiagnosticEntry) {
        if let Ok(mut journal) = self.0.lock() {
            journal.record(entry);
        }
    }

    pub fn note(&self, kind: DiagnosticKind, message: impl Into<String>) {
        self.record(DiagnosticEntry::new(kind, message));
    }

    /// Most recent entries first.
    pub fn recent(&self, limit: usize) -> Vec<DiagnosticEntry> {
        self.0
            .lock()
            .map(|j| j.entries.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.0.lock().map(|j| j.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for DiagnosticsLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticsLog")
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recent_is_newest_first() {
        let log = DiagnosticsLog::in_memory();
        log.note(DiagnosticKind::Startup, "one");
        log.note(DiagnosticKind::SkippedChunk, "two");

        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "two");
        assert_eq!(log.recent(1).len(), 1);
    }

    #[test]
    fn test_ring_is_bounded() {
        let log = DiagnosticsLog::in_memory();
        for i in 0..MAX_ENTRIES + 5 {
            log.note(DiagnosticKind::Transport, format!("e{i}"));
        }
        assert_eq!(log.len(), MAX_ENTRIES);
        assert_eq!(log.recent(1)[0].message, format!("e{}", MAX_ENTRIES + 4));
    }

    #[test]
    fn test_journal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("diagnostics.jsonl");

        let log = DiagnosticsLog::open(&path).unwrap();
        log.record(
            DiagnosticEntry::new(DiagnosticKind::UpstreamProtocol, "no choices")
                .with_upstream("main")
                .with_context(json!({"body": "{}"})),
        );
        drop(log);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"kind\":\"upstream_protocol\""));

        let reopened = DiagnosticsLog::open(&path).unwrap();
        let entries = reopened.recent(10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].upstream.as_deref(), Some("main"));
        assert_eq!(entries[0].kind, DiagnosticKind::UpstreamProtocol);
    }

    fn line_count(path: &Path) -> usize {
        std::fs::read_to_string(path).unwrap().lines().count()
    }

    #[test]
    fn test_journal_file_is_compacted_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diagnostics.jsonl");

        let mut contents = String::from("not json\n");
        for i in 0..MAX_ENTRIES + 50 {
            let entry = DiagnosticEntry::new(DiagnosticKind::Transport, format!("e{i}"));
            contents.push_str(&serde_json::to_string(&entry).unwrap());
            contents.push('\n');
        }
        std::fs::write(&path, contents).unwrap();

        let log = DiagnosticsLog::open(&path).unwrap();
        assert_eq!(log.len(), MAX_ENTRIES);
        assert_eq!(line_count(&path), MAX_ENTRIES);

        log.note(DiagnosticKind::Startup, "after");
        assert_eq!(line_count(&path), MAX_ENTRIES + 1);
        assert_eq!(log.recent(1)[0].message, "after");
    }

    #[test]
    fn test_journal_file_stays_bounded_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diagnostics.jsonl");

        let log = DiagnosticsLog::open(&path).unwrap();
        for i in 0..2 * MAX_ENTRIES + 10 {
            log.note(DiagnosticKind::SkippedChunk, format!("e{i}"));
        }
        assert!(line_count(&path) <= 2 * MAX_ENTRIES);
        drop(log);

        let reopened = DiagnosticsLog::open(&path).unwrap();
        assert_eq!(reopened.len(), MAX_ENTRIES);
        assert_eq!(
            reopened.recent(1)[0].message,
            format!("e{}", 2 * MAX_ENTRIES + 9)
        );
    }
}
