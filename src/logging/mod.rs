//! Command output log
//!
//! Every command sent over the channel is mirrored here before it runs, and
//! its result afterwards. Text is redacted, kept in a bounded in-memory view
//! and appended to a JSON-lines file that rotates at a fixed size.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MAX_VIEW_ENTRIES: usize = 10_000;

const MAX_ENTRY_LENGTH: usize = 8192;

/// 5 MB
const MAX_LOG_FILE_SIZE: u64 = 5 * 1024 * 1024;

static SECRETS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?s)-----BEGIN[^-]*PRIVATE KEY-----.*?-----END[^-]*PRIVATE KEY-----").unwrap(),
        Regex::new(r#"(?i)(password|passwd|pwd|passphrase)\s*[:=]\s*["']?[^\s"']+["']?"#).unwrap(),
        // CL parameters: PASSWORD(xyz), PWD(xyz)
        Regex::new(r"(?i)\b(password|pwd)\([^)]*\)").unwrap(),
    ]
});

/// Redact credentials and cap the length of mirrored text
pub fn redact(input: &str) -> String {
    let mut result = input.to_string();
    for pattern in SECRETS.iter() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }

    if result.len() > MAX_ENTRY_LENGTH {
        let mut cut = MAX_ENTRY_LENGTH;
        while !result.is_char_boundary(cut) {
            cut -= 1;
        }
        result = format!("{}... [truncated]", &result[..cut]);
    }
    result
}

/// One mirrored chunk: a command line, its stdin, or its JSON result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Milliseconds since the epoch
    pub timestamp: i64,
    pub connection: Option<String>,
    pub text: String,
}

/// Receives the mirrored command stream of a connection
pub trait OutputSink: Send + Sync {
    fn append(&self, content: &str);
    /// Drop the in-memory view; persisted entries are kept
    fn clear(&self);
}

/// Bounded in-memory view plus optional JSON-lines file
pub struct CommandLog {
    connection: Option<String>,
    view: RwLock<VecDeque<LogEntry>>,
    path: Option<PathBuf>,
}

impl CommandLog {
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            connection: None,
            view: RwLock::new(VecDeque::new()),
            path: None,
        })
    }

    /// Log persisted to `<logs_dir>/commands.log`; entries already in the
    /// file for `connection` are loaded into the view
    pub fn open(logs_dir: &Path, connection: impl Into<String>) -> std::io::Result<Arc<Self>> {
        fs::create_dir_all(logs_dir)?;
        let log = Self {
            connection: Some(connection.into()),
            view: RwLock::new(VecDeque::with_capacity(1024)),
            path: Some(logs_dir.join("commands.log")),
        };
        log.reload();
        Ok(Arc::new(log))
    }

    fn reload(&self) {
        let Some(file) = self.path.as_ref().and_then(|path| File::open(path).ok()) else {
            return;
        };

        let mut view = self.view.write();
        for line in BufReader::new(file).lines().map_while(Result::ok) {
            match serde_json::from_str::<LogEntry>(&line) {
                Ok(entry) if entry.connection == self.connection => push_bounded(&mut view, entry),
                Ok(_) => {}
                Err(e) => tracing::debug!("Skipping unreadable log line: {}", e),
            }
        }
    }

    fn persist(&self, entry: &LogEntry) {
        let Some(path) = self.path.as_ref() else {
            return;
        };

        if fs::metadata(path).map_or(false, |m| m.len() > MAX_LOG_FILE_SIZE) {
            let rotated = path.with_extension("log.1");
            let _ = fs::remove_file(&rotated);
            if let Err(e) = fs::rename(path, &rotated) {
                tracing::warn!("Could not rotate {:?}: {}", path, e);
            }
        }

        let written = serde_json::to_string(entry)
            .map_err(std::io::Error::from)
            .and_then(|json| {
                let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                writeln!(file, "{}", json)
            });
        if let Err(e) = written {
            tracing::warn!("Could not write to {:?}: {}", path, e);
        }
    }

    /// Latest `max` entries, optionally only those containing `search`
    pub fn recent(&self, max: usize, search: Option<&str>) -> Vec<LogEntry> {
        let search = search.map(str::to_lowercase);
        let view = self.view.read();
        let matching: Vec<&LogEntry> = view
            .iter()
            .filter(|entry| {
                search
                    .as_ref()
                    .map_or(true, |s| entry.text.to_lowercase().contains(s))
            })
            .collect();

        matching[matching.len().saturating_sub(max)..]
            .iter()
            .map(|entry| (*entry).clone())
            .collect()
    }
}

fn push_bounded(view: &mut VecDeque<LogEntry>, entry: LogEntry) {
    if view.len() >= MAX_VIEW_ENTRIES {
        view.pop_front();
    }
    view.push_back(entry);
}

impl OutputSink for CommandLog {
    fn append(&self, content: &str) {
        let entry = LogEntry {
            timestamp: chrono::Utc::now().timestamp_millis(),
            connection: self.connection.clone(),
            text: redact(content),
        };
        push_bounded(&mut self.view.write(), entry.clone());
        self.persist(&entry);
    }

    fn clear(&self) {
        self.view.write().clear();
    }
}
