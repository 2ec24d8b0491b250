//! Request log: a bounded in-memory ring of entries mirrored to a JSONL file.
//!
//! Process-level diagnostics go through `tracing`; this log keeps the
//! per-request trail (upstream calls, stream anomalies, defensive fallbacks)
//! tagged with the completion id so a single request can be followed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

const MAX_LOG_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            component: component.into(),
            request_id: None,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, ctx: serde_json::Value) -> Self {
        self.context = Some(ctx);
        self
    }
}

struct Logger {
    entries: VecDeque<LogEntry>,
    writer: Option<BufWriter<File>>,
}

impl Logger {
    fn open(file_path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut entries = VecDeque::with_capacity(MAX_LOG_ENTRIES);

        if file_path.exists() {
            let reader = BufReader::new(File::open(file_path)?);
            for line in reader.lines().map_while(std::result::Result::ok) {
                if let Ok(entry) = serde_json::from_str::<LogEntry>(&line) {
                    if entries.len() >= MAX_LOG_ENTRIES {
                        entries.pop_front();
                    }
                    entries.push_back(entry);
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        Ok(Self {
            entries,
            writer: Some(BufWriter::new(file)),
        })
    }

    fn in_memory() -> Self {
        Self {
            entries: VecDeque::new(),
            writer: None,
        }
    }

    fn log(&mut self, entry: LogEntry) {
        if let Some(ref mut writer) = self.writer {
            if let Ok(json) = serde_json::to_string(&entry) {
                let _ = writeln!(writer, "{json}");
                let _ = writer.flush();
            }
        }
        if self.entries.len() >= MAX_LOG_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }
}

#[derive(Clone)]
pub struct SharedLogger(Arc<Mutex<Logger>>);

impl SharedLogger {
    pub fn new(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self(Arc::new(Mutex::new(Logger::open(file_path.as_ref())?))))
    }

    /// A logger that keeps entries in memory only.
    #[must_use]
    pub fn in_memory() -> Self {
        Self(Arc::new(Mutex::new(Logger::in_memory())))
    }

    /// Record an entry and mirror it to `tracing`.
    pub fn log(&self, entry: LogEntry) {
        trace_entry(&entry);
        if let Ok(mut logger) = self.0.lock() {
            logger.log(entry);
        }
    }

    pub fn info(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Info, component, message));
    }

    pub fn warn(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Warn, component, message));
    }

    pub fn error(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Error, component, message));
    }

    /// Handle that stamps every entry with `request_id`.
    #[must_use]
    pub fn for_request(&self, request_id: impl Into<String>) -> RequestLogger {
        RequestLogger {
            inner: self.clone(),
            request_id: request_id.into(),
        }
    }

    /// Most recent entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.0
            .lock()
            .map(|l| l.entries.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct RequestLogger {
    inner: SharedLogger,
    request_id: String,
}

impl RequestLogger {
    fn emit(&self, level: LogLevel, component: &str, message: String, context: Option<serde_json::Value>) {
        let mut entry = LogEntry::new(level, component, message).with_request(&self.request_id);
        if let Some(ctx) = context {
            entry = entry.with_context(ctx);
        }
        self.inner.log(entry);
    }

    pub fn info(&self, component: &str, message: impl Into<String>) {
        self.emit(LogLevel::Info, component, message.into(), None);
    }

    pub fn warn(&self, component: &str, message: impl Into<String>) {
        self.emit(LogLevel::Warn, component, message.into(), None);
    }

    pub fn error(&self, component: &str, message: impl Into<String>) {
        self.emit(LogLevel::Error, component, message.into(), None);
    }

    /// Log an anomaly together with the offending payload, truncated.
    pub fn anomaly(&self, component: &str, message: impl Into<String>, payload: &str) {
        let excerpt: String = payload.chars().take(300).collect();
        self.emit(
            LogLevel::Warn,
            component,
            message.into(),
            Some(serde_json::json!({ "payload": excerpt, "len": payload.len() })),
        );
    }
}

fn trace_entry(entry: &LogEntry) {
    let component = entry.component.as_str();
    let request_id = entry.request_id.as_deref().unwrap_or("-");
    let message = entry.message.as_str();
    match entry.level {
        LogLevel::Info => tracing::info!(request_id, component, "{message}"),
        LogLevel::Warn => tracing::warn!(request_id, component, "{message}"),
        LogLevel::Error => tracing::error!(request_id, component, "{message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_logger_tags_entries() {
        let logger = SharedLogger::in_memory();
        let req = logger.for_request("chatcmpl-abc");
        req.info("proxy", "calling upstream");
        req.anomaly("stream", "bad frame", "not json");
        logger.info("startup", "ready");

        let recent = logger.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].component, "startup");
        assert!(recent[0].request_id.is_none());
        assert_eq!(recent[1].request_id.as_deref(), Some("chatcmpl-abc"));
        assert_eq!(recent[1].level, LogLevel::Warn);
        assert_eq!(recent[1].context.as_ref().unwrap()["payload"], "not json");
    }

    #[test]
    fn test_file_logger_reloads_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.log");

        {
            let logger = SharedLogger::new(&path).unwrap();
            logger.warn("proxy", "first");
            logger.error("proxy", "second");
        }

        let reopened = SharedLogger::new(&path).unwrap();
        let recent = reopened.recent(5);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "second");
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_entries_reach_tracing() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let logger = SharedLogger::in_memory();
        tracing::subscriber::with_default(subscriber, || {
            logger.error("server", "Proxy error: upstream down");
            logger.for_request("chatcmpl-xyz").warn("stream", "bad frame");
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Proxy error: upstream down"));
        assert!(output.contains("ERROR"));
        assert!(output.contains("chatcmpl-xyz"));
        assert!(output.contains("bad frame"));
        assert_eq!(logger.recent(10).len(), 2);
    }
}
