//! Durable log collection on the host side.
//!
//! Every event and metric the host receives is appended, in arrival order, to
//! `events.jsonl` or `metrics.jsonl` under the session's log directory. Each
//! line is a [`LogRecord`]: the item's own fields plus a `seq` shared by both
//! files and a host-side `received_at` timestamp. Files are created if missing
//! and appended to otherwise.
//!
//! Writes are flushed to the OS after each record, so a crashed worker loses
//! nothing the host has already received. [`LogCollector::flush`] and
//! [`LogCollector::close`] additionally sync the files to disk.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::bridge::protocol::{Event, Metric, StreamItem};

pub const EVENTS_FILE: &str = "events.jsonl";
pub const METRICS_FILE: &str = "metrics.jsonl";

/// One line of a log file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord<T> {
    /// Arrival order across both files, starting at 1.
    pub seq: u64,
    pub received_at: DateTime<Utc>,
    #[serde(flatten)]
    pub item: T,
}

pub type EventRecord = LogRecord<Event>;
pub type MetricRecord = LogRecord<Metric>;

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("log I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid log record in {}: {source}", path.display())]
    Record {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("log collector is closed")]
    Closed,
}

/// Records written so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LogCounts {
    pub events: u64,
    pub metrics: u64,
}

struct LogFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl LogFile {
    fn open(path: PathBuf) -> Result<Self, CollectorError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| CollectorError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    fn append<T: Serialize>(&mut self, record: &LogRecord<T>) -> Result<(), CollectorError> {
        let mut line = serde_json::to_vec(record).map_err(|source| CollectorError::Record {
            path: self.path.clone(),
            source,
        })?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .and_then(|()| self.writer.flush())
            .map_err(|source| self.io_error(source))
    }

    fn sync(&mut self) -> Result<(), CollectorError> {
        self.writer
            .flush()
            .and_then(|()| self.writer.get_ref().sync_data())
            .map_err(|source| self.io_error(source))
    }

    fn io_error(&self, source: io::Error) -> CollectorError {
        CollectorError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Append-only sink for one session's events and metrics.
pub struct LogCollector {
    dir: PathBuf,
    files: Option<(LogFile, LogFile)>,
    next_seq: u64,
    last_received: Option<DateTime<Utc>>,
    counts: LogCounts,
}

impl LogCollector {
    /// Create the directory if needed and open both log files.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self, CollectorError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| CollectorError::Io {
            path: dir.clone(),
            source,
        })?;
        let events = LogFile::open(dir.join(EVENTS_FILE))?;
        let metrics = LogFile::open(dir.join(METRICS_FILE))?;

        tracing::debug!(dir = %dir.display(), "Opened log collector");
        Ok(Self {
            dir,
            files: Some((events, metrics)),
            next_seq: 1,
            last_received: None,
            counts: LogCounts::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn events_path(&self) -> PathBuf {
        self.dir.join(EVENTS_FILE)
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.dir.join(METRICS_FILE)
    }

    pub fn counts(&self) -> LogCounts {
        self.counts
    }

    pub fn is_closed(&self) -> bool {
        self.files.is_none()
    }

    /// Append one item; returns its sequence number.
    pub fn record(&mut self, item: &StreamItem) -> Result<u64, CollectorError> {
        let (events, metrics) = self.files.as_mut().ok_or(CollectorError::Closed)?;

        // Wall clock may step backwards; receipt order must not.
        let now = Utc::now();
        let received_at = match self.last_received {
            Some(last) if last > now => last,
            _ => now,
        };
        let seq = self.next_seq;

        match item {
            StreamItem::Event(event) => {
                events.append(&LogRecord {
                    seq,
                    received_at,
                    item: event,
                })?;
                self.counts.events += 1;
            }
            StreamItem::Metric(metric) => {
                metrics.append(&LogRecord {
                    seq,
                    received_at,
                    item: metric,
                })?;
                self.counts.metrics += 1;
            }
        }

        self.next_seq += 1;
        self.last_received = Some(received_at);
        Ok(seq)
    }

    /// Sync both files to disk.
    pub fn flush(&mut self) -> Result<(), CollectorError> {
        let (events, metrics) = self.files.as_mut().ok_or(CollectorError::Closed)?;
        events.sync()?;
        metrics.sync()
    }

    /// Sync and close both files. Calling again is a no-op.
    pub fn close(&mut self) -> Result<LogCounts, CollectorError> {
        if let Some((mut events, mut metrics)) = self.files.take() {
            let synced = events.sync().and(metrics.sync());
            tracing::debug!(
                dir = %self.dir.display(),
                events = self.counts.events,
                metrics = self.counts.metrics,
                "Closed log collector"
            );
            synced?;
        }
        Ok(self.counts)
    }
}

/// Read back every record of a log file.
pub fn read_log<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>, CollectorError> {
    let path = path.as_ref();
    let io_error = |source| CollectorError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io_error)?;

    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(io_error)?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|source| CollectorError::Record {
            path: path.to_path_buf(),
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(name: &str) -> StreamItem {
        StreamItem::Event(Event::new(name, json!({"n": name})))
    }

    fn metric(name: &str, value: f64) -> StreamItem {
        StreamItem::Metric(Metric::new(name, value))
    }

    #[test]
    fn records_split_by_kind_with_shared_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let mut collector = LogCollector::create(dir.path()).unwrap();

        assert_eq!(collector.record(&event("a")).unwrap(), 1);
        assert_eq!(collector.record(&metric("m", 0.5)).unwrap(), 2);
        assert_eq!(collector.record(&event("b")).unwrap(), 3);
        assert_eq!(
            collector.close().unwrap(),
            LogCounts {
                events: 2,
                metrics: 1
            }
        );

        let events: Vec<EventRecord> = read_log(dir.path().join(EVENTS_FILE)).unwrap();
        let seqs: Vec<u64> = events.iter().map(|r| r.seq).collect();
        let names: Vec<&str> = events.iter().map(|r| r.item.name.as_str()).collect();
        assert_eq!(seqs, vec![1, 3]);
        assert_eq!(names, vec!["a", "b"]);
        assert!(events[0].received_at <= events[1].received_at);
        assert_eq!(events[1].item.data["n"], json!("b"));

        let metrics: Vec<MetricRecord> = read_log(dir.path().join(METRICS_FILE)).unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].seq, 2);
        assert_eq!(metrics[0].item.value, 0.5);
    }

    #[test]
    fn record_line_keeps_item_fields_flat() {
        let dir = tempfile::tempdir().unwrap();
        let mut collector = LogCollector::create(dir.path()).unwrap();
        collector.record(&metric("latency", 3.0)).unwrap();
        collector.flush().unwrap();

        let raw = std::fs::read_to_string(collector.metrics_path()).unwrap();
        let line: serde_json::Value = serde_json::from_str(raw.trim()).unwrap();
        let mut keys: Vec<&str> = line.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["name", "received_at", "seq", "ts", "value"]);
    }

    #[test]
    fn records_are_visible_before_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut collector = LogCollector::create(dir.path()).unwrap();
        collector.record(&event("early")).unwrap();

        let events: Vec<EventRecord> = read_log(collector.events_path()).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn close_is_idempotent_and_rejects_later_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut collector = LogCollector::create(dir.path()).unwrap();
        collector.record(&event("a")).unwrap();

        let first = collector.close().unwrap();
        assert!(collector.is_closed());
        assert_eq!(collector.close().unwrap(), first);
        assert!(matches!(
            collector.record(&event("late")),
            Err(CollectorError::Closed)
        ));
        assert!(matches!(collector.flush(), Err(CollectorError::Closed)));
    }

    #[test]
    fn existing_files_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["first", "second"] {
            let mut collector = LogCollector::create(dir.path()).unwrap();
            collector.record(&event(name)).unwrap();
            collector.close().unwrap();
        }
        let events: Vec<EventRecord> = read_log(dir.path().join(EVENTS_FILE)).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].item.name, "second");
    }

    #[test]
    fn create_makes_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("sessions").join("run_123");
        let collector = LogCollector::create(&nested).unwrap();
        assert_eq!(collector.dir(), nested.as_path());
        assert!(nested.join(EVENTS_FILE).exists());
        assert!(nested.join(METRICS_FILE).exists());
    }

    #[test]
    fn read_log_reports_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jsonl");
        std::fs::write(&path, "{\"seq\":1}\n").unwrap();
        assert!(matches!(
            read_log::<EventRecord>(&path),
            Err(CollectorError::Record { .. })
        ));
        assert!(matches!(
            read_log::<EventRecord>(dir.path().join("missing.jsonl")),
            Err(CollectorError::Io { .. })
        ));
    }
}
