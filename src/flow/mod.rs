use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::constants::FLOW_RETENTION_DAYS;

const WRITER_QUEUE_DEPTH: usize = 256;

/// Lifecycle record of one request, kept in a bounded ring and appended to a
/// daily NDJSON file once completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub id: String,
    pub started_at: i64,
    pub protocol: String,
    pub route: String,
    pub model: String,
    pub stream: bool,
    /// Redacted request snapshot: messages truncated to the first three.
    pub request_snapshot: Value,
    #[serde(default)]
    pub chunk_count: u64,
    #[serde(default)]
    pub bytes_streamed: u64,
    #[serde(default)]
    pub status: FlowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Active,
    Completed,
    Failed,
}

impl Default for FlowStatus {
    fn default() -> Self {
        FlowStatus::Active
    }
}

/// Completed-flow lines are sequenced through a single writer task so
/// concurrent completions never interleave appends.
enum WriterMessage {
    Append(FlowRecord),
    Flush(tokio::sync::oneshot::Sender<()>),
}

pub struct FlowMonitor {
    ring: RwLock<VecDeque<FlowRecord>>,
    max_entries: usize,
    flows_dir: PathBuf,
    writer_tx: mpsc::Sender<WriterMessage>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn day_file_name(ts_ms: i64) -> String {
    let day = chrono::DateTime::from_timestamp_millis(ts_ms)
        .unwrap_or_else(chrono::Utc::now)
        .format("%Y-%m-%d");
    format!("{}.ndjson", day)
}

impl FlowMonitor {
    pub fn new(data_dir: &Path, max_entries: usize) -> Self {
        let flows_dir = data_dir.join("flows");
        if let Err(e) = fs::create_dir_all(&flows_dir) {
            warn!("[W-FLOW-DIR] failed_to_create_flows_dir: {}", e);
        }

        let (writer_tx, writer_rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
        tokio::spawn(run_writer(flows_dir.clone(), writer_rx));

        let monitor = Self {
            ring: RwLock::new(VecDeque::with_capacity(max_entries)),
            max_entries,
            flows_dir,
            writer_tx,
        };
        monitor.purge_old_files();
        monitor
    }

    /// Begin a flow; returns its id for chunk/complete calls.
    pub async fn start_flow(
        &self,
        protocol: &str,
        route: &str,
        model: &str,
        stream: bool,
        request_snapshot: Value,
    ) -> String {
        let record = FlowRecord {
            id: uuid::Uuid::new_v4().to_string(),
            started_at: now_ms(),
            protocol: protocol.to_string(),
            route: route.to_string(),
            model: model.to_string(),
            stream,
            request_snapshot,
            chunk_count: 0,
            bytes_streamed: 0,
            status: FlowStatus::Active,
            account_email: None,
            usage: None,
            error: None,
            duration_ms: None,
        };
        let id = record.id.clone();

        let mut ring = self.ring.write().await;
        if ring.len() >= self.max_entries {
            ring.pop_back();
        }
        ring.push_front(record);
        id
    }

    pub async fn record_chunk(&self, flow_id: &str, bytes: usize) {
        let mut ring = self.ring.write().await;
        if let Some(record) = ring.iter_mut().find(|r| r.id == flow_id) {
            record.chunk_count += 1;
            record.bytes_streamed += bytes as u64;
        }
    }

    pub async fn complete_flow(
        &self,
        flow_id: &str,
        account_email: Option<String>,
        usage: Option<Value>,
        error: Option<String>,
    ) {
        let completed = {
            let mut ring = self.ring.write().await;
            ring.iter_mut().find(|r| r.id == flow_id).map(|record| {
                record.status = if error.is_some() {
                    FlowStatus::Failed
                } else {
                    FlowStatus::Completed
                };
                record.account_email = account_email;
                record.usage = usage;
                record.error = error;
                record.duration_ms = Some(now_ms() - record.started_at);
                record.clone()
            })
        };

        if let Some(record) = completed {
            if self
                .writer_tx
                .send(WriterMessage::Append(record))
                .await
                .is_err()
            {
                warn!("[W-FLOW-WRITER] writer_task_gone_dropping_flow_record");
            }
        }
    }

    pub async fn recent(&self, limit: usize) -> Vec<FlowRecord> {
        let ring = self.ring.read().await;
        ring.iter().take(limit).cloned().collect()
    }

    pub async fn reset(&self) {
        let mut ring = self.ring.write().await;
        ring.clear();
        info!("Flow ring cleared");
    }

    /// Block until every queued append has hit the file. Used by shutdown
    /// and by file exports.
    pub async fn flush(&self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self.writer_tx.send(WriterMessage::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Read persisted flows for one day (`YYYY-MM-DD`).
    pub fn read_day(&self, day: &str) -> Vec<FlowRecord> {
        let path = self.flows_dir.join(format!("{}.ndjson", day));
        let Ok(content) = fs::read_to_string(&path) else {
            return Vec::new();
        };
        content
            .lines()
            .filter_map(|line| serde_json::from_str::<FlowRecord>(line).ok())
            .collect()
    }

    /// Read persisted flows for the most recent `days` days, newest first.
    pub fn read_recent_days(&self, days: u64) -> Vec<FlowRecord> {
        let mut flows = Vec::new();
        let today = chrono::Utc::now().date_naive();
        for offset in 0..days {
            let day = today - chrono::Duration::days(offset as i64);
            flows.extend(self.read_day(&day.format("%Y-%m-%d").to_string()));
        }
        flows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        flows
    }

    /// Drop day files older than the retention window.
    pub fn purge_old_files(&self) {
        let Ok(entries) = fs::read_dir(&self.flows_dir) else {
            return;
        };
        let cutoff =
            chrono::Utc::now().date_naive() - chrono::Duration::days(FLOW_RETENTION_DAYS as i64);

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(day_str) = name.strip_suffix(".ndjson") else {
                continue;
            };
            let Ok(day) = chrono::NaiveDate::parse_from_str(day_str, "%Y-%m-%d") else {
                continue;
            };
            if day < cutoff {
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!("[W-FLOW-PURGE] failed_to_remove {:?}: {}", entry.path(), e);
                } else {
                    info!("Purged expired flow log: {}", name);
                }
            }
        }
    }
}

async fn run_writer(flows_dir: PathBuf, mut rx: mpsc::Receiver<WriterMessage>) {
    use std::io::Write;

    while let Some(message) = rx.recv().await {
        match message {
            WriterMessage::Append(record) => {
                let path = flows_dir.join(day_file_name(record.started_at));
                let line = match serde_json::to_string(&record) {
                    Ok(l) => l,
                    Err(e) => {
                        warn!("[W-FLOW-SERIALIZE] failed_to_serialize_flow: {}", e);
                        continue;
                    }
                };
                let result = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .and_then(|mut file| writeln!(file, "{}", line));
                if let Err(e) = result {
                    warn!("[W-FLOW-APPEND] failed_to_append_flow: {}", e);
                } else {
                    debug!("Flow {} appended to {:?}", record.id, path.file_name());
                }
            }
            WriterMessage::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}
