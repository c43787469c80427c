//! SSE frame assembly: monotonic ids, keep-alives, orderly close.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use axum::response::sse::Event;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle, time::sleep};

use crate::{
    error::{ProviderError, Result},
    model::{EventTreeNode, LastScannedObjectInfo, ProviderEvent, ProviderMessage, StreamPointer},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Event,
    Message,
    KeepAlive,
    StreamInfo,
    Error,
    Close,
}

impl FrameKind {
    pub fn label(self) -> &'static str {
        match self {
            FrameKind::Event => "event",
            FrameKind::Message => "message",
            FrameKind::KeepAlive => "keep_alive",
            FrameKind::StreamInfo => "stream_info",
            FrameKind::Error => "error",
            FrameKind::Close => "close",
        }
    }
}

/// One response frame. Both response modes consume these: the SSE surface
/// renders them as `text/event-stream` events, the bounded JSON surface
/// collects the data frames into an array.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: u64,
    pub kind: FrameKind,
    pub data: Value,
}

impl Frame {
    pub fn to_sse_event(&self) -> Event {
        Event::default()
            .id(self.id.to_string())
            .event(self.kind.label())
            .data(self.data.to_string())
    }
}

/// Serializes search output into frames with monotonically assigned ids and
/// interleaves keep-alive frames while the pipeline is quiet. Closing is
/// idempotent and cancels the keep-alive task.
pub struct SseWriter {
    tx: mpsc::Sender<Frame>,
    next_id: AtomicU64,
    closed: AtomicBool,
    last_scanned: Mutex<LastScannedObjectInfo>,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
}

impl SseWriter {
    pub fn new(tx: mpsc::Sender<Frame>) -> Arc<Self> {
        Arc::new(Self {
            tx,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            last_scanned: Mutex::new(LastScannedObjectInfo::default()),
            keep_alive: Mutex::new(None),
        })
    }

    /// Start the background keep-alive task. Call at most once per writer.
    pub fn start_keep_alive(self: &Arc<Self>, every: std::time::Duration) {
        let writer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                sleep(every).await;
                if writer.write_keep_alive().await.is_err() {
                    break;
                }
            }
        });
        *self.keep_alive.lock() = Some(handle);
    }

    /// Record scan progress; surfaced on the next keep-alive frame.
    pub fn observe_scanned(&self, id: Option<String>, timestamp: DateTime<Utc>) {
        self.last_scanned.lock().observe(id, timestamp);
    }

    pub fn last_scanned(&self) -> LastScannedObjectInfo {
        self.last_scanned.lock().clone()
    }

    async fn write(&self, kind: FrameKind, data: Value) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProviderError::Cancelled);
        }
        let frame = Frame {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
            data,
        };
        self.tx
            .send(frame)
            .await
            .map_err(|_| ProviderError::Cancelled)
    }

    pub async fn write_event(&self, event: &ProviderEvent) -> Result<()> {
        self.write(FrameKind::Event, serde_json::to_value(event)?).await
    }

    pub async fn write_event_node(&self, node: &EventTreeNode) -> Result<()> {
        self.write(FrameKind::Event, serde_json::to_value(node)?).await
    }

    pub async fn write_message(&self, message: &ProviderMessage) -> Result<()> {
        self.write(FrameKind::Message, serde_json::to_value(message)?)
            .await
    }

    pub async fn write_stream_info(&self, pointers: &[StreamPointer]) -> Result<()> {
        self.write(FrameKind::StreamInfo, serde_json::to_value(pointers)?)
            .await
    }

    pub async fn write_keep_alive(&self) -> Result<()> {
        let info = self.last_scanned();
        self.write(FrameKind::KeepAlive, serde_json::to_value(&info)?)
            .await
    }

    pub async fn write_error(&self, error: &ProviderError) -> Result<()> {
        self.write(
            FrameKind::Error,
            serde_json::json!({
                "kind": error.kind(),
                "message": error.to_string(),
            }),
        )
        .await
    }

    /// Close exactly once: emit the terminal frame and stop the keep-alive.
    /// Later writes fail with `Cancelled`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.keep_alive.lock().take() {
            handle.abort();
        }
        let frame = Frame {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind: FrameKind::Close,
            data: Value::Null,
        };
        let _ = self.tx.send(frame).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[tokio::test]
    async fn frame_ids_are_monotonic() {
        let (tx, mut rx) = mpsc::channel(16);
        let writer = SseWriter::new(tx);
        writer.write_keep_alive().await.unwrap();
        writer.write_keep_alive().await.unwrap();
        writer.close().await;

        let ids: Vec<u64> = [
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .iter()
        .map(|frame| frame.id)
        .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_final() {
        let (tx, mut rx) = mpsc::channel(16);
        let writer = SseWriter::new(tx);
        writer.close().await;
        writer.close().await;
        assert!(writer.write_keep_alive().await.is_err());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, FrameKind::Close);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn keep_alive_carries_scan_progress() {
        let (tx, mut rx) = mpsc::channel(16);
        let writer = SseWriter::new(tx);
        let ts = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
        writer.observe_scanned(Some("e-7".into()), ts);
        writer.start_keep_alive(Duration::from_millis(20));

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.kind, FrameKind::KeepAlive);
        assert_eq!(frame.data["id"], "e-7");
        assert_eq!(frame.data["scan_counter"], 1);
        writer.close().await;
    }
}
