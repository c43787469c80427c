//! Per-stream batch extraction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::{sync::mpsc, time::sleep};
use tracing::debug;

use crate::{
    config::Config,
    error::{ProviderError, Result},
    model::{
        MessageBatch, MessageId, PipelineItem, PipelineMeta, SearchDirection, StoredMessage,
        StreamKey,
    },
    store::{MessageBatchFilter, StoreGateway},
};

const BATCH_PAGE_LIMIT: usize = 16;

/// Pulls message batches for one `(stream, direction)` in scan order, trims
/// them to the requested range, and feeds the downstream channel. While a
/// store pull is in flight a heartbeat tick goes out every `send_empty_delay`
/// so the merger can keep advancing. Termination emits a final tick carrying
/// `stream_empty` and the direction sentinel timestamp.
pub struct MessageExtractor {
    gateway: Arc<StoreGateway>,
    config: Arc<Config>,
    stream: StreamKey,
    direction: SearchDirection,
    start: Option<MessageId>,
    resume_sequence: Option<i64>,
    start_timestamp: DateTime<Utc>,
    end_timestamp: Option<DateTime<Utc>>,
    keep_open: bool,
    tx: mpsc::Sender<PipelineItem>,

    cursor: Option<i64>,
    last_processed_id: Option<MessageId>,
    last_scanned_time: DateTime<Utc>,
}

impl MessageExtractor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<StoreGateway>,
        config: Arc<Config>,
        stream: StreamKey,
        direction: SearchDirection,
        start: Option<MessageId>,
        resume_sequence: Option<i64>,
        start_timestamp: DateTime<Utc>,
        end_timestamp: Option<DateTime<Utc>>,
        keep_open: bool,
        tx: mpsc::Sender<PipelineItem>,
    ) -> Self {
        let cursor = start.as_ref().map(|id| id.sequence);
        let last_scanned_time = start
            .as_ref()
            .map(|id| id.timestamp)
            .unwrap_or(start_timestamp);
        Self {
            gateway,
            config,
            stream,
            direction,
            start,
            resume_sequence,
            start_timestamp,
            end_timestamp,
            keep_open,
            tx,
            cursor,
            last_processed_id: None,
            last_scanned_time,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        if self.start.is_none() {
            // No start point within the lookup window: the stream
            // contributes nothing but must still unblock the merger.
            return self.finish().await;
        }

        loop {
            let page = self.fetch_with_heartbeat().await?;
            if page.is_empty() {
                if self.keep_open {
                    self.send_tick(false).await?;
                    sleep(self.config.sse_search_delay()).await;
                    continue;
                }
                return self.finish().await;
            }

            let mut passed_end = false;
            for batch in &page {
                self.advance_cursor(batch);
                let trimmed = self.trim(batch);
                passed_end = passed_end || self.passes_end(batch);

                // Track scan progress off the untrimmed batch so ticks keep
                // moving even when everything is trimmed away.
                let scan_edge = match self.direction {
                    SearchDirection::Next => batch.messages.last(),
                    SearchDirection::Previous => batch.messages.first(),
                };
                if let Some(edge) = scan_edge {
                    self.last_scanned_time = self.clamp_scanned(edge.timestamp());
                }

                if trimmed.is_empty() {
                    self.send_tick(false).await?;
                    continue;
                }

                let last_in_scan_order = match self.direction {
                    SearchDirection::Next => trimmed.last(),
                    SearchDirection::Previous => trimmed.first(),
                };
                self.last_processed_id = last_in_scan_order.map(|message| message.id.clone());

                let item = PipelineItem::RawBatch {
                    meta: self.meta(false),
                    batch: MessageBatch {
                        stream: self.stream.clone(),
                        messages: trimmed,
                    },
                };
                self.tx
                    .send(item)
                    .await
                    .map_err(|_| ProviderError::Cancelled)?;
            }

            if passed_end && !self.keep_open {
                return self.finish().await;
            }
            if page.len() < BATCH_PAGE_LIMIT && !self.keep_open {
                return self.finish().await;
            }
        }
    }

    async fn fetch_with_heartbeat(&mut self) -> Result<Vec<MessageBatch>> {
        let filter = MessageBatchFilter {
            stream: self.stream.clone(),
            order: self.direction,
            from_sequence: self.cursor,
            from_timestamp: self.cursor.is_none().then_some(self.start_timestamp),
            end_timestamp: self.end_timestamp,
            limit: BATCH_PAGE_LIMIT,
        };
        let gateway = Arc::clone(&self.gateway);
        let fetch = gateway.get_message_batches(&filter);
        tokio::pin!(fetch);
        loop {
            tokio::select! {
                page = &mut fetch => return page,
                _ = sleep(self.config.send_empty_delay()) => {
                    self.send_tick(false).await?;
                }
            }
        }
    }

    fn advance_cursor(&mut self, batch: &MessageBatch) {
        self.cursor = match self.direction {
            SearchDirection::Next => batch.last_sequence().map(|seq| seq + 1),
            SearchDirection::Previous => batch.first_sequence().map(|seq| seq - 1),
        };
    }

    /// Head trim by resume sequence (strict) or start timestamp (inclusive),
    /// tail trim by the inclusive end timestamp. Returned messages stay in
    /// ascending sequence order.
    fn trim(&self, batch: &MessageBatch) -> Vec<StoredMessage> {
        batch
            .messages()
            .filter(|message| {
                let ts = message.timestamp();
                let head_ok = match (self.resume_sequence, self.direction) {
                    (Some(resume), SearchDirection::Next) => message.sequence() > resume,
                    (Some(resume), SearchDirection::Previous) => message.sequence() < resume,
                    (None, SearchDirection::Next) => ts >= self.start_timestamp,
                    (None, SearchDirection::Previous) => ts <= self.start_timestamp,
                };
                let tail_ok = match (self.end_timestamp, self.direction) {
                    (Some(end), SearchDirection::Next) => ts <= end,
                    (Some(end), SearchDirection::Previous) => ts >= end,
                    (None, _) => true,
                };
                head_ok && tail_ok
            })
            .cloned()
            .collect()
    }

    fn passes_end(&self, batch: &MessageBatch) -> bool {
        let Some(end) = self.end_timestamp else {
            return false;
        };
        match self.direction {
            SearchDirection::Next => batch.last_timestamp().map(|ts| ts > end).unwrap_or(false),
            SearchDirection::Previous => {
                batch.first_timestamp().map(|ts| ts < end).unwrap_or(false)
            }
        }
    }

    /// Scan progress may only move in the scan direction.
    fn clamp_scanned(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self.direction {
            SearchDirection::Next => ts.max(self.last_scanned_time),
            SearchDirection::Previous => ts.min(self.last_scanned_time),
        }
    }

    fn meta(&self, stream_empty: bool) -> PipelineMeta {
        PipelineMeta {
            stream: self.stream.clone(),
            stream_empty,
            last_processed_id: self.last_processed_id.clone(),
            last_scanned_time: self.last_scanned_time,
        }
    }

    async fn send_tick(&self, stream_empty: bool) -> Result<()> {
        self.tx
            .send(PipelineItem::EmptyTick {
                meta: self.meta(stream_empty),
            })
            .await
            .map_err(|_| ProviderError::Cancelled)
    }

    async fn finish(&mut self) -> Result<()> {
        debug!(stream = %self.stream, "message stream exhausted");
        self.last_scanned_time = match self.direction {
            SearchDirection::Next => DateTime::<Utc>::MAX_UTC,
            SearchDirection::Previous => DateTime::<Utc>::MIN_UTC,
        };
        self.send_tick(true).await
    }
}
