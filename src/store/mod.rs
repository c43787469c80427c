//! Query surface of the record store and the retrying gateway in front of it.

pub mod memory;

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tracing::warn;

use crate::{
    config::Config,
    error::Result,
    model::{
        EventBatch, EventWrapper, MessageBatch, MessageId, ProviderEvent, ProviderEventId,
        SearchDirection, StoredMessage, StreamKey, TimeRelation,
    },
    observability,
};

/// Bounds for one message-batch page pull.
#[derive(Debug, Clone)]
pub struct MessageBatchFilter {
    pub stream: StreamKey,
    pub order: SearchDirection,
    /// Inclusive sequence cursor: the first batch returned is the one that
    /// contains or follows this sequence in scan order.
    pub from_sequence: Option<i64>,
    /// Used instead of the sequence cursor when the scan has not started yet.
    pub from_timestamp: Option<DateTime<Utc>>,
    /// Batches wholly past this bound (direction-wise) are not returned.
    pub end_timestamp: Option<DateTime<Utc>>,
    /// Maximum number of batches per page.
    pub limit: usize,
}

/// Suspending query surface the provider depends on. Implementations must
/// list every wrapper exactly once per range query, positioned and ordered by
/// wrapper start timestamp.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Wrappers whose start lies in `[from, to]`, in scan order.
    async fn get_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        order: SearchDirection,
    ) -> Result<Vec<EventWrapper>>;

    /// Wrappers from the resume event's wrapper (inclusive) to the
    /// chronological bound, in scan order. `to` is the forward bound for
    /// `Next` scans and the backward bound for `Previous` scans.
    async fn get_events_from_resume(
        &self,
        resume: &ProviderEventId,
        to: DateTime<Utc>,
        order: SearchDirection,
    ) -> Result<Vec<EventWrapper>>;

    /// Resolve one event, batch-aware: for a batched id the event is looked
    /// up inside its batch and `None` is returned when the batch does not
    /// contain it.
    async fn get_event(&self, id: &ProviderEventId) -> Result<Option<ProviderEvent>>;

    /// Fetch a whole batch by id.
    async fn get_event_batch(&self, batch_id: &str) -> Result<Option<EventBatch>>;

    async fn get_message_batches(&self, filter: &MessageBatchFilter) -> Result<Vec<MessageBatch>>;

    async fn get_message(&self, stream: &StreamKey, sequence: i64)
    -> Result<Option<StoredMessage>>;

    /// First stored sequence of a stream, or `None` for an empty stream.
    async fn get_first_message_sequence(&self, stream: &StreamKey) -> Result<Option<i64>>;

    /// First message id at-or-around `timestamp` within the `[day_start,
    /// day_end]` window of one calendar day.
    async fn get_first_message_id(
        &self,
        stream: &StreamKey,
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
        timestamp: DateTime<Utc>,
        relation: TimeRelation,
    ) -> Result<Option<MessageId>>;

    /// Ids of events the given message is attached to.
    async fn get_attached_event_ids(
        &self,
        stream: &StreamKey,
        sequence: i64,
    ) -> Result<Vec<String>>;

    /// Ids of messages attached to the given event.
    async fn get_attached_message_ids(&self, event_id: &str) -> Result<Vec<MessageId>>;
}

/// Thin adapter over the backend. In SSE mode transient failures are retried
/// with a fixed delay and a bounded attempt budget; bounded (JSON) searches
/// fail fast.
pub struct StoreGateway {
    backend: Arc<dyn StoreBackend>,
    retry_delay: std::time::Duration,
    retry_attempts: u32,
    sse_mode: bool,
}

impl StoreGateway {
    pub fn new(backend: Arc<dyn StoreBackend>, config: &Config, sse_mode: bool) -> Self {
        Self {
            backend,
            retry_delay: config.db_retry_delay(),
            retry_attempts: config.db_retry_attempts,
            sse_mode,
        }
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        observability::record_store_request(operation);
        let attempts = if self.sse_mode { self.retry_attempts } else { 1 };
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    warn!(
                        operation,
                        attempt,
                        "store query failed, retrying: {err}"
                    );
                    observability::record_store_retry(operation);
                    sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn get_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        order: SearchDirection,
    ) -> Result<Vec<EventWrapper>> {
        self.with_retry("get_events", || self.backend.get_events(from, to, order))
            .await
    }

    pub async fn get_events_from_resume(
        &self,
        resume: &ProviderEventId,
        to: DateTime<Utc>,
        order: SearchDirection,
    ) -> Result<Vec<EventWrapper>> {
        self.with_retry("get_events_from_resume", || {
            self.backend.get_events_from_resume(resume, to, order)
        })
        .await
    }

    pub async fn get_event(&self, id: &ProviderEventId) -> Result<Option<ProviderEvent>> {
        self.with_retry("get_event", || self.backend.get_event(id))
            .await
    }

    pub async fn get_event_batch(&self, batch_id: &str) -> Result<Option<EventBatch>> {
        self.with_retry("get_event_batch", || self.backend.get_event_batch(batch_id))
            .await
    }

    pub async fn get_message_batches(
        &self,
        filter: &MessageBatchFilter,
    ) -> Result<Vec<MessageBatch>> {
        self.with_retry("get_message_batches", || {
            self.backend.get_message_batches(filter)
        })
        .await
    }

    pub async fn get_message(
        &self,
        stream: &StreamKey,
        sequence: i64,
    ) -> Result<Option<StoredMessage>> {
        self.with_retry("get_message", || self.backend.get_message(stream, sequence))
            .await
    }

    pub async fn get_first_message_sequence(&self, stream: &StreamKey) -> Result<Option<i64>> {
        self.with_retry("get_first_message_sequence", || {
            self.backend.get_first_message_sequence(stream)
        })
        .await
    }

    pub async fn get_first_message_id(
        &self,
        stream: &StreamKey,
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
        timestamp: DateTime<Utc>,
        relation: TimeRelation,
    ) -> Result<Option<MessageId>> {
        self.with_retry("get_first_message_id", || {
            self.backend
                .get_first_message_id(stream, day_start, day_end, timestamp, relation)
        })
        .await
    }

    pub async fn get_attached_event_ids(
        &self,
        stream: &StreamKey,
        sequence: i64,
    ) -> Result<Vec<String>> {
        self.with_retry("get_attached_event_ids", || {
            self.backend.get_attached_event_ids(stream, sequence)
        })
        .await
    }

    pub async fn get_attached_message_ids(&self, event_id: &str) -> Result<Vec<MessageId>> {
        self.with_retry("get_attached_message_ids", || {
            self.backend.get_attached_message_ids(event_id)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyBackend {
        failures: AtomicU32,
    }

    #[async_trait]
    impl StoreBackend for FlakyBackend {
        async fn get_events(
            &self,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
            _order: SearchDirection,
        ) -> Result<Vec<EventWrapper>> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then(|| n - 1)
            }).is_ok()
            {
                Err(ProviderError::StoreTransient("connection reset".into()))
            } else {
                Ok(Vec::new())
            }
        }

        async fn get_events_from_resume(
            &self,
            _resume: &ProviderEventId,
            _to: DateTime<Utc>,
            _order: SearchDirection,
        ) -> Result<Vec<EventWrapper>> {
            Ok(Vec::new())
        }

        async fn get_event(&self, _id: &ProviderEventId) -> Result<Option<ProviderEvent>> {
            Ok(None)
        }

        async fn get_event_batch(&self, _batch_id: &str) -> Result<Option<EventBatch>> {
            Ok(None)
        }

        async fn get_message_batches(
            &self,
            _filter: &MessageBatchFilter,
        ) -> Result<Vec<MessageBatch>> {
            Ok(Vec::new())
        }

        async fn get_message(
            &self,
            _stream: &StreamKey,
            _sequence: i64,
        ) -> Result<Option<StoredMessage>> {
            Ok(None)
        }

        async fn get_first_message_sequence(&self, _stream: &StreamKey) -> Result<Option<i64>> {
            Ok(None)
        }

        async fn get_first_message_id(
            &self,
            _stream: &StreamKey,
            _day_start: DateTime<Utc>,
            _day_end: DateTime<Utc>,
            _timestamp: DateTime<Utc>,
            _relation: TimeRelation,
        ) -> Result<Option<MessageId>> {
            Ok(None)
        }

        async fn get_attached_event_ids(
            &self,
            _stream: &StreamKey,
            _sequence: i64,
        ) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn get_attached_message_ids(&self, _event_id: &str) -> Result<Vec<MessageId>> {
            Ok(Vec::new())
        }
    }

    fn fast_config() -> Config {
        Config {
            db_retry_delay_ms: 1,
            db_retry_attempts: 3,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn sse_mode_retries_transient_failures() {
        let backend = Arc::new(FlakyBackend {
            failures: AtomicU32::new(2),
        });
        let gateway = StoreGateway::new(backend, &fast_config(), true);
        let result = gateway
            .get_events(Utc::now(), Utc::now(), SearchDirection::Next)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn bounded_mode_fails_fast() {
        let backend = Arc::new(FlakyBackend {
            failures: AtomicU32::new(1),
        });
        let gateway = StoreGateway::new(backend, &fast_config(), false);
        let result = gateway
            .get_events(Utc::now(), Utc::now(), SearchDirection::Next)
            .await;
        assert!(matches!(result, Err(ProviderError::StoreTransient(_))));
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let backend = Arc::new(FlakyBackend {
            failures: AtomicU32::new(10),
        });
        let gateway = StoreGateway::new(backend, &fast_config(), true);
        let result = gateway
            .get_events(Utc::now(), Utc::now(), SearchDirection::Next)
            .await;
        assert!(matches!(result, Err(ProviderError::StoreTransient(_))));
    }
}
