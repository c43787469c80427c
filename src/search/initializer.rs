//! Locating the first relevant stored message for each stream key.

use chrono::{DateTime, Days, Utc};
use tracing::debug;

use crate::{
    error::Result,
    model::{MessageId, SearchDirection, StreamKey, TimeRelation},
    search::interval::{day_end, day_start},
    store::{MessageBatchFilter, StoreGateway},
};

/// Walks calendar days away from the requested start timestamp until a stored
/// message for the stream turns up, then picks the nearest message inside the
/// located batch. Returns `None` when nothing exists within the lookup
/// window.
pub struct MessageStreamInitializer<'a> {
    gateway: &'a StoreGateway,
    direction: SearchDirection,
    lookup_limit_days: Option<u32>,
    end_timestamp: Option<DateTime<Utc>>,
}

impl<'a> MessageStreamInitializer<'a> {
    pub fn new(
        gateway: &'a StoreGateway,
        direction: SearchDirection,
        lookup_limit_days: Option<u32>,
        end_timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            gateway,
            direction,
            lookup_limit_days,
            end_timestamp,
        }
    }

    pub async fn find_start(
        &self,
        stream: &StreamKey,
        request_start: DateTime<Utc>,
    ) -> Result<Option<MessageId>> {
        // A stream with no stored messages at all never yields a start point.
        if self
            .gateway
            .get_first_message_sequence(stream)
            .await?
            .is_none()
        {
            debug!(stream = %stream, "stream has no stored messages");
            return Ok(None);
        }

        let mut day = request_start;
        let mut walked: u32 = 0;
        loop {
            if let Some(limit) = self.lookup_limit_days {
                if walked >= limit {
                    return Ok(None);
                }
            }
            if self.past_time_limit(day, walked) {
                return Ok(None);
            }

            let (window_start, window_end) = (day_start(day), day_end(day));
            let probe = if walked == 0 { request_start } else { day };
            let candidate = if walked == 0 {
                // First day: probe both relations so a message on either side
                // of the start timestamp anchors the scan.
                match self
                    .gateway
                    .get_first_message_id(
                        stream,
                        window_start,
                        window_end,
                        probe,
                        TimeRelation::AtOrBefore,
                    )
                    .await?
                {
                    Some(id) => Some(id),
                    None => {
                        self.gateway
                            .get_first_message_id(
                                stream,
                                window_start,
                                window_end,
                                probe,
                                TimeRelation::AtOrAfter,
                            )
                            .await?
                    }
                }
            } else {
                let relation = match self.direction {
                    SearchDirection::Next => TimeRelation::AtOrAfter,
                    SearchDirection::Previous => TimeRelation::AtOrBefore,
                };
                self.gateway
                    .get_first_message_id(stream, window_start, window_end, probe, relation)
                    .await?
            };

            if let Some(candidate) = candidate {
                return self.nearest_in_batch(stream, &candidate, request_start).await;
            }

            walked += 1;
            day = match self.direction {
                SearchDirection::Next => day_start(day) + Days::new(1),
                SearchDirection::Previous => day_end(day) - Days::new(1),
            };
        }
    }

    /// Without an explicit day budget the walk is bounded by the end
    /// timestamp when one exists, and otherwise by the near future (forward)
    /// or the stream's first stored message (backward).
    fn past_time_limit(&self, day: DateTime<Utc>, walked: u32) -> bool {
        if let Some(end) = self.end_timestamp {
            return match self.direction {
                SearchDirection::Next => day_start(day) > end,
                SearchDirection::Previous => day_end(day) < end,
            };
        }
        if self.lookup_limit_days.is_some() {
            return false;
        }
        match self.direction {
            SearchDirection::Next => day_start(day) > Utc::now() + Days::new(1),
            SearchDirection::Previous => walked > MAX_UNBOUNDED_LOOKUP_DAYS,
        }
    }

    /// Load the candidate's batch and pick the message nearest to the
    /// requested start: forward scans prefer the first message at or past the
    /// start, backward scans the last at or before it; either falls back to
    /// the batch's closest message on the other side.
    async fn nearest_in_batch(
        &self,
        stream: &StreamKey,
        candidate: &MessageId,
        request_start: DateTime<Utc>,
    ) -> Result<Option<MessageId>> {
        let page = self
            .gateway
            .get_message_batches(&MessageBatchFilter {
                stream: stream.clone(),
                order: SearchDirection::Next,
                from_sequence: Some(candidate.sequence),
                from_timestamp: None,
                end_timestamp: None,
                limit: 1,
            })
            .await?;
        let Some(batch) = page.first() else {
            return Ok(Some(candidate.clone()));
        };

        let nearest = match self.direction {
            SearchDirection::Next => batch
                .messages()
                .find(|message| message.timestamp() >= request_start)
                .or_else(|| {
                    batch
                        .messages()
                        .filter(|message| message.timestamp() < request_start)
                        .last()
                }),
            SearchDirection::Previous => batch
                .messages()
                .filter(|message| message.timestamp() <= request_start)
                .last()
                .or_else(|| {
                    batch
                        .messages()
                        .find(|message| message.timestamp() > request_start)
                }),
        };
        Ok(nearest.map(|message| message.id.clone()).or_else(|| Some(candidate.clone())))
    }
}

const MAX_UNBOUNDED_LOOKUP_DAYS: u32 = 365;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::{
        config::Config,
        model::{Direction, MessageBatch, StoredMessage},
        store::memory::MemoryStore,
    };
    use chrono::TimeZone;

    fn ts(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap() + chrono::Duration::minutes(minute)
    }

    fn seeded(stream: &StreamKey) -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        store.add_message_batch(MessageBatch {
            stream: stream.clone(),
            messages: (1..=4)
                .map(|n| StoredMessage {
                    id: MessageId {
                        stream: stream.clone(),
                        sequence: n,
                        timestamp: ts(n * 2),
                    },
                    raw: Vec::new(),
                })
                .collect(),
        });
        Arc::new(store)
    }

    fn gateway(store: Arc<MemoryStore>) -> StoreGateway {
        StoreGateway::new(store, &Config::default(), false)
    }

    #[tokio::test]
    async fn forward_start_lands_on_first_message_at_or_after() {
        let stream = StreamKey::new("alias", Direction::First);
        let gateway = gateway(seeded(&stream));
        let initializer =
            MessageStreamInitializer::new(&gateway, SearchDirection::Next, None, Some(ts(600)));

        let found = initializer.find_start(&stream, ts(5)).await.unwrap();
        assert_eq!(found.map(|id| id.sequence), Some(3));
    }

    #[tokio::test]
    async fn backward_start_lands_on_last_message_at_or_before() {
        let stream = StreamKey::new("alias", Direction::First);
        let gateway = gateway(seeded(&stream));
        let initializer =
            MessageStreamInitializer::new(&gateway, SearchDirection::Previous, None, Some(ts(-600)));

        let found = initializer.find_start(&stream, ts(5)).await.unwrap();
        assert_eq!(found.map(|id| id.sequence), Some(2));
    }

    #[tokio::test]
    async fn start_before_all_messages_falls_back_to_nearest() {
        let stream = StreamKey::new("alias", Direction::First);
        let gateway = gateway(seeded(&stream));
        let initializer =
            MessageStreamInitializer::new(&gateway, SearchDirection::Previous, None, None);

        // Nothing at or before the start; the batch's first later message is
        // the fallback anchor.
        let found = initializer.find_start(&stream, ts(1)).await.unwrap();
        assert_eq!(found.map(|id| id.sequence), Some(1));
    }

    #[tokio::test]
    async fn empty_stream_yields_no_start() {
        let stream = StreamKey::new("alias", Direction::First);
        let other = StreamKey::new("other", Direction::First);
        let gateway = gateway(seeded(&other));
        let initializer =
            MessageStreamInitializer::new(&gateway, SearchDirection::Next, Some(3), None);

        let found = initializer.find_start(&stream, ts(0)).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn lookup_budget_bounds_the_day_walk() {
        let stream = StreamKey::new("alias", Direction::First);
        let store = MemoryStore::new();
        // One message ten days past the start.
        store.add_message_batch(MessageBatch {
            stream: stream.clone(),
            messages: vec![StoredMessage {
                id: MessageId {
                    stream: stream.clone(),
                    sequence: 1,
                    timestamp: ts(10 * 24 * 60),
                },
                raw: Vec::new(),
            }],
        });
        let gateway = gateway(Arc::new(store));

        let narrow =
            MessageStreamInitializer::new(&gateway, SearchDirection::Next, Some(2), None);
        assert!(narrow.find_start(&stream, ts(0)).await.unwrap().is_none());

        let wide = MessageStreamInitializer::new(&gateway, SearchDirection::Next, Some(15), None);
        assert!(wide.find_start(&stream, ts(0)).await.unwrap().is_some());
    }
}
