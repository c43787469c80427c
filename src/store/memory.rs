//! In-memory store backend.
//!
//! Serves as the binary's default backend (seeded from a JSON snapshot) and
//! as the test double for the search engines. Tables are read-mostly: the
//! builder methods are only called while seeding.

use std::{collections::HashMap, fs, path::Path};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::{ProviderError, Result},
    model::{
        EventBatch, EventWrapper, MessageBatch, MessageId, ProviderEvent, ProviderEventId,
        SearchDirection, StoredMessage, StreamKey, TimeRelation,
    },
    store::{MessageBatchFilter, StoreBackend},
};

#[derive(Default)]
struct Tables {
    /// Sorted by `(start, position)`; the scan position of every wrapper.
    wrappers: Vec<EventWrapper>,
    /// event id -> index into `wrappers`.
    event_index: HashMap<String, usize>,
    /// batch id -> index into `wrappers`.
    batch_index: HashMap<String, usize>,
    /// Batches per stream, sorted by first sequence.
    streams: HashMap<StreamKey, Vec<MessageBatch>>,
    attached_messages: HashMap<String, Vec<MessageId>>,
    attached_events: HashMap<(StreamKey, i64), Vec<String>>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

/// On-disk snapshot shape: wrappers plus message batches; attachments are
/// derived from the events' attached message ids.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    events: Vec<EventWrapper>,
    #[serde(default)]
    messages: Vec<MessageBatch>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_snapshot(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&contents)?;
        let store = Self::new();
        for wrapper in snapshot.events {
            store.add_event_wrapper(wrapper);
        }
        for batch in snapshot.messages {
            store.add_message_batch(batch);
        }
        Ok(store)
    }

    pub fn add_event_wrapper(&self, wrapper: EventWrapper) {
        let mut tables = self.tables.write();
        let position = tables
            .wrappers
            .partition_point(|existing| existing.start() <= wrapper.start());
        tables.wrappers.insert(position, wrapper);
        Self::reindex(&mut tables);
    }

    pub fn add_message_batch(&self, batch: MessageBatch) {
        let mut tables = self.tables.write();
        let stream = batch.stream.clone();
        let batches = tables.streams.entry(stream).or_default();
        let position =
            batches.partition_point(|existing| existing.first_sequence() <= batch.first_sequence());
        batches.insert(position, batch);
    }

    /// Record that `message_id` is attached to `event_id` (both directions).
    pub fn link_attachment(&self, event_id: &str, message_id: MessageId) {
        let mut tables = self.tables.write();
        tables
            .attached_events
            .entry((message_id.stream.clone(), message_id.sequence))
            .or_default()
            .push(event_id.to_string());
        tables
            .attached_messages
            .entry(event_id.to_string())
            .or_default()
            .push(message_id);
    }

    fn reindex(tables: &mut Tables) {
        tables.event_index.clear();
        tables.batch_index.clear();
        for (position, wrapper) in tables.wrappers.iter().enumerate() {
            match wrapper {
                EventWrapper::Single(event) => {
                    tables.event_index.insert(event.id.clone(), position);
                }
                EventWrapper::Batch(batch) => {
                    tables.batch_index.insert(batch.batch_id.clone(), position);
                    for event in &batch.events {
                        tables.event_index.insert(event.id.clone(), position);
                    }
                }
            }
        }
    }

    fn range(
        tables: &Tables,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        order: SearchDirection,
    ) -> Vec<EventWrapper> {
        if from > to {
            return Vec::new();
        }
        let lower = tables
            .wrappers
            .partition_point(|wrapper| wrapper.start() < from);
        let upper = tables
            .wrappers
            .partition_point(|wrapper| wrapper.start() <= to);
        let mut slice: Vec<EventWrapper> = tables.wrappers[lower..upper].to_vec();
        if !order.is_forward() {
            slice.reverse();
        }
        slice
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn get_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        order: SearchDirection,
    ) -> Result<Vec<EventWrapper>> {
        let tables = self.tables.read();
        Ok(Self::range(&tables, from, to, order))
    }

    async fn get_events_from_resume(
        &self,
        resume: &ProviderEventId,
        to: DateTime<Utc>,
        order: SearchDirection,
    ) -> Result<Vec<EventWrapper>> {
        let tables = self.tables.read();
        let position = tables.event_index.get(&resume.event_id).copied();
        let Some(position) = position else {
            return Err(ProviderError::InvalidRequest(format!(
                "resume event {resume} does not exist"
            )));
        };
        let anchor = tables.wrappers[position].start();
        Ok(match order {
            SearchDirection::Next => Self::range(&tables, anchor, to, order),
            SearchDirection::Previous => Self::range(&tables, to, anchor, order),
        })
    }

    async fn get_event(&self, id: &ProviderEventId) -> Result<Option<ProviderEvent>> {
        let tables = self.tables.read();
        match &id.batch_id {
            Some(batch_id) => {
                let Some(&position) = tables.batch_index.get(batch_id) else {
                    return Ok(None);
                };
                let EventWrapper::Batch(batch) = &tables.wrappers[position] else {
                    return Ok(None);
                };
                // Return the event when the batch holds it, else None with a
                // warning; missing entries are a data inconsistency worth
                // surfacing in the log.
                match batch.find(&id.event_id) {
                    Some(event) => Ok(Some(event.clone())),
                    None => {
                        warn!(batch = %batch_id, event = %id.event_id, "event missing from its batch");
                        Ok(None)
                    }
                }
            }
            None => {
                let Some(&position) = tables.event_index.get(&id.event_id) else {
                    return Ok(None);
                };
                Ok(match &tables.wrappers[position] {
                    EventWrapper::Single(event) => Some(event.clone()),
                    EventWrapper::Batch(batch) => batch.find(&id.event_id).cloned(),
                })
            }
        }
    }

    async fn get_event_batch(&self, batch_id: &str) -> Result<Option<EventBatch>> {
        let tables = self.tables.read();
        let Some(&position) = tables.batch_index.get(batch_id) else {
            return Ok(None);
        };
        Ok(match &tables.wrappers[position] {
            EventWrapper::Batch(batch) => Some(batch.clone()),
            EventWrapper::Single(_) => None,
        })
    }

    async fn get_message_batches(&self, filter: &MessageBatchFilter) -> Result<Vec<MessageBatch>> {
        let tables = self.tables.read();
        let Some(batches) = tables.streams.get(&filter.stream) else {
            return Ok(Vec::new());
        };

        let mut page = Vec::new();
        let forward = filter.order.is_forward();
        let iterate: Box<dyn Iterator<Item = &MessageBatch>> = if forward {
            Box::new(batches.iter())
        } else {
            Box::new(batches.iter().rev())
        };

        for batch in iterate {
            if page.len() >= filter.limit {
                break;
            }
            let (first_seq, last_seq) = match (batch.first_sequence(), batch.last_sequence()) {
                (Some(first), Some(last)) => (first, last),
                _ => continue,
            };
            let (first_ts, last_ts) = (
                batch.first_timestamp().expect("non-empty batch"),
                batch.last_timestamp().expect("non-empty batch"),
            );

            // Sequence cursor: skip batches wholly behind it.
            if let Some(cursor) = filter.from_sequence {
                if forward && last_seq < cursor {
                    continue;
                }
                if !forward && first_seq > cursor {
                    continue;
                }
            } else if let Some(from) = filter.from_timestamp {
                if forward && last_ts < from {
                    continue;
                }
                if !forward && first_ts > from {
                    continue;
                }
            }

            // Stop at batches wholly past the end bound.
            if let Some(end) = filter.end_timestamp {
                if forward && first_ts > end {
                    break;
                }
                if !forward && last_ts < end {
                    break;
                }
            }

            page.push(batch.clone());
        }
        Ok(page)
    }

    async fn get_message(
        &self,
        stream: &StreamKey,
        sequence: i64,
    ) -> Result<Option<StoredMessage>> {
        let tables = self.tables.read();
        let Some(batches) = tables.streams.get(stream) else {
            return Ok(None);
        };
        for batch in batches {
            if let Some(message) = batch
                .messages()
                .find(|message| message.sequence() == sequence)
            {
                return Ok(Some(message.clone()));
            }
        }
        Ok(None)
    }

    async fn get_first_message_sequence(&self, stream: &StreamKey) -> Result<Option<i64>> {
        let tables = self.tables.read();
        Ok(tables
            .streams
            .get(stream)
            .and_then(|batches| batches.first())
            .and_then(MessageBatch::first_sequence))
    }

    async fn get_first_message_id(
        &self,
        stream: &StreamKey,
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
        timestamp: DateTime<Utc>,
        relation: TimeRelation,
    ) -> Result<Option<MessageId>> {
        let tables = self.tables.read();
        let Some(batches) = tables.streams.get(stream) else {
            return Ok(None);
        };
        let in_day = batches
            .iter()
            .flat_map(|batch| batch.messages())
            .filter(|message| {
                let ts = message.timestamp();
                ts >= day_start && ts <= day_end
            });
        let found = match relation {
            TimeRelation::AtOrBefore => in_day
                .filter(|message| message.timestamp() <= timestamp)
                .last(),
            TimeRelation::AtOrAfter => {
                let mut candidates = in_day.filter(|message| message.timestamp() >= timestamp);
                candidates.next()
            }
        };
        Ok(found.map(|message| message.id.clone()))
    }

    async fn get_attached_event_ids(
        &self,
        stream: &StreamKey,
        sequence: i64,
    ) -> Result<Vec<String>> {
        let tables = self.tables.read();
        let mut ids = tables
            .attached_events
            .get(&(stream.clone(), sequence))
            .cloned()
            .unwrap_or_default();
        // Also honor the wire references carried on event records.
        let wire = MessageId {
            stream: stream.clone(),
            sequence,
            timestamp: DateTime::<Utc>::MIN_UTC,
        }
        .wire();
        for wrapper in &tables.wrappers {
            let events: Vec<&ProviderEvent> = match wrapper {
                EventWrapper::Single(event) => vec![event],
                EventWrapper::Batch(batch) => batch.events.iter().collect(),
            };
            for event in events {
                if event.attached_message_ids.iter().any(|id| *id == wire)
                    && !ids.contains(&event.id)
                {
                    ids.push(event.id.clone());
                }
            }
        }
        Ok(ids)
    }

    async fn get_attached_message_ids(&self, event_id: &str) -> Result<Vec<MessageId>> {
        let wires = {
            let tables = self.tables.read();
            if let Some(ids) = tables.attached_messages.get(event_id) {
                if !ids.is_empty() {
                    return Ok(ids.clone());
                }
            }
            // Fall back to the wire references carried on the event record.
            let Some(&position) = tables.event_index.get(event_id) else {
                return Ok(Vec::new());
            };
            let event = match &tables.wrappers[position] {
                EventWrapper::Single(event) => Some(event),
                EventWrapper::Batch(batch) => batch.find(event_id),
            };
            match event {
                Some(event) => event.attached_message_ids.clone(),
                None => return Ok(Vec::new()),
            }
        };
        let mut resolved = Vec::new();
        for wire in &wires {
            if let Ok((stream, sequence)) = MessageId::parse_wire(wire) {
                if let Some(message) = self.get_message(&stream, sequence).await? {
                    resolved.push(message.id);
                }
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(minute: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + minute * 60, 0).unwrap()
    }

    fn single(id: &str, minute: i64) -> EventWrapper {
        EventWrapper::Single(ProviderEvent {
            id: id.into(),
            batch_id: None,
            parent_id: None,
            name: format!("event {id}"),
            event_type: "step".into(),
            start: ts(minute),
            end: ts(minute),
            successful: true,
            attached_message_ids: Vec::new(),
            content: None,
        })
    }

    fn message(stream: &StreamKey, sequence: i64, minute: i64) -> StoredMessage {
        StoredMessage {
            id: MessageId {
                stream: stream.clone(),
                sequence,
                timestamp: ts(minute),
            },
            raw: format!("payload-{sequence}").into_bytes(),
        }
    }

    #[tokio::test]
    async fn range_query_is_inclusive_and_ordered() {
        let store = MemoryStore::new();
        for (id, minute) in [("a", 0), ("b", 5), ("c", 10)] {
            store.add_event_wrapper(single(id, minute));
        }

        let forward = store
            .get_events(ts(0), ts(5), SearchDirection::Next)
            .await
            .unwrap();
        assert_eq!(forward.len(), 2);

        let backward = store
            .get_events(ts(0), ts(10), SearchDirection::Previous)
            .await
            .unwrap();
        let starts: Vec<_> = backward.iter().map(EventWrapper::start).collect();
        assert_eq!(starts, vec![ts(10), ts(5), ts(0)]);
    }

    #[tokio::test]
    async fn batched_lookup_warns_on_missing_member() {
        let store = MemoryStore::new();
        store.add_event_wrapper(EventWrapper::Batch(EventBatch {
            batch_id: "b-1".into(),
            parent_id: None,
            events: vec![match single("inner", 1) {
                EventWrapper::Single(mut event) => {
                    event.batch_id = Some("b-1".into());
                    event
                }
                _ => unreachable!(),
            }],
        }));

        let hit = store
            .get_event(&ProviderEventId::batched("b-1", "inner"))
            .await
            .unwrap();
        assert!(hit.is_some());

        let miss = store
            .get_event(&ProviderEventId::batched("b-1", "stranger"))
            .await
            .unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn message_pages_respect_cursor_and_end() {
        let stream = StreamKey::new("alias", crate::model::Direction::First);
        let store = MemoryStore::new();
        store.add_message_batch(MessageBatch {
            stream: stream.clone(),
            messages: (1..=3).map(|n| message(&stream, n, n)).collect(),
        });
        store.add_message_batch(MessageBatch {
            stream: stream.clone(),
            messages: (4..=6).map(|n| message(&stream, n, n)).collect(),
        });

        let page = store
            .get_message_batches(&MessageBatchFilter {
                stream: stream.clone(),
                order: SearchDirection::Next,
                from_sequence: Some(4),
                from_timestamp: None,
                end_timestamp: None,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].first_sequence(), Some(4));

        let bounded = store
            .get_message_batches(&MessageBatchFilter {
                stream: stream.clone(),
                order: SearchDirection::Next,
                from_sequence: None,
                from_timestamp: Some(ts(0)),
                end_timestamp: Some(ts(2)),
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(bounded.len(), 1);
    }

    #[tokio::test]
    async fn nearest_message_lookup_honors_relation() {
        let stream = StreamKey::new("alias", crate::model::Direction::Second);
        let store = MemoryStore::new();
        store.add_message_batch(MessageBatch {
            stream: stream.clone(),
            messages: vec![message(&stream, 1, 1), message(&stream, 2, 5)],
        });

        let before = store
            .get_first_message_id(&stream, ts(0), ts(60), ts(4), TimeRelation::AtOrBefore)
            .await
            .unwrap();
        assert_eq!(before.map(|id| id.sequence), Some(1));

        let after = store
            .get_first_message_id(&stream, ts(0), ts(60), ts(4), TimeRelation::AtOrAfter)
            .await
            .unwrap();
        assert_eq!(after.map(|id| id.sequence), Some(2));
    }
}
