//! Record identifiers, stored shapes, search requests and pipeline items.

use std::{cmp::Ordering, fmt, str::FromStr};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProviderError;

/// Logical side of a conversation stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    First,
    Second,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::First, Direction::Second];

    pub fn label(self) -> &'static str {
        match self {
            Direction::First => "first",
            Direction::Second => "second",
        }
    }
}

impl FromStr for Direction {
    type Err = ProviderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "first" | "in" | "1" => Ok(Direction::First),
            "second" | "out" | "2" => Ok(Direction::Second),
            other => Err(ProviderError::InvalidRequest(format!(
                "unknown stream direction '{other}'"
            ))),
        }
    }
}

/// Scan order of a search: `Next` walks forward in time, `Previous` backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchDirection {
    Next,
    Previous,
}

impl SearchDirection {
    pub fn is_forward(self) -> bool {
        matches!(self, SearchDirection::Next)
    }
}

impl FromStr for SearchDirection {
    type Err = ProviderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "next" | "after" => Ok(SearchDirection::Next),
            "previous" | "before" => Ok(SearchDirection::Previous),
            other => Err(ProviderError::InvalidRequest(format!(
                "unknown search direction '{other}'"
            ))),
        }
    }
}

/// Relation used when probing the store for a message near a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRelation {
    AtOrBefore,
    AtOrAfter,
}

/// `(name, direction)` pair identifying one logical message stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub name: String,
    pub direction: Direction,
}

impl StreamKey {
    pub fn new(name: impl Into<String>, direction: Direction) -> Self {
        Self {
            name: name.into(),
            direction,
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.direction.label())
    }
}

/// Fully-qualified stored-message identifier. Sequences are monotonic per
/// stream key; the timestamp is carried for ordering but identity is
/// `(stream, sequence)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub stream: StreamKey,
    pub sequence: i64,
    pub timestamp: DateTime<Utc>,
}

impl MessageId {
    /// Render as the wire form `name:direction:sequence` used in request
    /// parameters and resume handles.
    pub fn wire(&self) -> String {
        format!("{}:{}", self.stream, self.sequence)
    }

    /// Parse the wire form. The timestamp is not part of the handle and must
    /// be resolved against the store.
    pub fn parse_wire(value: &str) -> crate::error::Result<(StreamKey, i64)> {
        let mut parts = value.rsplitn(3, ':');
        let sequence = parts
            .next()
            .and_then(|raw| raw.parse::<i64>().ok())
            .ok_or_else(|| {
                ProviderError::InvalidRequest(format!("malformed message id '{value}'"))
            })?;
        let direction = parts
            .next()
            .ok_or_else(|| {
                ProviderError::InvalidRequest(format!("malformed message id '{value}'"))
            })?
            .parse::<Direction>()?;
        let name = parts.next().filter(|name| !name.is_empty()).ok_or_else(|| {
            ProviderError::InvalidRequest(format!("malformed message id '{value}'"))
        })?;
        Ok((StreamKey::new(name, direction), sequence))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire())
    }
}

/// Event identifier as submitted by clients: an optional batch id qualifying
/// an opaque event id. A single (non-batched) event has no batch id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderEventId {
    pub batch_id: Option<String>,
    pub event_id: String,
}

impl ProviderEventId {
    pub fn single(event_id: impl Into<String>) -> Self {
        Self {
            batch_id: None,
            event_id: event_id.into(),
        }
    }

    pub fn batched(batch_id: impl Into<String>, event_id: impl Into<String>) -> Self {
        Self {
            batch_id: Some(batch_id.into()),
            event_id: event_id.into(),
        }
    }

    /// Wire form is `batchId:eventId`, or the bare event id for singles.
    pub fn parse_wire(value: &str) -> crate::error::Result<Self> {
        if value.is_empty() {
            return Err(ProviderError::InvalidRequest("empty event id".into()));
        }
        Ok(match value.split_once(':') {
            Some((batch, event)) if !batch.is_empty() && !event.is_empty() => {
                Self::batched(batch, event)
            }
            Some(_) => {
                return Err(ProviderError::InvalidRequest(format!(
                    "malformed event id '{value}'"
                )));
            }
            None => Self::single(value),
        })
    }
}

impl fmt::Display for ProviderEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.batch_id {
            Some(batch) => write!(f, "{batch}:{}", self.event_id),
            None => f.write_str(&self.event_id),
        }
    }
}

/// One stored message: raw payload plus its identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    #[serde(with = "base64_bytes")]
    pub raw: Vec<u8>,
}

impl StoredMessage {
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.id.timestamp
    }

    pub fn sequence(&self) -> i64 {
        self.id.sequence
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Ordered run of messages sharing one stream key. Sequences inside a batch
/// are contiguous and strictly monotonic; timestamps are non-decreasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBatch {
    pub stream: StreamKey,
    pub messages: Vec<StoredMessage>,
}

impl MessageBatch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Ascending by sequence.
    pub fn messages(&self) -> impl Iterator<Item = &StoredMessage> {
        self.messages.iter()
    }

    /// Descending by sequence.
    pub fn messages_reverse(&self) -> impl Iterator<Item = &StoredMessage> {
        self.messages.iter().rev()
    }

    pub fn first_sequence(&self) -> Option<i64> {
        self.messages.first().map(StoredMessage::sequence)
    }

    pub fn last_sequence(&self) -> Option<i64> {
        self.messages.last().map(StoredMessage::sequence)
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.messages.first().map(StoredMessage::timestamp)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.messages.last().map(StoredMessage::timestamp)
    }
}

/// A stored test event. `parent_id` links events into a forest; batched
/// events additionally carry the id of the batch that groups them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub successful: bool,
    #[serde(default)]
    pub attached_message_ids: Vec<String>,
    #[serde(default)]
    pub content: Option<Value>,
}

impl ProviderEvent {
    pub fn provider_id(&self) -> ProviderEventId {
        ProviderEventId {
            batch_id: self.batch_id.clone(),
            event_id: self.id.clone(),
        }
    }

    /// Metadata-only projection emitted when `metadata_only` is requested.
    pub fn tree_node(&self) -> EventTreeNode {
        EventTreeNode {
            id: self.id.clone(),
            batch_id: self.batch_id.clone(),
            parent_id: self.parent_id.clone(),
            name: self.name.clone(),
            event_type: self.event_type.clone(),
            start: self.start,
            end: self.end,
            successful: self.successful,
        }
    }
}

/// Lightweight event projection without body or attachments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventTreeNode {
    pub id: String,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub successful: bool,
}

/// Batch of events sharing a batch id and a parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatch {
    pub batch_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub events: Vec<ProviderEvent>,
}

impl EventBatch {
    pub fn find(&self, event_id: &str) -> Option<&ProviderEvent> {
        self.events.iter().find(|event| event.id == event_id)
    }
}

/// A stored record as listed by the store: either a standalone event or a
/// whole batch of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventWrapper {
    Single(ProviderEvent),
    Batch(EventBatch),
}

impl EventWrapper {
    /// Scan position of the wrapper: the start of the single event, or the
    /// earliest start inside the batch.
    pub fn start(&self) -> DateTime<Utc> {
        match self {
            EventWrapper::Single(event) => event.start,
            EventWrapper::Batch(batch) => batch
                .events
                .iter()
                .map(|event| event.start)
                .min()
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        }
    }

    pub fn end(&self) -> DateTime<Utc> {
        match self {
            EventWrapper::Single(event) => event.end,
            EventWrapper::Batch(batch) => batch
                .events
                .iter()
                .map(|event| event.end)
                .max()
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

/// Fully validated search request, shared by the event and message engines.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub direction: SearchDirection,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub resume_event_id: Option<ProviderEventId>,
    pub resume_message_ids: Vec<(StreamKey, i64)>,
    pub streams: Vec<String>,
    pub parent_event: Option<ProviderEventId>,
    pub result_count_limit: Option<usize>,
    pub limit_for_parent: Option<u64>,
    pub keep_open: bool,
    pub metadata_only: bool,
    pub attached_messages: bool,
    pub lookup_limit_days: Option<u32>,
}

impl SearchRequest {
    /// Direction-consistent validation shared by both endpoints: a start
    /// point must exist and the timestamps must not be inverted.
    pub fn validate(&self) -> crate::error::Result<()> {
        let resumes = self.resume_event_id.is_some() || !self.resume_message_ids.is_empty();
        if self.start_timestamp.is_none() && !resumes {
            return Err(ProviderError::InvalidRequest(
                "either startTimestamp or resumeFromId must be set".into(),
            ));
        }
        if let (Some(start), Some(end)) = (self.start_timestamp, self.end_timestamp) {
            let ordered = match self.direction {
                SearchDirection::Next => start <= end,
                SearchDirection::Previous => start >= end,
            };
            if !ordered {
                return Err(ProviderError::InvalidRequest(format!(
                    "timestamps are inverted for {:?} search: start={start}, end={end}",
                    self.direction
                )));
            }
        }
        Ok(())
    }
}

/// Decoded representation of one message as returned by the codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedMessage {
    pub message_type: String,
    pub fields: Value,
}

/// Outbound message shape written to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMessage {
    #[serde(rename = "messageId")]
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub stream: String,
    pub direction: Direction,
    pub sequence: i64,
    #[serde(rename = "messageType")]
    pub message_type: String,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(rename = "bodyBase64")]
    pub body_base64: String,
    #[serde(default)]
    pub attached_event_ids: Vec<String>,
}

impl ProviderMessage {
    /// Raw-only view of a stored message: no decoded type or body. Used for
    /// filter evaluation ahead of the codec round trip and for messages the
    /// pipeline rejects without ever decoding.
    pub fn undecoded(stored: &StoredMessage, attached_event_ids: Vec<String>) -> Self {
        Self {
            id: stored.id.wire(),
            timestamp: stored.timestamp(),
            stream: stored.id.stream.name.clone(),
            direction: stored.id.stream.direction,
            sequence: stored.sequence(),
            message_type: String::new(),
            body: None,
            body_base64: STANDARD.encode(&stored.raw),
            attached_event_ids,
        }
    }

    pub fn from_parts(
        stored: &StoredMessage,
        parsed: Option<ParsedMessage>,
        attached_event_ids: Vec<String>,
    ) -> Self {
        let mut message = Self::undecoded(stored, attached_event_ids);
        match parsed {
            Some(parsed) => {
                message.message_type = parsed.message_type;
                message.body = Some(parsed.fields);
            }
            // Decode failures surface per-record with a diagnostic body.
            None => {
                message.body = Some(serde_json::json!({
                    "error": format!("codec failed to decode message {}", stored.id.wire()),
                }));
            }
        }
        message
    }
}

/// Progress marker carried on keep-alive frames.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LastScannedObjectInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub scan_counter: u64,
}

impl LastScannedObjectInfo {
    pub fn observe(&mut self, id: Option<String>, timestamp: DateTime<Utc>) {
        if let Some(id) = id {
            self.id = Some(id);
        }
        self.timestamp = Some(timestamp);
        self.scan_counter += 1;
    }
}

/// Per-stream resume handle reported on the terminal `stream_info` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamPointer {
    pub stream: String,
    pub direction: Direction,
    #[serde(default)]
    pub last_id: Option<String>,
    pub stream_empty: bool,
}

/// Position metadata every pipeline item carries so the merger can advance a
/// stream without seeing a message from it.
#[derive(Debug, Clone)]
pub struct PipelineMeta {
    pub stream: StreamKey,
    pub stream_empty: bool,
    pub last_processed_id: Option<MessageId>,
    pub last_scanned_time: DateTime<Utc>,
}

/// Items flowing through the per-stream message pipeline. Items flow forward
/// once and are never mutated after send. The codec round-trip stages
/// (request, decoded batch) resolve inside the decode task, so only its
/// boundary shapes travel between tasks.
#[derive(Debug, Clone)]
pub enum PipelineItem {
    RawBatch {
        meta: PipelineMeta,
        batch: MessageBatch,
    },
    FilteredMessage {
        meta: PipelineMeta,
        message: Box<ProviderMessage>,
        passed: bool,
    },
    EmptyTick {
        meta: PipelineMeta,
    },
}

impl PipelineItem {
    pub fn meta(&self) -> &PipelineMeta {
        match self {
            PipelineItem::RawBatch { meta, .. }
            | PipelineItem::FilteredMessage { meta, .. }
            | PipelineItem::EmptyTick { meta } => meta,
        }
    }

    /// Merge position: message items order by their own timestamp, ticks by
    /// the extractor's last scanned time.
    pub fn position(&self) -> DateTime<Utc> {
        match self {
            PipelineItem::FilteredMessage { message, .. } => message.timestamp,
            other => other.meta().last_scanned_time,
        }
    }

    pub fn sequence(&self) -> i64 {
        match self {
            PipelineItem::FilteredMessage { message, .. } => message.sequence,
            _ => 0,
        }
    }

    /// Deterministic total order used by the merger tie-break.
    pub fn merge_key(&self) -> (DateTime<Utc>, String, Direction, i64) {
        let meta = self.meta();
        (
            self.position(),
            meta.stream.name.clone(),
            meta.stream.direction,
            self.sequence(),
        )
    }
}

/// Compare two merge keys in scan order.
pub fn compare_positions(
    direction: SearchDirection,
    a: &(DateTime<Utc>, String, Direction, i64),
    b: &(DateTime<Utc>, String, Direction, i64),
) -> Ordering {
    match direction {
        SearchDirection::Next => a.cmp(b),
        SearchDirection::Previous => b.cmp(a),
    }
}
