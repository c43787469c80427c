//! Message search orchestration: one extractor and decode stage per stream
//! key, merged into a single time-ordered flow.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::info;

use crate::{
    codec::CodecBroker,
    config::Config,
    error::{ProviderError, Result},
    filter::MessageFilterSet,
    model::{
        Direction, MessageBatch, MessageId, ParsedMessage, PipelineItem, PipelineMeta,
        ProviderMessage, SearchRequest, StreamKey, StreamPointer,
    },
    observability,
    search::{extractor::MessageExtractor, initializer::MessageStreamInitializer, merger::StreamMerger},
    sse::SseWriter,
    store::StoreGateway,
};

pub struct MessageSearchEngine {
    gateway: Arc<StoreGateway>,
    broker: Arc<CodecBroker>,
    config: Arc<Config>,
    request: SearchRequest,
    filters: MessageFilterSet,
}

struct StreamSetup {
    key: StreamKey,
    start: Option<MessageId>,
    resume_sequence: Option<i64>,
    start_timestamp: DateTime<Utc>,
}

impl MessageSearchEngine {
    pub fn new(
        gateway: Arc<StoreGateway>,
        broker: Arc<CodecBroker>,
        config: Arc<Config>,
        request: SearchRequest,
        filters: MessageFilterSet,
    ) -> Self {
        Self {
            gateway,
            broker,
            config,
            request,
            filters,
        }
    }

    pub async fn run(self, writer: Arc<SseWriter>) -> Result<()> {
        self.request.validate()?;
        if self.request.streams.is_empty() {
            return Err(ProviderError::InvalidRequest(
                "at least one stream must be requested".into(),
            ));
        }
        let started = std::time::Instant::now();
        let limit = self
            .request
            .result_count_limit
            .unwrap_or(self.config.max_messages_limit)
            .min(self.config.max_messages_limit);

        let mut setups = Vec::new();
        for name in &self.request.streams {
            for direction in Direction::BOTH {
                let key = StreamKey::new(name.clone(), direction);
                setups.push(self.resolve_start(&key).await?);
            }
        }

        let mut handles: Vec<JoinHandle<Result<()>>> = Vec::new();
        let mut receivers = Vec::new();
        let buffer = self.config.message_search_pipeline_buffer;
        let need_attached = self.request.attached_messages || self.filters.needs_attached();
        for setup in setups {
            let (raw_tx, raw_rx) = mpsc::channel::<PipelineItem>(buffer);
            let (decoded_tx, decoded_rx) = mpsc::channel::<PipelineItem>(buffer);
            receivers.push(decoded_rx);

            let extractor = MessageExtractor::new(
                Arc::clone(&self.gateway),
                Arc::clone(&self.config),
                setup.key.clone(),
                self.request.direction,
                setup.start,
                setup.resume_sequence,
                setup.start_timestamp,
                self.request.end_timestamp,
                self.request.keep_open,
                raw_tx,
            );
            handles.push(tokio::spawn(extractor.run()));
            handles.push(tokio::spawn(decode_stage(
                Arc::clone(&self.broker),
                Arc::clone(&self.gateway),
                self.filters.clone(),
                need_attached,
                self.request.direction.is_forward(),
                raw_rx,
                decoded_tx,
            )));
        }

        let mut merger = StreamMerger::new(self.request.direction, receivers);
        let mut pointers: BTreeMap<StreamKey, StreamPointer> = BTreeMap::new();
        let mut emitted = 0usize;
        let mut scanned = 0u64;
        let capped = loop {
            let Some(item) = merger.next().await else {
                break false;
            };
            track_pointer(&mut pointers, item.meta());
            if let PipelineItem::FilteredMessage { message, passed, .. } = item {
                scanned += 1;
                writer.observe_scanned(Some(message.id.clone()), message.timestamp);
                if passed {
                    writer.write_message(&message).await?;
                    observability::record_emitted("message");
                    emitted += 1;
                    if emitted >= limit {
                        break true;
                    }
                }
            }
        };

        let pointer_list: Vec<StreamPointer> = pointers.into_values().collect();
        writer.write_stream_info(&pointer_list).await?;

        let mut failure = None;
        for handle in handles {
            if handle.is_finished() {
                match handle.await {
                    Ok(Err(err)) if failure.is_none() && !matches!(err, ProviderError::Cancelled) => {
                        failure = Some(err);
                    }
                    _ => {}
                }
            } else {
                handle.abort();
            }
        }
        if let Some(err) = failure {
            if !capped {
                return Err(err);
            }
        }

        info!(
            scanned,
            emitted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "message search finished"
        );
        Ok(())
    }

    /// Locate the scan entry point for one stream key. A matching resume id
    /// pins the start to the resumed message; its timestamp overrides the
    /// requested start timestamp in both directions (resume overrides start,
    /// also on backward searches).
    async fn resolve_start(&self, key: &StreamKey) -> Result<StreamSetup> {
        if let Some((_, sequence)) = self
            .request
            .resume_message_ids
            .iter()
            .find(|(stream, _)| stream == key)
        {
            let message = self
                .gateway
                .get_message(key, *sequence)
                .await?
                .ok_or_else(|| {
                    ProviderError::InvalidRequest(format!(
                        "resume message {key}:{sequence} does not exist"
                    ))
                })?;
            return Ok(StreamSetup {
                key: key.clone(),
                start_timestamp: message.timestamp(),
                start: Some(message.id),
                resume_sequence: Some(*sequence),
            });
        }

        let start_timestamp = self.request.start_timestamp.ok_or_else(|| {
            ProviderError::InvalidRequest(format!(
                "startTimestamp is required for stream {key} without a resume id"
            ))
        })?;
        let initializer = MessageStreamInitializer::new(
            &self.gateway,
            self.request.direction,
            self.request.lookup_limit_days,
            self.request.end_timestamp,
        );
        let start = initializer.find_start(key, start_timestamp).await?;
        Ok(StreamSetup {
            key: key.clone(),
            start,
            resume_sequence: None,
            start_timestamp,
        })
    }
}

fn track_pointer(pointers: &mut BTreeMap<StreamKey, StreamPointer>, meta: &PipelineMeta) {
    let pointer = pointers
        .entry(meta.stream.clone())
        .or_insert_with(|| StreamPointer {
            stream: meta.stream.name.clone(),
            direction: meta.stream.direction,
            last_id: None,
            stream_empty: false,
        });
    if let Some(id) = &meta.last_processed_id {
        pointer.last_id = Some(id.wire());
    }
    pointer.stream_empty = meta.stream_empty;
}

/// Wraps raw batches into codec requests, awaits the decoded response, and
/// unpacks the result back into per-message items, preserving batch framing
/// and per-stream order. When no active filter needs the decoder's output,
/// verdicts are settled on the raw messages first and only the survivors go
/// through the codec round trip.
async fn decode_stage(
    broker: Arc<CodecBroker>,
    gateway: Arc<StoreGateway>,
    filters: MessageFilterSet,
    need_attached: bool,
    forward: bool,
    mut raw_rx: mpsc::Receiver<PipelineItem>,
    tx: mpsc::Sender<PipelineItem>,
) -> Result<()> {
    while let Some(item) = raw_rx.recv().await {
        match item {
            PipelineItem::RawBatch { meta, batch } => {
                let count = batch.len();
                let mut attached: Vec<Vec<String>> = Vec::with_capacity(count);
                for stored in batch.messages() {
                    attached.push(if need_attached {
                        gateway
                            .get_attached_event_ids(&stored.id.stream, stored.sequence())
                            .await?
                    } else {
                        Vec::new()
                    });
                }

                // Filter sets without decoder-dependent kinds decide on the
                // raw message; a rejection here never reaches the broker.
                let raw_only = !filters.is_empty() && !filters.needs_body();
                let verdicts: Vec<bool> = if raw_only {
                    batch
                        .messages()
                        .enumerate()
                        .map(|(index, stored)| {
                            filters.apply(&ProviderMessage::undecoded(
                                stored,
                                attached[index].clone(),
                            ))
                        })
                        .collect()
                } else {
                    vec![true; count]
                };

                let survivors: Vec<usize> =
                    (0..count).filter(|index| verdicts[*index]).collect();
                let decoded: Vec<Option<ParsedMessage>> = if survivors.len() == count {
                    broker.decode(&batch).await
                } else if survivors.is_empty() {
                    vec![None; count]
                } else {
                    let subset = MessageBatch {
                        stream: batch.stream.clone(),
                        messages: survivors
                            .iter()
                            .map(|index| batch.messages[*index].clone())
                            .collect(),
                    };
                    let subset_decoded = broker.decode(&subset).await;
                    let mut full = vec![None; count];
                    for (slot, index) in survivors.iter().enumerate() {
                        full[*index] = subset_decoded.get(slot).cloned().flatten();
                    }
                    full
                };

                let order: Box<dyn Iterator<Item = usize> + Send> = if forward {
                    Box::new(0..count)
                } else {
                    Box::new((0..count).rev())
                };
                for index in order {
                    let stored = &batch.messages[index];
                    let (message, passed) = if verdicts[index] {
                        let message = ProviderMessage::from_parts(
                            stored,
                            decoded[index].clone(),
                            attached[index].clone(),
                        );
                        let passed = filters.apply(&message);
                        (message, passed)
                    } else {
                        // Rejected on the raw checks alone; never decoded.
                        (
                            ProviderMessage::undecoded(stored, attached[index].clone()),
                            false,
                        )
                    };
                    let item = PipelineItem::FilteredMessage {
                        meta: PipelineMeta {
                            stream: meta.stream.clone(),
                            stream_empty: false,
                            last_processed_id: Some(stored.id.clone()),
                            last_scanned_time: stored.timestamp(),
                        },
                        message: Box::new(message),
                        passed,
                    };
                    tx.send(item).await.map_err(|_| ProviderError::Cancelled)?;
                }
            }
            tick @ PipelineItem::EmptyTick { .. } => {
                tx.send(tick).await.map_err(|_| ProviderError::Cancelled)?;
            }
            other => {
                tx.send(other).await.map_err(|_| ProviderError::Cancelled)?;
            }
        }
    }
    Ok(())
}
