//! Bounded request/response brokerage towards the external decoder.
//!
//! The broker owns the only mutable state of a message search: the pending
//! map. Every dispatched request resolves exactly once, to a decoded batch,
//! a timeout, or a dispatch failure.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Semaphore, mpsc, oneshot},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    error::{ProviderError, Result},
    model::{MessageBatch, ParsedMessage},
    observability,
};

const ADMISSION_BACKOFF: Duration = Duration::from_millis(100);

/// Outbound frame of the codec contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecBatchRequest {
    pub request_id: Uuid,
    pub stream: String,
    #[serde(default)]
    pub attributes: Vec<String>,
    pub payloads: Vec<Vec<u8>>,
}

/// Inbound frame of the codec contract. `messages` aligns with the request's
/// payloads by index; a `None` slot is a per-message decode failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecBatchResponse {
    pub request_id: Uuid,
    pub messages: Vec<Option<ParsedMessage>>,
}

/// Transport seam towards the decoder. Responses travel back over the
/// channel handed to [`CodecBroker::new`]; correlation is by request id and
/// delivery order is arbitrary.
#[async_trait]
pub trait CodecTransport: Send + Sync {
    async fn dispatch(&self, request: CodecBatchRequest) -> Result<()>;
}

struct PendingSlot {
    tx: oneshot::Sender<Option<Vec<Option<ParsedMessage>>>>,
    token: u64,
    started: Instant,
    stream: String,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

pub struct CodecBroker {
    transport: Arc<dyn CodecTransport>,
    pending: Arc<DashMap<Uuid, PendingSlot>>,
    admission: Arc<Semaphore>,
    send_pool: Arc<Semaphore>,
    response_timeout: Duration,
    use_pin_attributes: bool,
    token_counter: AtomicU64,
    pump: JoinHandle<()>,
}

impl CodecBroker {
    pub fn new(
        transport: Arc<dyn CodecTransport>,
        responses: mpsc::Receiver<CodecBatchResponse>,
        config: &Config,
    ) -> Arc<Self> {
        let pending: Arc<DashMap<Uuid, PendingSlot>> = Arc::new(DashMap::new());
        let pump = spawn_response_pump(
            responses,
            Arc::clone(&pending),
            config.codec_callback_thread_pool,
        );
        Arc::new(Self {
            transport,
            pending,
            admission: Arc::new(Semaphore::new(config.codec_pending_batch_limit)),
            send_pool: Arc::new(Semaphore::new(config.codec_request_thread_pool)),
            response_timeout: config.codec_response_timeout(),
            use_pin_attributes: config.codec_use_pin_attributes,
            token_counter: AtomicU64::new(0),
            pump,
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Decode one raw batch. Suspends while the pending map is full, then
    /// dispatches and awaits the correlated response. Returns one slot per
    /// message in the batch; `None` slots are decode failures (timeout,
    /// dispatch failure, or per-message codec rejection).
    pub async fn decode(&self, batch: &MessageBatch) -> Vec<Option<ParsedMessage>> {
        let expected = batch.len();
        let rx = match self.submit(batch).await {
            Ok(rx) => rx,
            Err(err) => {
                warn!(stream = %batch.stream, "codec dispatch failed: {err}");
                return vec![None; expected];
            }
        };
        match rx.await {
            Ok(Some(mut decoded)) => {
                decoded.resize_with(expected, || None);
                decoded
            }
            Ok(None) | Err(_) => vec![None; expected],
        }
    }

    async fn submit(
        &self,
        batch: &MessageBatch,
    ) -> Result<oneshot::Receiver<Option<Vec<Option<ParsedMessage>>>>> {
        // Admission control: cooperative poll so a full pending map blocks
        // new senders without queueing them.
        let permit = loop {
            match Arc::clone(&self.admission).try_acquire_owned() {
                Ok(permit) => break permit,
                Err(_) => sleep(ADMISSION_BACKOFF).await,
            }
        };

        let request = self.build_request(batch);
        let request_id = request.request_id;
        let token = self.token_counter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request_id,
            PendingSlot {
                tx,
                token,
                started: Instant::now(),
                stream: batch.stream.to_string(),
                _permit: permit,
            },
        );
        observability::codec_request_started();

        // Deadline task: a late response must not be able to close a slot
        // that was already recycled, hence the token identity check.
        let pending = Arc::clone(&self.pending);
        let timeout = self.response_timeout;
        tokio::spawn(async move {
            sleep(timeout).await;
            if let Some((_, slot)) = pending.remove_if(&request_id, |_, slot| slot.token == token) {
                warn!(
                    request = %request_id,
                    stream = %slot.stream,
                    "codec response missed the {} ms deadline",
                    timeout.as_millis()
                );
                observability::codec_request_finished(
                    &slot.stream,
                    "timeout",
                    slot.started.elapsed().as_secs_f64(),
                );
                let _ = slot.tx.send(None);
            }
        });

        // Dispatch on the bounded sender pool.
        let transport = Arc::clone(&self.transport);
        let send_pool = Arc::clone(&self.send_pool);
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            let _send_permit = match send_pool.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if let Err(err) = transport.dispatch(request).await {
                if let Some((_, slot)) =
                    pending.remove_if(&request_id, |_, slot| slot.token == token)
                {
                    warn!(request = %request_id, stream = %slot.stream, "codec dispatch failed: {err}");
                    observability::codec_request_finished(
                        &slot.stream,
                        "dispatch_failed",
                        slot.started.elapsed().as_secs_f64(),
                    );
                    let _ = slot.tx.send(None);
                }
            }
        });

        Ok(rx)
    }

    fn build_request(&self, batch: &MessageBatch) -> CodecBatchRequest {
        let attributes = if self.use_pin_attributes {
            vec![batch.stream.name.clone(), "parsed".to_string()]
        } else {
            Vec::new()
        };
        CodecBatchRequest {
            request_id: Uuid::new_v4(),
            stream: batch.stream.name.clone(),
            attributes,
            payloads: batch
                .messages()
                .map(|message| message.raw.clone())
                .collect(),
        }
    }
}

impl Drop for CodecBroker {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn spawn_response_pump(
    mut responses: mpsc::Receiver<CodecBatchResponse>,
    pending: Arc<DashMap<Uuid, PendingSlot>>,
    callback_pool: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let callbacks = Arc::new(Semaphore::new(callback_pool));
        while let Some(response) = responses.recv().await {
            let permit = match Arc::clone(&callbacks).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let pending = Arc::clone(&pending);
            tokio::spawn(async move {
                let _permit = permit;
                match pending.remove(&response.request_id) {
                    Some((_, slot)) => {
                        observability::codec_request_finished(
                            &slot.stream,
                            "ok",
                            slot.started.elapsed().as_secs_f64(),
                        );
                        let _ = slot.tx.send(Some(response.messages));
                    }
                    // Duplicate or post-deadline response: the slot is gone.
                    None => debug!(request = %response.request_id, "dropping unmatched codec response"),
                }
            });
        }
    })
}

/// In-process decoder used when no external codec is wired up: payloads that
/// parse as JSON objects become parsed messages, everything else fails
/// per-message. Also serves as the transport double in tests.
pub struct LoopbackCodec {
    responses: mpsc::Sender<CodecBatchResponse>,
}

impl LoopbackCodec {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<CodecBatchResponse>) {
        let (tx, rx) = mpsc::channel(64);
        (Arc::new(Self { responses: tx }), rx)
    }
}

#[async_trait]
impl CodecTransport for LoopbackCodec {
    async fn dispatch(&self, request: CodecBatchRequest) -> Result<()> {
        let messages = request
            .payloads
            .iter()
            .map(|payload| {
                serde_json::from_slice::<serde_json::Value>(payload)
                    .ok()
                    .filter(serde_json::Value::is_object)
                    .map(|fields| ParsedMessage {
                        message_type: fields
                            .get("messageType")
                            .and_then(|value| value.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        fields,
                    })
            })
            .collect();
        self.responses
            .send(CodecBatchResponse {
                request_id: request.request_id,
                messages,
            })
            .await
            .map_err(|_| ProviderError::CodecDispatchFailed("response channel closed".into()))
    }
}
