//! HTTP surface: SSE search endpoints, bounded JSON variants, record
//! lookups, cross-references, health and metrics.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    middleware,
    response::{
        IntoResponse, Response,
        sse::Sse,
    },
    routing::get,
};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use futures::StreamExt;
use tokio::{net::TcpListener, sync::mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    codec::CodecBroker,
    config::Config,
    error::{ProviderError, Result},
    filter::{build_event_filters, build_message_filters},
    model::{
        MessageId, ProviderEventId, ProviderMessage, SearchDirection, SearchRequest,
    },
    observability,
    search::{EventSearchEngine, MessageSearchEngine},
    sse::{Frame, FrameKind, SseWriter},
    store::{StoreBackend, StoreGateway},
};

#[derive(Clone)]
pub struct AppState {
    backend: Arc<dyn StoreBackend>,
    broker: Arc<CodecBroker>,
    config: Arc<Config>,
}

impl AppState {
    pub fn new(backend: Arc<dyn StoreBackend>, broker: Arc<CodecBroker>, config: Arc<Config>) -> Self {
        Self {
            backend,
            broker,
            config,
        }
    }

    fn gateway(&self, sse_mode: bool) -> Arc<StoreGateway> {
        Arc::new(StoreGateway::new(
            Arc::clone(&self.backend),
            &self.config,
            sse_mode,
        ))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(observability::metrics_handler))
        .route("/search/sse/events", get(search_events_sse))
        .route("/search/sse/messages", get(search_messages_sse))
        .route("/search/events", get(search_events_json))
        .route("/search/messages", get(search_messages_json))
        .route("/event/{id}", get(get_event))
        .route("/event/{id}/messages", get(get_event_messages))
        .route("/message/{id}", get(get_message))
        .route("/message/{id}/events", get(get_message_events))
        .with_state(state)
        .layer(middleware::from_fn(observability::track_http_metrics))
        .layer(TraceLayer::new_for_http())
}

pub async fn run(state: AppState) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let app = router(state);
    info!("starting provider server on {addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| ProviderError::Io(err))?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SearchKind {
    Events,
    Messages,
}

/// Assemble a validated [`SearchRequest`] from the raw query pairs.
fn parse_search_request(params: &[(String, String)], kind: SearchKind) -> Result<SearchRequest> {
    let mut request = SearchRequest {
        direction: SearchDirection::Next,
        start_timestamp: None,
        end_timestamp: None,
        resume_event_id: None,
        resume_message_ids: Vec::new(),
        streams: Vec::new(),
        parent_event: None,
        result_count_limit: None,
        limit_for_parent: None,
        keep_open: false,
        metadata_only: false,
        attached_messages: false,
        lookup_limit_days: None,
    };

    for (key, value) in params {
        match key.as_str() {
            "startTimestamp" => request.start_timestamp = Some(parse_timestamp(value)?),
            "endTimestamp" => request.end_timestamp = Some(parse_timestamp(value)?),
            "searchDirection" => request.direction = value.parse()?,
            "stream" => request.streams.push(value.clone()),
            "resumeFromId" => match kind {
                SearchKind::Events => {
                    request.resume_event_id = Some(ProviderEventId::parse_wire(value)?);
                }
                SearchKind::Messages => {
                    request.resume_message_ids.push(MessageId::parse_wire(value)?);
                }
            },
            "parentEvent" => request.parent_event = Some(ProviderEventId::parse_wire(value)?),
            "resultCountLimit" => request.result_count_limit = Some(parse_number(key, value)?),
            "limitForParent" => request.limit_for_parent = Some(parse_number(key, value)?),
            "lookupLimitDays" => request.lookup_limit_days = Some(parse_number(key, value)?),
            "keepOpen" => request.keep_open = parse_bool(key, value)?,
            "metadataOnly" => request.metadata_only = parse_bool(key, value)?,
            "attachedMessages" => request.attached_messages = parse_bool(key, value)?,
            _ => {}
        }
    }

    request.validate()?;
    Ok(request)
}

/// Timestamps arrive as epoch milliseconds or RFC 3339 instants.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(millis) = trimmed.parse::<i64>() {
        return Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| ProviderError::InvalidRequest(format!("timestamp {raw} out of range")));
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| ProviderError::InvalidRequest(format!("malformed timestamp '{raw}'")))
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| ProviderError::InvalidRequest(format!("invalid value '{raw}' for '{key}'")))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(ProviderError::InvalidRequest(format!(
            "invalid boolean '{other}' for '{key}'"
        ))),
    }
}

fn sse_response(rx: mpsc::Receiver<Frame>) -> Response {
    let stream = ReceiverStream::new(rx).map(|frame| Ok::<_, Infallible>(frame.to_sse_event()));
    Sse::new(stream).into_response()
}

async fn search_events_sse(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Response> {
    let request = parse_search_request(&params, SearchKind::Events)?;
    let filters = build_event_filters(&params)?;

    let (tx, rx) = mpsc::channel(64);
    let writer = SseWriter::new(tx);
    writer.start_keep_alive(state.config.keep_alive_timeout());

    let engine = EventSearchEngine::new(
        state.gateway(true),
        Arc::clone(&state.config),
        request,
        filters,
    );
    let task_writer = Arc::clone(&writer);
    tokio::spawn(async move {
        if let Err(err) = engine.run(Arc::clone(&task_writer)).await {
            if !matches!(err, ProviderError::Cancelled) {
                let _ = task_writer.write_error(&err).await;
            }
        }
        task_writer.close().await;
    });

    Ok(sse_response(rx))
}

async fn search_messages_sse(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Response> {
    let request = parse_search_request(&params, SearchKind::Messages)?;
    let filters = build_message_filters(&params)?;

    let (tx, rx) = mpsc::channel(64);
    let writer = SseWriter::new(tx);
    writer.start_keep_alive(state.config.keep_alive_timeout());

    let engine = MessageSearchEngine::new(
        state.gateway(true),
        Arc::clone(&state.broker),
        Arc::clone(&state.config),
        request,
        filters,
    );
    let task_writer = Arc::clone(&writer);
    tokio::spawn(async move {
        if let Err(err) = engine.run(Arc::clone(&task_writer)).await {
            if !matches!(err, ProviderError::Cancelled) {
                let _ = task_writer.write_error(&err).await;
            }
        }
        task_writer.close().await;
    });

    Ok(sse_response(rx))
}

/// Drain a bounded search into a JSON array of data frames.
async fn collect_frames(
    mut rx: mpsc::Receiver<Frame>,
    task: tokio::task::JoinHandle<Result<()>>,
) -> Result<Vec<Value>> {
    let mut records = Vec::new();
    while let Some(frame) = rx.recv().await {
        if matches!(frame.kind, FrameKind::Event | FrameKind::Message) {
            records.push(frame.data);
        }
    }
    match task.await {
        Ok(Ok(())) => Ok(records),
        Ok(Err(err)) => Err(err),
        Err(join) => Err(ProviderError::StoreFatal(join.to_string())),
    }
}

async fn search_events_json(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<Vec<Value>>> {
    let mut request = parse_search_request(&params, SearchKind::Events)?;
    request.keep_open = false;
    let filters = build_event_filters(&params)?;

    let (tx, rx) = mpsc::channel(256);
    let writer = SseWriter::new(tx);
    let engine = EventSearchEngine::new(
        state.gateway(false),
        Arc::clone(&state.config),
        request,
        filters,
    );
    // The task owns the only writer handle so the channel closes behind it.
    let task = tokio::spawn(async move {
        let result = engine.run(Arc::clone(&writer)).await;
        writer.close().await;
        result
    });
    Ok(Json(collect_frames(rx, task).await?))
}

async fn search_messages_json(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<Vec<Value>>> {
    let mut request = parse_search_request(&params, SearchKind::Messages)?;
    request.keep_open = false;
    let filters = build_message_filters(&params)?;

    let (tx, rx) = mpsc::channel(256);
    let writer = SseWriter::new(tx);
    let engine = MessageSearchEngine::new(
        state.gateway(false),
        Arc::clone(&state.broker),
        Arc::clone(&state.config),
        request,
        filters,
    );
    // The task owns the only writer handle so the channel closes behind it.
    let task = tokio::spawn(async move {
        let result = engine.run(Arc::clone(&writer)).await;
        writer.close().await;
        result
    });
    Ok(Json(collect_frames(rx, task).await?))
}

async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let id = ProviderEventId::parse_wire(&id)?;
    let gateway = state.gateway(false);
    let event = gateway
        .get_event(&id)
        .await?
        .ok_or_else(|| ProviderError::NotFound(format!("event {id}")))?;
    Ok(Json(event).into_response())
}

async fn get_event_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<String>>> {
    let id = ProviderEventId::parse_wire(&id)?;
    let gateway = state.gateway(false);
    let ids = gateway.get_attached_message_ids(&id.event_id).await?;
    Ok(Json(ids.iter().map(MessageId::wire).collect()))
}

async fn get_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProviderMessage>> {
    let (stream, sequence) = MessageId::parse_wire(&id)?;
    let gateway = state.gateway(false);
    let stored = gateway
        .get_message(&stream, sequence)
        .await?
        .ok_or_else(|| ProviderError::NotFound(format!("message {id}")))?;

    let batch = crate::model::MessageBatch {
        stream: stream.clone(),
        messages: vec![stored.clone()],
    };
    let parsed = state.broker.decode(&batch).await.into_iter().next().flatten();
    let attached = gateway.get_attached_event_ids(&stream, sequence).await?;
    Ok(Json(ProviderMessage::from_parts(&stored, parsed, attached)))
}

async fn get_message_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<String>>> {
    let (stream, sequence) = MessageId::parse_wire(&id)?;
    let gateway = state.gateway(false);
    Ok(Json(gateway.get_attached_event_ids(&stream, sequence).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn parses_a_full_event_request() {
        let request = parse_search_request(
            &pairs(&[
                ("startTimestamp", "1709640000000"),
                ("endTimestamp", "2024-03-05T13:00:00Z"),
                ("searchDirection", "next"),
                ("resultCountLimit", "25"),
                ("limitForParent", "3"),
                ("metadataOnly", "true"),
                ("parentEvent", "b-1:root"),
            ]),
            SearchKind::Events,
        )
        .unwrap();
        assert_eq!(request.result_count_limit, Some(25));
        assert_eq!(request.limit_for_parent, Some(3));
        assert!(request.metadata_only);
        assert_eq!(
            request.parent_event.as_ref().and_then(|p| p.batch_id.as_deref()),
            Some("b-1")
        );
    }

    #[test]
    fn message_resume_ids_accumulate_per_stream() {
        let request = parse_search_request(
            &pairs(&[
                ("startTimestamp", "1709640000000"),
                ("stream", "alias-a"),
                ("stream", "alias-b"),
                ("resumeFromId", "alias-a:first:10"),
                ("resumeFromId", "alias-b:second:4"),
            ]),
            SearchKind::Messages,
        )
        .unwrap();
        assert_eq!(request.streams.len(), 2);
        assert_eq!(request.resume_message_ids.len(), 2);
    }

    #[test]
    fn rejects_missing_start_point() {
        let result = parse_search_request(
            &pairs(&[("searchDirection", "previous")]),
            SearchKind::Events,
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_malformed_timestamp() {
        let result = parse_search_request(
            &pairs(&[("startTimestamp", "yesterday")]),
            SearchKind::Events,
        );
        assert!(result.is_err());
    }
}
