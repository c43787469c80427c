//! End-to-end event search scenarios against the in-memory backend.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::mpsc;

use tracedx::{
    config::Config,
    filter::{EventFilterSet, build_event_filters},
    model::{
        EventBatch, EventWrapper, ProviderEvent, ProviderEventId, SearchDirection, SearchRequest,
    },
    search::EventSearchEngine,
    sse::{Frame, FrameKind, SseWriter},
    store::{StoreGateway, memory::MemoryStore},
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap()
}

fn minutes(count: i64) -> Duration {
    Duration::minutes(count)
}

fn single(id: &str, parent: Option<&str>, start: DateTime<Utc>) -> EventWrapper {
    EventWrapper::Single(event(id, None, parent, start))
}

fn event(
    id: &str,
    batch_id: Option<&str>,
    parent: Option<&str>,
    start: DateTime<Utc>,
) -> ProviderEvent {
    ProviderEvent {
        id: id.into(),
        batch_id: batch_id.map(str::to_string),
        parent_id: parent.map(str::to_string),
        name: format!("event {id}"),
        event_type: "step".into(),
        start,
        end: start,
        successful: true,
        attached_message_ids: Vec::new(),
        content: None,
    }
}

/// Batch `id` with `count` events `id-1..id-count`, one minute apart.
fn batch(id: &str, count: usize, start: DateTime<Utc>) -> EventWrapper {
    EventWrapper::Batch(EventBatch {
        batch_id: id.into(),
        parent_id: None,
        events: (1..=count)
            .map(|n| {
                event(
                    &format!("{id}-{n}"),
                    Some(id),
                    None,
                    start + minutes(n as i64 - 1),
                )
            })
            .collect(),
    })
}

fn request(
    direction: SearchDirection,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> SearchRequest {
    SearchRequest {
        direction,
        start_timestamp: Some(start),
        end_timestamp: Some(end),
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
    }
}

async fn search_frames(
    store: Arc<MemoryStore>,
    request: SearchRequest,
    filters: EventFilterSet,
) -> Vec<Frame> {
    let config = Arc::new(Config::default());
    let gateway = Arc::new(StoreGateway::new(store, &config, false));
    let engine = EventSearchEngine::new(gateway, Arc::clone(&config), request, filters);

    let (tx, mut rx) = mpsc::channel(1024);
    let writer = SseWriter::new(tx);
    // The task owns the only writer handle; the channel closes with it.
    let task = tokio::spawn(async move {
        let result = engine.run(Arc::clone(&writer)).await;
        writer.close().await;
        result
    });

    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(frame);
    }
    task.await.unwrap().unwrap();
    frames
}

async fn search_ids(store: Arc<MemoryStore>, request: SearchRequest) -> Vec<String> {
    search_frames(store, request, EventFilterSet::default())
        .await
        .into_iter()
        .filter(|frame| frame.kind == FrameKind::Event)
        .map(|frame| frame.data["id"].as_str().unwrap().to_string())
        .collect()
}

fn ids(prefix: &str, range: std::ops::RangeInclusive<usize>) -> Vec<String> {
    range.map(|n| format!("{prefix}-{n}")).collect()
}

#[tokio::test]
async fn all_interval_forward_emits_the_whole_batch_in_order() {
    let store = Arc::new(MemoryStore::new());
    store.add_event_wrapper(batch("1", 11, t0()));

    let found = search_ids(
        Arc::clone(&store),
        request(SearchDirection::Next, t0() - minutes(1), t0() + minutes(11)),
    )
    .await;
    assert_eq!(found, ids("1", 1..=11));
}

#[tokio::test]
async fn start_window_cuts_at_the_exclusive_end() {
    let store = Arc::new(MemoryStore::new());
    store.add_event_wrapper(batch("1", 11, t0()));

    let found = search_ids(
        Arc::clone(&store),
        request(SearchDirection::Next, t0() - minutes(1), t0() + minutes(1)),
    )
    .await;
    assert_eq!(found, ids("1", 1..=1));
}

#[tokio::test]
async fn adjacent_batches_emit_in_wrapper_order() {
    let store = Arc::new(MemoryStore::new());
    store.add_event_wrapper(batch("1", 6, t0()));
    store.add_event_wrapper(batch("2", 6, t0() + minutes(5)));

    let found = search_ids(
        Arc::clone(&store),
        request(
            SearchDirection::Next,
            t0() - minutes(100),
            t0() + minutes(100),
        ),
    )
    .await;
    let mut expected = ids("1", 1..=6);
    expected.extend(ids("2", 1..=6));
    assert_eq!(found, expected);
}

#[tokio::test]
async fn intersecting_batches_emit_the_full_set() {
    let store = Arc::new(MemoryStore::new());
    store.add_event_wrapper(batch("1", 6, t0()));
    store.add_event_wrapper(batch("2", 6, t0() + minutes(3)));

    let found = search_ids(
        Arc::clone(&store),
        request(
            SearchDirection::Next,
            t0() - minutes(100),
            t0() + minutes(100),
        ),
    )
    .await;
    let found: std::collections::BTreeSet<_> = found.into_iter().collect();
    let expected: std::collections::BTreeSet<_> = ids("1", 1..=6)
        .into_iter()
        .chain(ids("2", 1..=6))
        .collect();
    assert_eq!(found, expected);
}

#[tokio::test]
async fn resume_mid_batch_continues_after_the_resume_event() {
    let store = Arc::new(MemoryStore::new());
    store.add_event_wrapper(batch("1", 6, t0()));
    store.add_event_wrapper(batch("2", 6, t0() + minutes(5)));

    let mut req = request(
        SearchDirection::Next,
        t0() - minutes(100),
        t0() + minutes(100),
    );
    req.resume_event_id = Some(ProviderEventId::batched("1", "1-4"));

    let found = search_ids(Arc::clone(&store), req).await;
    let mut expected = ids("1", 5..=6);
    expected.extend(ids("2", 1..=6));
    assert_eq!(found, expected);
}

#[tokio::test]
async fn reverse_resume_walks_backwards_excluding_the_resume_event() {
    let store = Arc::new(MemoryStore::new());
    store.add_event_wrapper(batch("1", 11, t0()));

    let mut req = request(SearchDirection::Previous, t0() + minutes(10), t0());
    req.resume_event_id = Some(ProviderEventId::batched("1", "1-10"));

    let found = search_ids(Arc::clone(&store), req).await;
    let expected: Vec<String> = (2..=9).rev().map(|n| format!("1-{n}")).collect();
    assert_eq!(found, expected);
}

#[tokio::test]
async fn day_rollover_emits_each_event_exactly_once_in_order() {
    let store = Arc::new(MemoryStore::new());
    let late = Utc.with_ymd_and_hms(2024, 3, 5, 23, 58, 0).unwrap();
    for n in 0..5 {
        store.add_event_wrapper(single(&format!("e-{n}"), None, late + minutes(n)));
    }

    let found = search_ids(
        Arc::clone(&store),
        request(SearchDirection::Next, late - minutes(1), late + minutes(5)),
    )
    .await;
    let expected: Vec<String> = (0..5).map(|n| format!("e-{n}")).collect();
    assert_eq!(found, expected);
}

#[tokio::test]
async fn backward_search_is_the_forward_sequence_reversed() {
    let store = Arc::new(MemoryStore::new());
    store.add_event_wrapper(batch("1", 6, t0()));
    store.add_event_wrapper(batch("2", 6, t0() + minutes(6)));

    let forward = search_ids(
        Arc::clone(&store),
        request(
            SearchDirection::Next,
            t0() - minutes(100),
            t0() + minutes(100),
        ),
    )
    .await;
    let backward = search_ids(
        Arc::clone(&store),
        request(
            SearchDirection::Previous,
            t0() + minutes(100),
            t0() - minutes(100),
        ),
    )
    .await;
    let reversed: Vec<String> = forward.into_iter().rev().collect();
    assert_eq!(backward, reversed);
}

#[tokio::test]
async fn per_parent_cap_bounds_each_parents_descendants() {
    let store = Arc::new(MemoryStore::new());
    store.add_event_wrapper(single("r1", None, t0()));
    store.add_event_wrapper(single("r2", None, t0() + minutes(1)));
    for n in 0..4 {
        store.add_event_wrapper(single(
            &format!("c-{n}"),
            Some("r1"),
            t0() + minutes(2 + n),
        ));
    }
    store.add_event_wrapper(single("d-0", Some("r2"), t0() + minutes(6)));
    // Child of the event that gets rejected by the cap.
    store.add_event_wrapper(single("gc-0", Some("c-2"), t0() + minutes(7)));

    let mut req = request(SearchDirection::Next, t0() - minutes(1), t0() + minutes(60));
    req.limit_for_parent = Some(2);

    let found = search_ids(Arc::clone(&store), req).await;
    assert_eq!(found, vec!["r1", "r2", "c-0", "c-1", "d-0"]);
}

#[tokio::test]
async fn global_cap_stops_the_stream() {
    let store = Arc::new(MemoryStore::new());
    store.add_event_wrapper(batch("1", 11, t0()));

    let mut req = request(SearchDirection::Next, t0() - minutes(1), t0() + minutes(60));
    req.result_count_limit = Some(3);

    let found = search_ids(Arc::clone(&store), req).await;
    assert_eq!(found, ids("1", 1..=3));
}

#[tokio::test]
async fn filters_restrict_the_output() {
    let store = Arc::new(MemoryStore::new());
    store.add_event_wrapper(single("keep-1", None, t0()));
    store.add_event_wrapper(single("drop-1", None, t0() + minutes(1)));
    store.add_event_wrapper(single("keep-2", None, t0() + minutes(2)));

    let params = vec![
        ("filters".to_string(), "name".to_string()),
        ("name-values".to_string(), "keep".to_string()),
    ];
    let filters = build_event_filters(&params).unwrap();

    let frames = search_frames(
        Arc::clone(&store),
        request(SearchDirection::Next, t0() - minutes(1), t0() + minutes(60)),
        filters,
    )
    .await;
    let found: Vec<String> = frames
        .iter()
        .filter(|frame| frame.kind == FrameKind::Event)
        .map(|frame| frame.data["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(found, vec!["keep-1", "keep-2"]);
}

#[tokio::test]
async fn metadata_only_emits_tree_nodes_without_content() {
    let store = Arc::new(MemoryStore::new());
    let mut with_body = event("e-1", None, None, t0());
    with_body.content = Some(serde_json::json!({"verbose": true}));
    store.add_event_wrapper(EventWrapper::Single(with_body));

    let mut req = request(SearchDirection::Next, t0() - minutes(1), t0() + minutes(1));
    req.metadata_only = true;

    let frames = search_frames(Arc::clone(&store), req, EventFilterSet::default()).await;
    let event_frame = frames
        .iter()
        .find(|frame| frame.kind == FrameKind::Event)
        .unwrap();
    assert!(event_frame.data.get("content").is_none());
    assert_eq!(event_frame.data["id"], "e-1");
}

#[tokio::test]
async fn missing_resume_event_is_a_client_error() {
    let store = Arc::new(MemoryStore::new());
    store.add_event_wrapper(batch("1", 3, t0()));

    let mut req = request(SearchDirection::Next, t0(), t0() + minutes(60));
    req.resume_event_id = Some(ProviderEventId::single("nope"));

    let config = Arc::new(Config::default());
    let gateway = Arc::new(StoreGateway::new(store, &config, false));
    let engine = EventSearchEngine::new(
        gateway,
        Arc::clone(&config),
        req,
        EventFilterSet::default(),
    );
    let (tx, _rx) = mpsc::channel(16);
    let writer = SseWriter::new(tx);
    let result = engine.run(writer).await;
    assert!(matches!(
        result,
        Err(tracedx::ProviderError::InvalidRequest(_))
    ));
}

/// Deterministic linear congruential generator for layout randomization.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

#[tokio::test]
async fn random_layouts_stay_ordered_and_exclude_the_resume_event() {
    let mut rng = Lcg(42);
    for round in 0..5 {
        let store = Arc::new(MemoryStore::new());
        let count = 20 + (rng.next() % 30) as usize;
        let mut starts = Vec::new();
        for n in 0..count {
            // Jittered but strictly increasing offsets; spanning several
            // UTC days exercises the interval splitting.
            let offset = (n as i64) * 61 + (rng.next() % 45) as i64;
            let start = t0() + minutes(offset);
            starts.push((format!("ev-{round}-{n}"), start));
            store.add_event_wrapper(single(&format!("ev-{round}-{n}"), None, start));
        }

        let forward = search_ids(
            Arc::clone(&store),
            request(SearchDirection::Next, t0(), t0() + minutes(4 * 24 * 60)),
        )
        .await;
        assert_eq!(forward.len(), count);

        // Output order matches the store projection sorted by (start, id).
        starts.sort_by(|a, b| (a.1, &a.0).cmp(&(b.1, &b.0)));
        let expected: Vec<String> = starts.iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(forward, expected);

        let backward = search_ids(
            Arc::clone(&store),
            request(
                SearchDirection::Previous,
                t0() + minutes(4 * 24 * 60),
                t0() - minutes(1),
            ),
        )
        .await;
        let reversed: Vec<String> = forward.iter().rev().cloned().collect();
        assert_eq!(backward, reversed);

        // Resume from a random emitted event: everything strictly after it,
        // and never the resume event itself.
        let pick = (rng.next() as usize) % forward.len();
        let resume_id = forward[pick].clone();
        let mut req = request(SearchDirection::Next, t0(), t0() + minutes(4 * 24 * 60));
        req.resume_event_id = Some(ProviderEventId::single(resume_id.clone()));
        let resumed = search_ids(Arc::clone(&store), req).await;
        assert!(!resumed.contains(&resume_id));
        assert_eq!(resumed, forward[pick + 1..].to_vec());
    }
}
