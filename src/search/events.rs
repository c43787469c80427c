//! Event search orchestration: intervals in, ordered filtered events out.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::{sync::mpsc, time::sleep};
use tracing::{debug, info};

use crate::{
    config::Config,
    error::{ProviderError, Result},
    filter::EventFilterSet,
    model::{
        EventWrapper, ProviderEvent, ProviderEventId, SearchDirection, SearchRequest,
    },
    observability,
    search::interval::IntervalGenerator,
    sse::SseWriter,
    store::StoreGateway,
};

/// Admission counters per parent id. Once a parent reaches the cap, the
/// rejected child's own id is pinned with a sentinel so descendants of the
/// capped event are suppressed wherever they surface.
struct ParentEventCounter {
    limit: u64,
    counters: DashMap<String, u64>,
}

impl ParentEventCounter {
    fn new(limit: u64) -> Self {
        Self {
            limit,
            counters: DashMap::new(),
        }
    }

    fn admit(&self, event: &ProviderEvent) -> bool {
        let Some(parent) = &event.parent_id else {
            return true;
        };
        let capped = {
            let mut counter = self.counters.entry(parent.clone()).or_insert(0);
            if *counter >= self.limit {
                true
            } else {
                *counter += 1;
                false
            }
        };
        if capped {
            self.counters.insert(event.id.clone(), u64::MAX);
        }
        !capped
    }
}

/// Stateful head trimming for the first run of a resumed search. Events at or
/// behind the resume position accumulate until the resume id shows up and
/// discards them; an event strictly past the position flushes the head
/// instead, covering the case where the resume event is no longer listed.
struct ResumeTrimmer {
    target: Option<String>,
    reference: DateTime<Utc>,
    direction: SearchDirection,
    head: Vec<ProviderEvent>,
}

impl ResumeTrimmer {
    fn inactive() -> Self {
        Self {
            target: None,
            reference: DateTime::<Utc>::MIN_UTC,
            direction: SearchDirection::Next,
            head: Vec::new(),
        }
    }

    fn new(target: String, reference: DateTime<Utc>, direction: SearchDirection) -> Self {
        Self {
            target: Some(target),
            reference,
            direction,
            head: Vec::new(),
        }
    }

    fn push(&mut self, event: ProviderEvent) -> Vec<ProviderEvent> {
        let Some(target) = &self.target else {
            return vec![event];
        };
        if event.id == *target {
            self.head.clear();
            self.target = None;
            return Vec::new();
        }
        let strictly_past = match self.direction {
            SearchDirection::Next => event.start > self.reference,
            SearchDirection::Previous => event.start < self.reference,
        };
        if strictly_past {
            self.target = None;
            let mut flushed = std::mem::take(&mut self.head);
            flushed.push(event);
            return flushed;
        }
        self.head.push(event);
        Vec::new()
    }

    fn finish(&mut self) -> Vec<ProviderEvent> {
        self.target = None;
        std::mem::take(&mut self.head)
    }
}

const OPEN_SCAN_HORIZON_DAYS: i64 = 365;

pub struct EventSearchEngine {
    gateway: Arc<StoreGateway>,
    config: Arc<Config>,
    request: SearchRequest,
    filters: EventFilterSet,
}

struct EmitState {
    emitted: usize,
    scanned: u64,
    parent_counter: Option<ParentEventCounter>,
    last_emitted: Option<(ProviderEventId, DateTime<Utc>, DateTime<Utc>)>,
}

impl EventSearchEngine {
    pub fn new(
        gateway: Arc<StoreGateway>,
        config: Arc<Config>,
        request: SearchRequest,
        filters: EventFilterSet,
    ) -> Self {
        Self {
            gateway,
            config,
            request,
            filters,
        }
    }

    pub async fn run(self, writer: Arc<SseWriter>) -> Result<()> {
        self.request.validate()?;
        let started = std::time::Instant::now();

        let mut state = EmitState {
            emitted: 0,
            scanned: 0,
            parent_counter: self
                .request
                .limit_for_parent
                .map(ParentEventCounter::new),
            last_emitted: None,
        };

        // A parent with a batch id pins the search to that single batch.
        if let Some(parent) = self.request.parent_event.clone() {
            if parent.batch_id.is_some() {
                self.single_batch_pass(&parent, &mut state, &writer).await?;
                self.log_completion(&state, started);
                return Ok(());
            }
        }

        let (t0, trim_ref, resume_id) = self.resolve_start().await?;
        let capped = self
            .scan_pass(t0, trim_ref, resume_id, &mut state, &writer)
            .await?;

        if self.request.keep_open && !capped {
            loop {
                sleep(self.config.sse_search_delay()).await;
                let (t0, trim_ref, resume_id) = match &state.last_emitted {
                    Some((id, start, end)) => {
                        let t0 = if self.request.direction.is_forward() {
                            *start
                        } else {
                            *end
                        };
                        (t0, Some(*start), Some(id.clone()))
                    }
                    None => self.resolve_start().await?,
                };
                if self
                    .scan_pass(t0, trim_ref, resume_id, &mut state, &writer)
                    .await?
                {
                    break;
                }
            }
        }

        self.log_completion(&state, started);
        Ok(())
    }

    /// Initial position of the scan: the resume event's start (forward) or
    /// end (backward) when resuming, else the requested start timestamp. A
    /// missing resume event is a client error.
    async fn resolve_start(
        &self,
    ) -> Result<(DateTime<Utc>, Option<DateTime<Utc>>, Option<ProviderEventId>)> {
        match &self.request.resume_event_id {
            Some(resume) => {
                let event = self.gateway.get_event(resume).await?.ok_or_else(|| {
                    ProviderError::InvalidRequest(format!("resume event {resume} does not exist"))
                })?;
                let t0 = if self.request.direction.is_forward() {
                    event.start
                } else {
                    event.end
                };
                Ok((t0, Some(event.start), Some(resume.clone())))
            }
            None => {
                let start = self.request.start_timestamp.ok_or_else(|| {
                    ProviderError::InvalidRequest(
                        "startTimestamp is required without resumeFromId".into(),
                    )
                })?;
                Ok((start, None, None))
            }
        }
    }

    /// One full interval walk. Returns true when the global cap stopped it.
    async fn scan_pass(
        &self,
        t0: DateTime<Utc>,
        trim_ref: Option<DateTime<Utc>>,
        resume_id: Option<ProviderEventId>,
        state: &mut EmitState,
        writer: &Arc<SseWriter>,
    ) -> Result<bool> {
        let direction = self.request.direction;
        // Without an end bound each pass scans to a finite horizon; keep-open
        // passes pick up whatever accumulated past it.
        let end = self.request.end_timestamp.unwrap_or_else(|| {
            if direction.is_forward() {
                Utc::now().max(t0)
            } else {
                t0 - chrono::Duration::days(OPEN_SCAN_HORIZON_DAYS)
            }
        });
        let generator = IntervalGenerator::new(
            direction,
            t0,
            Some(end),
            self.config.event_search_gap(),
            resume_id.clone(),
        );

        let mut trimmer = match (&resume_id, trim_ref) {
            (Some(resume), Some(reference)) => {
                ResumeTrimmer::new(resume.event_id.clone(), reference, direction)
            }
            _ => ResumeTrimmer::inactive(),
        };

        // Intervals are fetched ahead of consumption through a bounded
        // buffer; backpressure from the writer throttles the producer.
        let (tx, mut rx) = mpsc::channel::<Vec<EventWrapper>>(self.config.event_search_pipeline_buffer);
        let gateway = Arc::clone(&self.gateway);
        let step = self.config.sse_event_search_step;
        let producer = tokio::spawn(async move {
            for interval in generator {
                let fetched = match &interval.resume_id {
                    Some(resume) => {
                        let bound = if direction.is_forward() {
                            interval.to
                        } else {
                            interval.from
                        };
                        gateway.get_events_from_resume(resume, bound, direction).await
                    }
                    None => {
                        gateway
                            .get_events(interval.query_from, interval.to, direction)
                            .await
                    }
                };
                let wrappers = match fetched {
                    Ok(wrappers) => wrappers,
                    Err(err) => return Err(err),
                };
                for page in wrappers.chunks(step.max(1)) {
                    if tx.send(page.to_vec()).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Ok(())
        });

        let mut capped = false;
        'outer: while let Some(page) = rx.recv().await {
            for wrapper in page {
                for event in self.expand(wrapper) {
                    for event in trimmer.push(event) {
                        if self.process_event(event, state, writer).await? {
                            capped = true;
                            break 'outer;
                        }
                    }
                }
            }
            // Yield in chunks so one oversized interval cannot monopolize
            // the task.
            if state.scanned % self.config.event_search_chunk_size as u64 == 0 {
                tokio::task::yield_now().await;
            }
        }

        if capped {
            producer.abort();
        } else {
            for event in trimmer.finish() {
                if self.process_event(event, state, writer).await? {
                    capped = true;
                    break;
                }
            }
            match producer.await {
                Ok(result) => result?,
                Err(join) if join.is_cancelled() => {}
                Err(join) => return Err(ProviderError::StoreFatal(join.to_string())),
            }
        }
        Ok(capped)
    }

    async fn single_batch_pass(
        &self,
        parent: &ProviderEventId,
        state: &mut EmitState,
        writer: &Arc<SseWriter>,
    ) -> Result<()> {
        let batch_id = parent.batch_id.as_deref().expect("checked by caller");
        let Some(batch) = self.gateway.get_event_batch(batch_id).await? else {
            return Err(ProviderError::NotFound(format!("event batch {batch_id}")));
        };
        for event in self.expand(EventWrapper::Batch(batch)) {
            if self.process_event(event, state, writer).await? {
                break;
            }
        }
        Ok(())
    }

    /// Batch wrappers expand to their contained events in direction order;
    /// the parent filter applies during expansion.
    fn expand(&self, wrapper: EventWrapper) -> Vec<ProviderEvent> {
        let parent = self
            .request
            .parent_event
            .as_ref()
            .map(|parent| parent.event_id.as_str());
        match wrapper {
            EventWrapper::Single(event) => {
                let included = match parent {
                    Some(parent) => event.parent_id.as_deref() == Some(parent),
                    None => true,
                };
                if included { vec![event] } else { Vec::new() }
            }
            EventWrapper::Batch(batch) => {
                let mut events: Vec<ProviderEvent> = batch
                    .events
                    .into_iter()
                    .filter(|event| match parent {
                        Some(parent) => event.parent_id.as_deref() == Some(parent),
                        None => true,
                    })
                    .collect();
                events.sort_by(|a, b| (a.start, &a.id).cmp(&(b.start, &b.id)));
                if !self.request.direction.is_forward() {
                    events.reverse();
                }
                events
            }
        }
    }

    /// Range check, filter, per-parent cap, global cap, emit. Returns true
    /// once the global cap is reached.
    async fn process_event(
        &self,
        event: ProviderEvent,
        state: &mut EmitState,
        writer: &Arc<SseWriter>,
    ) -> Result<bool> {
        state.scanned += 1;
        writer.observe_scanned(Some(event.id.clone()), event.start);

        if !self.in_range(&event) {
            return Ok(false);
        }
        if !self.filters.apply(&event) {
            return Ok(false);
        }
        if let Some(counter) = &state.parent_counter {
            if !counter.admit(&event) {
                debug!(event = %event.id, "per-parent cap rejected event");
                return Ok(false);
            }
        }
        if let Some(limit) = self.request.result_count_limit {
            if state.emitted >= limit {
                return Ok(true);
            }
        }

        state.last_emitted = Some((event.provider_id(), event.start, event.end));
        if self.request.metadata_only {
            writer.write_event_node(&event.tree_node()).await?;
        } else {
            let mut event = event;
            if !self.request.attached_messages {
                event.attached_message_ids.clear();
            }
            writer.write_event(&event).await?;
        }
        observability::record_emitted("event");
        state.emitted += 1;

        Ok(self
            .request
            .result_count_limit
            .is_some_and(|limit| state.emitted >= limit))
    }

    /// Events are in range when their start lies in the direction-wise
    /// half-open window: the start bound is inclusive, the end exclusive.
    fn in_range(&self, event: &ProviderEvent) -> bool {
        let forward = self.request.direction.is_forward();
        if let Some(start) = self.request.start_timestamp {
            let ok = if forward {
                event.start >= start
            } else {
                event.start <= start
            };
            if !ok {
                return false;
            }
        }
        if let Some(end) = self.request.end_timestamp {
            let ok = if forward {
                event.start < end
            } else {
                event.start > end
            };
            if !ok {
                return false;
            }
        }
        true
    }

    fn log_completion(&self, state: &EmitState, started: std::time::Instant) {
        info!(
            scanned = state.scanned,
            emitted = state.emitted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "event search finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap() + chrono::Duration::minutes(minute)
    }

    fn event(id: &str, parent: Option<&str>, minute: i64) -> ProviderEvent {
        ProviderEvent {
            id: id.into(),
            batch_id: None,
            parent_id: parent.map(str::to_string),
            name: id.into(),
            event_type: "step".into(),
            start: ts(minute),
            end: ts(minute),
            successful: true,
            attached_message_ids: Vec::new(),
            content: None,
        }
    }

    #[test]
    fn parent_cap_suppresses_descendants_of_capped_events() {
        let counter = ParentEventCounter::new(2);
        assert!(counter.admit(&event("c1", Some("root"), 0)));
        assert!(counter.admit(&event("c2", Some("root"), 1)));
        // Third child of root is rejected and pinned.
        assert!(!counter.admit(&event("c3", Some("root"), 2)));
        // Children of the capped event are suppressed too.
        assert!(!counter.admit(&event("gc1", Some("c3"), 3)));
        // Unrelated parents stay unaffected.
        assert!(counter.admit(&event("other", Some("root2"), 4)));
    }

    #[test]
    fn trimmer_discards_head_when_resume_found() {
        let mut trimmer = ResumeTrimmer::new("e-3".into(), ts(2), SearchDirection::Next);
        assert!(trimmer.push(event("e-1", None, 0)).is_empty());
        assert!(trimmer.push(event("e-2", None, 1)).is_empty());
        assert!(trimmer.push(event("e-3", None, 2)).is_empty());
        let after = trimmer.push(event("e-4", None, 3));
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, "e-4");
    }

    #[test]
    fn trimmer_flushes_head_when_resume_is_absent() {
        let mut trimmer = ResumeTrimmer::new("gone".into(), ts(2), SearchDirection::Next);
        assert!(trimmer.push(event("e-1", None, 1)).is_empty());
        let flushed = trimmer.push(event("e-4", None, 5));
        let ids: Vec<_> = flushed.iter().map(|event| event.id.as_str()).collect();
        assert_eq!(ids, vec!["e-1", "e-4"]);
    }

    #[test]
    fn trimmer_finish_drains_the_pending_head() {
        let mut trimmer = ResumeTrimmer::new("gone".into(), ts(9), SearchDirection::Next);
        assert!(trimmer.push(event("e-1", None, 1)).is_empty());
        let drained = trimmer.finish();
        assert_eq!(drained.len(), 1);
    }
}
