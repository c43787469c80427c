//! Merging per-stream pipelines into one time-ordered flow.

use tokio::sync::mpsc;

use crate::{
    model::{PipelineItem, SearchDirection, compare_positions},
    observability,
};

struct StreamHolder {
    rx: mpsc::Receiver<PipelineItem>,
    current: Option<PipelineItem>,
}

impl StreamHolder {
    async fn advance(&mut self) {
        self.current = self.rx.recv().await;
    }
}

/// Holds the head of every per-stream channel and repeatedly releases the
/// head with the minimum (forward) or maximum (backward) position. Heartbeat
/// ticks are consumed internally: they advance the laggard stream without
/// appearing in the output, so one quiet stream cannot stall the rest.
///
/// Output guarantee: across all released messages the timestamps are
/// monotonic in the scan direction, with the deterministic
/// `(timestamp, stream, direction, sequence)` tie-break.
pub struct StreamMerger {
    direction: SearchDirection,
    holders: Vec<StreamHolder>,
    initialized: bool,
}

impl StreamMerger {
    pub fn new(direction: SearchDirection, receivers: Vec<mpsc::Receiver<PipelineItem>>) -> Self {
        Self {
            direction,
            holders: receivers
                .into_iter()
                .map(|rx| StreamHolder { rx, current: None })
                .collect(),
            initialized: false,
        }
    }

    async fn init(&mut self) {
        for holder in &mut self.holders {
            holder.advance().await;
        }
        self.initialized = true;
    }

    /// Next message item in scan order, or `None` once every stream is
    /// exhausted. A stream is exhausted when its channel closes; terminal
    /// ticks carry a sentinel position so finished streams never win a pick
    /// against live ones but also never block them.
    pub async fn next(&mut self) -> Option<PipelineItem> {
        if !self.initialized {
            self.init().await;
        }
        loop {
            let pick = self
                .holders
                .iter()
                .enumerate()
                .filter_map(|(index, holder)| {
                    holder.current.as_ref().map(|item| (index, item.merge_key()))
                })
                .min_by(|(_, a), (_, b)| compare_positions(self.direction, a, b))
                .map(|(index, _)| index)?;

            let holder = &mut self.holders[pick];
            let is_message = matches!(
                holder.current,
                Some(PipelineItem::FilteredMessage { .. })
            );
            if is_message {
                let item = holder.current.take();
                holder.advance().await;
                return item;
            }

            // Tick (or stray non-message item): consume it to move the
            // stream forward. A terminal tick pins the holder until the
            // channel closes behind it.
            observability::record_merger_tick();
            holder.advance().await;
        }
    }
}
