//! Lazy enumeration of day-tiled search windows.

use chrono::{DateTime, Days, Duration, NaiveTime, Utc};

use crate::model::{ProviderEventId, SearchDirection};

/// One chronological window `[from, to]`, at most one UTC calendar day wide.
/// `query_from` widens the lower edge by the configured gap (clamped to the
/// day start) so that batch wrappers positioned just below the edge are still
/// captured; contained records outside the requested range are dropped later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchInterval {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub query_from: DateTime<Utc>,
    pub resume_id: Option<ProviderEventId>,
}

pub fn day_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.date_naive().and_time(NaiveTime::MIN).and_utc()
}

pub fn day_end(ts: DateTime<Utc>) -> DateTime<Utc> {
    day_start(ts) + Days::new(1) - Duration::nanoseconds(1)
}

/// Ordered, lazy sequence of windows tiling `[t0, end]` in scan order,
/// splitting at UTC midnights. The resume id is attached to the first yielded
/// window only. Restartable only from the start.
pub struct IntervalGenerator {
    direction: SearchDirection,
    cursor: Option<DateTime<Utc>>,
    end: DateTime<Utc>,
    gap: Duration,
    resume_id: Option<ProviderEventId>,
}

impl IntervalGenerator {
    /// `t0` is the resume event's start (forward) or end (backward) when
    /// resuming, else the requested start timestamp. A `None` end bound means
    /// an open-ended scan towards the direction-appropriate sentinel.
    pub fn new(
        direction: SearchDirection,
        t0: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        gap: Duration,
        resume_id: Option<ProviderEventId>,
    ) -> Self {
        let end = end.unwrap_or(match direction {
            SearchDirection::Next => DateTime::<Utc>::MAX_UTC,
            SearchDirection::Previous => DateTime::<Utc>::MIN_UTC,
        });
        let exhausted = match direction {
            SearchDirection::Next => t0 > end,
            SearchDirection::Previous => t0 < end,
        };
        Self {
            direction,
            cursor: (!exhausted).then_some(t0),
            end,
            gap,
            resume_id,
        }
    }
}

impl Iterator for IntervalGenerator {
    type Item = SearchInterval;

    fn next(&mut self) -> Option<Self::Item> {
        let cursor = self.cursor?;
        let (from, to) = match self.direction {
            SearchDirection::Next => {
                let to = day_end(cursor).min(self.end);
                // Advance past the emitted day; saturate at the sentinel so
                // open-ended scans terminate instead of overflowing.
                self.cursor = if to >= self.end {
                    None
                } else {
                    Some(to + Duration::nanoseconds(1))
                };
                (cursor, to)
            }
            SearchDirection::Previous => {
                let from = day_start(cursor).max(self.end);
                self.cursor = if from <= self.end {
                    None
                } else {
                    Some(from - Duration::nanoseconds(1))
                };
                (from, cursor)
            }
        };
        let query_from = day_start(from).max(from - self.gap);
        Some(SearchInterval {
            from,
            to,
            query_from,
            resume_id: self.resume_id.take(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, minute, 0).unwrap()
    }

    fn gen(
        direction: SearchDirection,
        t0: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<SearchInterval> {
        IntervalGenerator::new(direction, t0, end, Duration::minutes(1), None).collect()
    }

    #[test]
    fn same_day_range_yields_one_window() {
        let intervals = gen(SearchDirection::Next, at(5, 10, 0), Some(at(5, 12, 0)));
        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0].from, at(5, 10, 0));
        assert_eq!(intervals[0].to, at(5, 12, 0));
    }

    #[test]
    fn midnight_is_a_split_point() {
        let intervals = gen(SearchDirection::Next, at(5, 23, 0), Some(at(6, 1, 0)));
        assert_eq!(intervals.len(), 2);
        assert_eq!(intervals[0].from, at(5, 23, 0));
        assert_eq!(intervals[0].to, day_end(at(5, 23, 0)));
        assert_eq!(intervals[1].from, at(6, 0, 0));
        assert_eq!(intervals[1].to, at(6, 1, 0));
    }

    #[test]
    fn backward_scan_walks_days_in_reverse() {
        let intervals = gen(SearchDirection::Previous, at(6, 1, 0), Some(at(5, 23, 0)));
        assert_eq!(intervals.len(), 2);
        assert_eq!(intervals[0].from, at(6, 0, 0));
        assert_eq!(intervals[0].to, at(6, 1, 0));
        assert_eq!(intervals[1].from, at(5, 23, 0));
        assert_eq!(intervals[1].to, day_end(at(5, 23, 0)));
    }

    #[test]
    fn gap_widens_only_within_the_day() {
        let mid_day = gen(SearchDirection::Next, at(5, 10, 0), Some(at(5, 11, 0)));
        assert_eq!(mid_day[0].query_from, at(5, 9, 59));

        let at_midnight = gen(SearchDirection::Next, at(5, 0, 0), Some(at(5, 1, 0)));
        assert_eq!(at_midnight[0].query_from, at(5, 0, 0));
    }

    #[test]
    fn resume_id_rides_the_first_window_only() {
        let intervals: Vec<_> = IntervalGenerator::new(
            SearchDirection::Next,
            at(5, 23, 0),
            Some(at(6, 1, 0)),
            Duration::zero(),
            Some(ProviderEventId::single("e-9")),
        )
        .collect();
        assert!(intervals[0].resume_id.is_some());
        assert!(intervals[1].resume_id.is_none());
    }

    #[test]
    fn inverted_range_yields_nothing() {
        assert!(gen(SearchDirection::Next, at(6, 0, 0), Some(at(5, 0, 0))).is_empty());
        assert!(gen(SearchDirection::Previous, at(5, 0, 0), Some(at(6, 0, 0))).is_empty());
    }
}
