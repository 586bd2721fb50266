#![forbid(unsafe_code)]

use std::cmp::Ordering;

use vgo_kernel_contracts::event::EventRecord;
use vgo_kernel_contracts::transcript::{ExcludedEvent, ExclusionReason};
use vgo_kernel_contracts::LogicalTime;

/// Fold v1 comparator: `(bucket_id, partition_id, event_id)`.
///
/// `event_id` is unique, so this is a total order and the result of sorting
/// never depends on the input permutation.
pub fn canonical_cmp(a: &EventRecord, b: &EventRecord) -> Ordering {
    a.bucket_id
        .cmp(&b.bucket_id)
        .then_with(|| a.partition_id.cmp(&b.partition_id))
        .then_with(|| a.event_id.cmp(&b.event_id))
}

pub fn is_canonically_ordered(events: &[EventRecord]) -> bool {
    events
        .windows(2)
        .all(|w| canonical_cmp(&w[0], &w[1]) == Ordering::Less)
}

/// Aggregation entry points call this before folding.
pub fn assert_canonical_order(events: &[EventRecord]) {
    debug_assert!(
        is_canonically_ordered(events),
        "events reached aggregation out of canonical order"
    );
}

pub fn order_events(events: &[EventRecord]) -> Vec<EventRecord> {
    let mut ordered = events.to_vec();
    ordered.sort_by(canonical_cmp);
    ordered
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub included: Vec<EventRecord>,
    pub excluded: Vec<ExcludedEvent>,
}

/// Splits events into the window's range `[opens_at - grace, watermark + grace)`
/// and everything else. Included events come back in canonical order.
pub fn filter_membership(
    events: &[EventRecord],
    opens_at: LogicalTime,
    watermark: LogicalTime,
    late_grace_ticks: u64,
) -> Membership {
    let lower = opens_at.0.saturating_sub(late_grace_ticks);
    let upper = watermark.0.saturating_add(late_grace_ticks);
    let (included, outside): (Vec<_>, Vec<_>) = events
        .iter()
        .cloned()
        .partition(|ev| ev.occurred_at.0 >= lower && ev.occurred_at.0 < upper);
    let mut excluded = outside
        .into_iter()
        .map(|ev| ExcludedEvent {
            event_id: ev.event_id,
            reason: ExclusionReason::OutOfWindow,
        })
        .collect::<Vec<_>>();
    excluded.sort_by(|a, b| a.event_id.cmp(&b.event_id));
    Membership {
        included: order_events(&included),
        excluded,
    }
}
