use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use serde::Serialize;

use crate::domain::BackupEvent;

/// A grid outage interval to shade on the power chart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OutageSpan {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

/// Outages that started after `midnight`, plus the one still in progress
pub fn outage_spans<Tz: TimeZone>(
    events: &[BackupEvent],
    ongoing_since: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    midnight: &DateTime<Tz>,
) -> Vec<OutageSpan> {
    let midnight = midnight.fixed_offset();
    let mut spans: Vec<OutageSpan> = events
        .iter()
        .filter(|e| e.timestamp > midnight)
        .map(|e| OutageSpan {
            start: e.timestamp,
            end: e.timestamp + Duration::milliseconds(e.duration),
        })
        .collect();
    if let Some(start) = ongoing_since {
        spans.push(OutageSpan {
            start: start.fixed_offset(),
            end: now.fixed_offset(),
        });
    }
    spans
}
