//! Heartbeat merge decision, shared verbatim by the server store and the
//! client-side pre-merge buffer so both always reach the same outcome.

use chrono::Duration;

use crate::{
    error::{PulseError, Result},
    model::Event,
};

/// Reject pulsetimes that can never describe a gap.
pub fn check_pulsetime(pulsetime: f64) -> Result<()> {
    if !pulsetime.is_finite() || pulsetime < 0.0 {
        return Err(PulseError::InvalidInput(format!(
            "pulsetime must be a non-negative number of seconds, got {pulsetime}"
        )));
    }
    Ok(())
}

/// Whether `incoming` extends `last` instead of starting a new event.
///
/// Merging requires structurally equal data, no backward movement in
/// time, and a gap between `last`'s window end and `incoming` of at most
/// `pulsetime` seconds. The boundary uses `<=` so a retried delivery of
/// the same timestamp is idempotent. The decision only ever consults the
/// single most recent event; out-of-timestamp-order streams therefore do
/// not merge.
pub fn extends(last: &Event, incoming: &Event, pulsetime: f64) -> bool {
    if last.data != incoming.data {
        return false;
    }
    if incoming.timestamp < last.timestamp {
        return false;
    }
    gap_seconds(incoming.timestamp - last.end()) <= pulsetime
}

/// The duration `last` takes on when `incoming` merges into it.
pub fn extended_duration(last: &Event, incoming: &Event) -> Duration {
    incoming.timestamp - last.timestamp
}

fn gap_seconds(gap: Duration) -> f64 {
    gap.num_milliseconds() as f64 / 1000.0
}
