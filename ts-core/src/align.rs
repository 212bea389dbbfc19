//! Offset alignment: pairing a (possibly warm-up truncated) value array with
//! the tail of a longer time axis.

use tracing::warn;

use crate::{RawTime, TimePoint, Timestamp};

/// Anything that can sit on a time axis.
pub trait AxisTime {
    /// `None` marks the slot as invalid (unparsable or the epoch-zero sentinel).
    fn resolve_time(&self) -> Option<Timestamp>;
}

impl AxisTime for Timestamp {
    fn resolve_time(&self) -> Option<Timestamp> {
        (*self != 0).then_some(*self)
    }
}

impl AxisTime for RawTime {
    fn resolve_time(&self) -> Option<Timestamp> {
        self.resolve()
    }
}

/// Index shift so that the last `values_len` times pair with the values.
pub fn alignment_offset(values_len: usize, times_len: usize) -> usize {
    times_len.saturating_sub(values_len)
}

/// Pair `values` with the tail of `times`.
///
/// Null and non-finite values are skipped, as are slots whose time does not
/// resolve. Values that would read past the end of `times` are dropped with a
/// warning. The result is strictly increasing in time; on a repeated time the
/// later value wins.
pub fn align<T: AxisTime>(values: &[Option<f64>], times: &[T]) -> Vec<TimePoint> {
    let offset = alignment_offset(values.len(), times.len());
    let mut out = Vec::with_capacity(values.len());

    for (i, value) in values.iter().enumerate() {
        let Some(value) = value.filter(|v| v.is_finite()) else {
            continue;
        };
        let Some(slot) = times.get(i + offset) else {
            warn!(
                index = i,
                offset,
                times = times.len(),
                dropped = values.len() - i,
                "value index overflows time axis"
            );
            break;
        };
        if let Some(time) = slot.resolve_time() {
            out.push(TimePoint { time, value });
        }
    }

    sort_dedup(&mut out);
    out
}

/// Stable sort by time, keeping the last point of each run of equal times.
pub(crate) fn sort_dedup(points: &mut Vec<TimePoint>) {
    points.sort_by_key(|p| p.time);
    let mut write = 0usize;
    for read in 0..points.len() {
        if write > 0 && points[write - 1].time == points[read].time {
            points[write - 1] = points[read];
        } else {
            points[write] = points[read];
            write += 1;
        }
    }
    points.truncate(write);
}
