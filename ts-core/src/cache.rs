use std::collections::BTreeMap;

use crate::{TimePoint, Timestamp};

/// Merge `incoming` into `existing`. Incoming wins on equal time; the result is
/// strictly increasing in time.
pub fn merge(existing: &[TimePoint], incoming: &[TimePoint]) -> Vec<TimePoint> {
    let mut by_time: BTreeMap<Timestamp, f64> =
        existing.iter().map(|p| (p.time, p.value)).collect();
    for p in incoming {
        by_time.insert(p.time, p.value);
    }
    by_time
        .into_iter()
        .map(|(time, value)| TimePoint { time, value })
        .collect()
}

/// What a cache mutation means for whoever mirrors the cache.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CacheDelta {
    Unchanged,
    /// Only the trailing point was appended or overwritten.
    Tail(TimePoint),
    /// Anything else; mirrors must take the whole series again.
    Full,
}

/// Ordered, deduplicated, bounded `(time, value)` sequence for one output line.
#[derive(Debug, Clone)]
pub struct TimeValueCache {
    points: Vec<TimePoint>,
    max_points: usize,
    tolerance: Timestamp,
}

impl TimeValueCache {
    pub fn new(max_points: usize) -> Self {
        Self {
            points: Vec::new(),
            max_points: max_points.max(1),
            tolerance: 0,
        }
    }

    /// Live ticks within `tolerance` seconds of an existing point overwrite it.
    pub fn with_tolerance(mut self, tolerance: Timestamp) -> Self {
        self.tolerance = tolerance.max(0);
        self
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first(&self) -> Option<&TimePoint> {
        self.points.first()
    }

    pub fn last(&self) -> Option<&TimePoint> {
        self.points.last()
    }

    pub fn as_slice(&self) -> &[TimePoint] {
        &self.points
    }

    pub fn max_points(&self) -> usize {
        self.max_points
    }

    pub fn get(&self, time: Timestamp) -> Option<f64> {
        self.points
            .binary_search_by_key(&time, |p| p.time)
            .ok()
            .map(|idx| self.points[idx].value)
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Merge a batch of points (typically an aligned snapshot).
    pub fn merge_points(&mut self, incoming: &[TimePoint]) -> CacheDelta {
        if incoming.is_empty() {
            return CacheDelta::Unchanged;
        }
        if let [point] = incoming {
            if self.last().is_some_and(|last| point.time >= last.time) {
                return self.put_trailing(*point);
            }
        }

        let mut merged = merge(&self.points, incoming);
        trim_front(&mut merged, self.max_points);
        let delta = tail_delta(&self.points, &merged);
        self.points = merged;
        delta
    }

    /// Apply a live single-point update.
    pub fn upsert(&mut self, time: Timestamp, value: f64) -> CacheDelta {
        let last_idx = match self.points.len() {
            0 => {
                self.points.push(TimePoint { time, value });
                return CacheDelta::Full;
            }
            n => n - 1,
        };

        if let Some(idx) = self.find_near(time) {
            if self.points[idx].value == value {
                return CacheDelta::Unchanged;
            }
            self.points[idx].value = value;
            return if idx == last_idx {
                CacheDelta::Tail(self.points[idx])
            } else {
                CacheDelta::Full
            };
        }

        if time > self.points[last_idx].time {
            return self.put_trailing(TimePoint { time, value });
        }

        let at = self.points.partition_point(|p| p.time < time);
        self.points.insert(at, TimePoint { time, value });
        trim_front(&mut self.points, self.max_points);
        CacheDelta::Full
    }

    fn put_trailing(&mut self, point: TimePoint) -> CacheDelta {
        match self.points.last_mut() {
            Some(last) if last.time == point.time => {
                if last.value == point.value {
                    return CacheDelta::Unchanged;
                }
                last.value = point.value;
            }
            _ => {
                self.points.push(point);
                trim_front(&mut self.points, self.max_points);
            }
        }
        CacheDelta::Tail(point)
    }

    /// Index of the newest point within the tolerance window of `time`.
    fn find_near(&self, time: Timestamp) -> Option<usize> {
        for (idx, p) in self.points.iter().enumerate().rev() {
            if (p.time - time).abs() <= self.tolerance {
                return Some(idx);
            }
            if p.time < time - self.tolerance {
                break;
            }
        }
        None
    }
}

/// Classify the change from `old` to `new`: a single trailing append or
/// overwrite (possibly with one point trimmed off the front) is a `Tail`.
fn tail_delta(old: &[TimePoint], new: &[TimePoint]) -> CacheDelta {
    if old == new {
        return CacheDelta::Unchanged;
    }
    let (Some((last, head)), Some((_, old_head))) = (new.split_last(), old.split_last()) else {
        return CacheDelta::Full;
    };
    let appended = head == old || head == &old[1..];
    let overwritten = head == old_head;
    if appended || overwritten {
        CacheDelta::Tail(*last)
    } else {
        CacheDelta::Full
    }
}

fn trim_front(points: &mut Vec<TimePoint>, max_points: usize) {
    if points.len() > max_points {
        let excess = points.len() - max_points;
        points.drain(..excess);
    }
}
