use tracing::debug;

use data_feed::UpdatePayload;
use ts_core::{align, CacheDelta, RawTime, TimePoint, TimeValueCache, Timestamp};

use super::{ReconcilerPhase, UpdateContext, UpdateMode, UpdateOutcome};
use crate::config::EngineConfig;
use crate::style::{shade_for, SeriesStyle};
use crate::surface::{PlotPoint, RenderSurface, SeriesKey};
use crate::{IndicatorDescriptor, IndicatorId, IndicatorKind, SyncError};

/// Time axis a snapshot's arrays are aligned against.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Axis<'a> {
    Raw(&'a [RawTime]),
    Candles(&'a [Timestamp]),
}

impl<'a> Axis<'a> {
    /// The payload's own axis if non-empty, else the candle axis.
    pub fn pick(primary: Option<&'a [RawTime]>, ctx: &UpdateContext<'a>) -> Option<Self> {
        match primary {
            Some(times) if !times.is_empty() => Some(Axis::Raw(times)),
            _ if !ctx.candle_axis.is_empty() => Some(Axis::Candles(ctx.candle_axis)),
            _ => None,
        }
    }

    pub fn align(&self, values: &[Option<f64>]) -> Vec<TimePoint> {
        match *self {
            Axis::Raw(times) => align(values, times),
            Axis::Candles(times) => align(values, times),
        }
    }

    pub fn time_at(&self, index: usize) -> Option<Timestamp> {
        match *self {
            Axis::Raw(times) => times.get(index).and_then(RawTime::resolve),
            Axis::Candles(times) => times.get(index).copied(),
        }
    }
}

/// One output line: its cache and its key on the surface.
#[derive(Debug)]
pub(crate) struct LineSeries {
    key: SeriesKey,
    cache: TimeValueCache,
    histogram: bool,
}

impl LineSeries {
    fn plot_all(&self) -> Vec<PlotPoint> {
        let mut prev = None;
        self.cache
            .as_slice()
            .iter()
            .map(|p| {
                let point = self.plot(prev, *p);
                prev = Some(p.value);
                point
            })
            .collect()
    }

    fn plot(&self, prev: Option<f64>, p: TimePoint) -> PlotPoint {
        let mut point = PlotPoint::new(p.time, p.value);
        if self.histogram {
            point.color = Some(shade_for(prev, p.value).color().to_string());
        }
        point
    }

    fn publish(&self, delta: CacheDelta, surface: &mut dyn RenderSurface) {
        match delta {
            CacheDelta::Unchanged => {}
            CacheDelta::Tail(p) => {
                let points = self.cache.as_slice();
                let prev = points.len().checked_sub(2).map(|i| points[i].value);
                surface.update(&self.key, self.plot(prev, p));
            }
            CacheDelta::Full => surface.set_data(&self.key, &self.plot_all()),
        }
    }
}

/// State every reconciler shares: descriptor, lifecycle phase and one cache
/// per output line.
#[derive(Debug)]
pub struct SeriesGroup {
    descriptor: IndicatorDescriptor,
    phase: ReconcilerPhase,
    lines: Vec<LineSeries>,
}

impl SeriesGroup {
    pub fn new(descriptor: IndicatorDescriptor, config: &EngineConfig) -> Self {
        let kind = descriptor.kind;
        let lines = kind
            .line_names()
            .iter()
            .map(|&name| LineSeries {
                key: SeriesKey::new(descriptor.id.clone(), name),
                cache: config.cache(),
                histogram: kind == IndicatorKind::MultiLine && name == "histogram",
            })
            .collect();
        Self {
            descriptor,
            phase: ReconcilerPhase::Uninitialized,
            lines,
        }
    }

    pub fn descriptor(&self) -> &IndicatorDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> &IndicatorId {
        &self.descriptor.id
    }

    pub fn phase(&self) -> ReconcilerPhase {
        self.phase
    }

    pub fn is_visible(&self) -> bool {
        self.descriptor.visible
    }

    pub fn keys(&self) -> impl Iterator<Item = &SeriesKey> {
        self.lines.iter().map(|l| &l.key)
    }

    /// Key of the kind's primary line.
    pub fn primary_key(&self) -> Option<&SeriesKey> {
        let primary = self.descriptor.kind.primary_line();
        self.keys().find(|k| k.line == primary)
    }

    pub fn points(&self, line: &str) -> Option<&[TimePoint]> {
        self.lines
            .iter()
            .find(|l| l.key.line == line)
            .map(|l| l.cache.as_slice())
    }

    pub fn attach(&mut self, surface: &mut dyn RenderSurface) {
        for line in &self.lines {
            surface.add_series(&line.key, &SeriesStyle::for_line(&self.descriptor, line.key.line));
            if !self.descriptor.visible {
                surface.set_visible(&line.key, false);
            }
        }
        self.phase = ReconcilerPhase::AwaitingSnapshot;
    }

    pub fn detach(&mut self, surface: &mut dyn RenderSurface) {
        for line in &mut self.lines {
            surface.remove_series(&line.key);
            line.cache.clear();
        }
        self.phase = ReconcilerPhase::Uninitialized;
    }

    /// Returns true when the flag actually changed.
    pub fn set_visible(&mut self, visible: bool, surface: &mut dyn RenderSurface) -> bool {
        if self.descriptor.visible == visible {
            return false;
        }
        self.descriptor.visible = visible;
        for line in &self.lines {
            surface.set_visible(&line.key, visible);
        }
        true
    }

    pub fn publish_all(&self, surface: &mut dyn RenderSurface) {
        if !self.descriptor.visible {
            return;
        }
        for line in &self.lines {
            surface.set_data(&line.key, &line.plot_all());
        }
    }

    /// Merge one batch per line (in `line_names` order) into the caches.
    pub fn absorb_snapshot(
        &mut self,
        batches: &[Vec<TimePoint>],
        surface: &mut dyn RenderSurface,
    ) -> Result<UpdateOutcome, SyncError> {
        let points: usize = batches.iter().map(Vec::len).sum();
        if points == 0 {
            return Err(SyncError::malformed(
                self.id(),
                "snapshot produced no aligned points",
            ));
        }
        let visible = self.descriptor.visible;
        for (line, batch) in self.lines.iter_mut().zip(batches) {
            let delta = line.cache.merge_points(batch);
            if visible {
                line.publish(delta, surface);
            }
        }
        self.mark_synced();
        Ok(UpdateOutcome::Snapshot { points })
    }

    /// Upsert one value per line (in `line_names` order) at `time`.
    pub fn apply_tick(
        &mut self,
        time: Timestamp,
        values: &[Option<f64>],
        surface: &mut dyn RenderSurface,
    ) -> Result<UpdateOutcome, SyncError> {
        if !values.iter().flatten().any(|v| v.is_finite()) {
            return Err(SyncError::malformed(
                self.id(),
                "live payload carries no finite value",
            ));
        }
        let visible = self.descriptor.visible;
        for (line, value) in self.lines.iter_mut().zip(values) {
            let Some(value) = value.filter(|v| v.is_finite()) else {
                continue;
            };
            let delta = line.cache.upsert(time, value);
            if visible {
                line.publish(delta, surface);
            }
        }
        Ok(UpdateOutcome::Tick { time })
    }

    /// Resolve the time for a live or close payload, or `None` when the
    /// payload must be ignored because no snapshot has landed yet.
    pub fn tick_time(
        &self,
        mode: UpdateMode,
        payload: &UpdatePayload,
        ctx: &UpdateContext<'_>,
    ) -> Result<Option<Timestamp>, SyncError> {
        if self.phase != ReconcilerPhase::Synced {
            debug!(indicator = %self.id(), ?mode, "tick before first snapshot ignored");
            return Ok(None);
        }
        ctx.live_time(payload)
            .map(Some)
            .ok_or_else(|| SyncError::malformed(self.id(), "live value without a time"))
    }

    pub fn mark_synced(&mut self) {
        if self.phase != ReconcilerPhase::Synced {
            debug!(indicator = %self.id(), "first snapshot absorbed");
            self.phase = ReconcilerPhase::Synced;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{RecordingSurface, SurfaceOp};

    fn group(kind: IndicatorKind, visible: bool) -> SeriesGroup {
        let desc = IndicatorDescriptor {
            id: IndicatorId::new("g"),
            display_name: "g".into(),
            kind,
            overlay: false,
            axis_group: "g".into(),
            color: "#fff".into(),
            visible,
        };
        SeriesGroup::new(desc, &EngineConfig::default())
    }

    #[test]
    fn hidden_group_caches_without_pushing() {
        let mut surface = RecordingSurface::new();
        let mut g = group(IndicatorKind::Line, false);
        g.attach(&mut surface);
        surface.take_ops();
        g.absorb_snapshot(&[vec![TimePoint::new(60, 1.0)]], &mut surface)
            .unwrap();
        g.apply_tick(120, &[Some(2.0)], &mut surface).unwrap();
        assert!(surface.ops().is_empty());
        assert_eq!(g.points("main").map(<[_]>::len), Some(2));
        assert_eq!(g.phase(), ReconcilerPhase::Synced);
    }

    #[test]
    fn empty_snapshot_keeps_phase() {
        let mut surface = RecordingSurface::new();
        let mut g = group(IndicatorKind::Line, true);
        g.attach(&mut surface);
        assert!(g.absorb_snapshot(&[Vec::new()], &mut surface).is_err());
        assert_eq!(g.phase(), ReconcilerPhase::AwaitingSnapshot);
    }

    #[test]
    fn histogram_tail_is_colored_against_previous_bar() {
        let mut surface = RecordingSurface::new();
        let mut g = group(IndicatorKind::MultiLine, true);
        g.attach(&mut surface);
        g.absorb_snapshot(
            &[vec![], vec![], vec![TimePoint::new(60, 1.0), TimePoint::new(120, 2.0)]],
            &mut surface,
        )
        .unwrap();
        surface.take_ops();
        g.apply_tick(180, &[None, None, Some(1.5)], &mut surface).unwrap();
        let ops = surface.take_ops();
        let [SurfaceOp::Update { point, .. }] = ops.as_slice() else {
            panic!("expected one update, got {ops:?}");
        };
        assert_eq!(point.color.as_deref(), Some(crate::HistogramShade::WeakUp.color()));
    }
}
