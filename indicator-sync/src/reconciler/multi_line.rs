use data_feed::{SeriesValues, SignalSeries, UpdatePayload};

use super::series::{Axis, SeriesGroup};
use super::{Reconciler, UpdateContext, UpdateMode, UpdateOutcome};
use crate::config::EngineConfig;
use crate::surface::RenderSurface;
use crate::{IndicatorDescriptor, SyncError};

/// MACD-style composite: main, signal and histogram nested under one shared
/// `signals.index` axis.
#[derive(Debug)]
pub struct MultiLineReconciler {
    group: SeriesGroup,
}

impl MultiLineReconciler {
    pub fn new(descriptor: IndicatorDescriptor, config: &EngineConfig) -> Self {
        Self {
            group: SeriesGroup::new(descriptor, config),
        }
    }
}

fn series(signals: Option<&SignalSeries>) -> [Option<&SeriesValues>; 3] {
    match signals {
        Some(s) => [s.macd.as_ref(), s.signal.as_ref(), s.histogram.as_ref()],
        None => [None; 3],
    }
}

impl Reconciler for MultiLineReconciler {
    fn group(&self) -> &SeriesGroup {
        &self.group
    }

    fn group_mut(&mut self) -> &mut SeriesGroup {
        &mut self.group
    }

    fn update_data(
        &mut self,
        payload: &UpdatePayload,
        ctx: &UpdateContext<'_>,
        surface: &mut dyn RenderSurface,
    ) -> Result<UpdateOutcome, SyncError> {
        let id = self.group.id();
        let signals = payload.metadata.signals.as_ref();
        match ctx.mode(id, payload)? {
            UpdateMode::Snapshot => {
                let axis_times = signals
                    .and_then(|s| s.index.as_deref())
                    .filter(|t| !t.is_empty())
                    .or(payload.timestamps.as_deref());
                let axis = Axis::pick(axis_times, ctx).ok_or_else(|| {
                    SyncError::malformed(id, "composite snapshot without an index")
                })?;
                let [macd, signal, histogram] = series(signals);
                // Root-level values stand in for a missing main series.
                let macd = macd.and_then(SeriesValues::as_array).or(payload.values.as_deref());
                let batches = [
                    macd,
                    signal.and_then(SeriesValues::as_array),
                    histogram.and_then(SeriesValues::as_array),
                ]
                .map(|values| values.map(|v| axis.align(v)).unwrap_or_default());
                self.group.absorb_snapshot(&batches, surface)
            }
            mode => {
                let Some(time) = self.group.tick_time(mode, payload, ctx)? else {
                    return Ok(UpdateOutcome::Ignored);
                };
                let [macd, signal, histogram] =
                    series(signals).map(|s| s.and_then(SeriesValues::latest));
                let values = [macd.or(payload.value), signal, histogram];
                self.group.apply_tick(time, &values, surface)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{RecordingSurface, SurfaceOp};
    use crate::{HistogramShade, IndicatorId, IndicatorKind};

    fn payload(json: &str) -> UpdatePayload {
        serde_json::from_str(json).unwrap()
    }

    fn attached(surface: &mut RecordingSurface) -> MultiLineReconciler {
        let desc = IndicatorDescriptor {
            id: IndicatorId::new("macd"),
            display_name: "MACD".into(),
            kind: IndicatorKind::MultiLine,
            overlay: false,
            axis_group: "macd".into(),
            color: "#4ade80".into(),
            visible: true,
        };
        let mut rec = MultiLineReconciler::new(desc, &EngineConfig::default());
        rec.attach(surface);
        rec
    }

    #[test]
    fn sub_series_share_the_signals_index() {
        let mut surface = RecordingSurface::new();
        let mut rec = attached(&mut surface);
        rec.update_data(
            &payload(
                r#"{"timestamps":[1,2],"metadata":{"signals":{
                    "index":[60,120,180,240],
                    "macd":[0.1,0.3,0.2,-0.1],
                    "signal":[0.15,0.1],
                    "histogram":[0.1,0.05,-0.2]}}}"#,
            ),
            &UpdateContext::default(),
            &mut surface,
        )
        .unwrap();
        assert_eq!(surface.values("macd", "macd").len(), 4);
        assert_eq!(surface.values("macd", "signal"), vec![(180, 0.15), (240, 0.1)]);
        assert_eq!(
            surface.values("macd", "histogram"),
            vec![(120, 0.1), (180, 0.05), (240, -0.2)]
        );
        let colors: Vec<_> = surface
            .points("macd", "histogram")
            .unwrap()
            .iter()
            .map(|p| p.color.clone().unwrap())
            .collect();
        assert_eq!(
            colors,
            vec![
                HistogramShade::StrongUp.color(),
                HistogramShade::WeakUp.color(),
                HistogramShade::StrongDown.color()
            ]
        );
    }

    #[test]
    fn live_tick_updates_each_series_incrementally() {
        let mut surface = RecordingSurface::new();
        let mut rec = attached(&mut surface);
        let ctx = UpdateContext::default();
        rec.update_data(
            &payload(
                r#"{"metadata":{"signals":{
                    "index":[60,120],"macd":[1,2],"signal":[1,1.5],"histogram":[0,0.5]}}}"#,
            ),
            &ctx,
            &mut surface,
        )
        .unwrap();
        surface.take_ops();
        rec.update_data(
            &payload(
                r#"{"live_time":180,
                    "metadata":{"signals":{"macd":2.2,"signal":1.7,"histogram":0.5}}}"#,
            ),
            &ctx,
            &mut surface,
        )
        .unwrap();
        let ops = surface.take_ops();
        assert_eq!(ops.len(), 3);
        assert!(ops.iter().all(|op| matches!(op, SurfaceOp::Update { .. })));
        assert_eq!(rec.points("histogram").map(<[_]>::len), Some(3));
    }

    #[test]
    fn missing_index_falls_back_to_candle_axis() {
        let mut surface = RecordingSurface::new();
        let mut rec = attached(&mut surface);
        let axis = [60, 120, 180];
        rec.update_data(
            &payload(r#"{"metadata":{"signals":{"macd":[1,2],"signal":[1],"histogram":[0.5]}}}"#),
            &UpdateContext::snapshot(&axis),
            &mut surface,
        )
        .unwrap();
        assert_eq!(surface.values("macd", "macd"), vec![(120, 1.0), (180, 2.0)]);
        assert_eq!(surface.values("macd", "signal"), vec![(180, 1.0)]);
    }
}
