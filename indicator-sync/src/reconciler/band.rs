use data_feed::{SeriesValues, UpdatePayload};
use ts_core::{align, Timestamp};

use super::series::{Axis, SeriesGroup};
use super::{Reconciler, UpdateContext, UpdateMode, UpdateOutcome};
use crate::config::EngineConfig;
use crate::surface::RenderSurface;
use crate::{IndicatorDescriptor, SyncError};

/// Combine a cached band array with a newer one.
///
/// A shorter incoming array replaces the cached tail (the server resent only
/// its most recent window); a longer one contributes only the suffix beyond
/// what is cached.
pub fn merge_band_values(cached: &[Option<f64>], incoming: &[Option<f64>]) -> Vec<Option<f64>> {
    if incoming.len() <= cached.len() {
        let keep = cached.len() - incoming.len();
        cached[..keep].iter().chain(incoming).copied().collect()
    } else {
        cached.iter().chain(&incoming[cached.len()..]).copied().collect()
    }
}

/// The three band arrays as last received, each aligned to the tail of its
/// time axis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BandMetadata {
    pub upper: Vec<Option<f64>>,
    pub middle: Vec<Option<f64>>,
    pub lower: Vec<Option<f64>>,
}

impl BandMetadata {
    /// Band arrays carried by a payload; `values` stands in for a missing middle.
    pub fn from_payload(payload: &UpdatePayload) -> Self {
        let meta = &payload.metadata;
        let array = |series: &Option<SeriesValues>| {
            series
                .as_ref()
                .and_then(SeriesValues::as_array)
                .map(<[_]>::to_vec)
                .unwrap_or_default()
        };
        let middle = match array(&meta.middle_band) {
            m if m.is_empty() => payload.values.clone().unwrap_or_default(),
            m => m,
        };
        Self {
            upper: array(&meta.upper_band),
            middle,
            lower: array(&meta.lower_band),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.upper.is_empty() && self.middle.is_empty() && self.lower.is_empty()
    }

    /// Apply [`merge_band_values`] per array and keep at most `max_len`
    /// trailing entries.
    pub fn merged(&self, incoming: &BandMetadata, max_len: usize) -> BandMetadata {
        let combine = |cached: &[Option<f64>], new: &[Option<f64>]| {
            let mut out = merge_band_values(cached, new);
            if out.len() > max_len {
                out.drain(..out.len() - max_len);
            }
            out
        };
        BandMetadata {
            upper: combine(&self.upper, &incoming.upper),
            middle: combine(&self.middle, &incoming.middle),
            lower: combine(&self.lower, &incoming.lower),
        }
    }

    /// Arrays in line order: upper, middle, lower.
    fn lines(&self) -> [&[Option<f64>]; 3] {
        [&self.upper, &self.middle, &self.lower]
    }
}

/// Bollinger-style envelope: three lines on one time axis.
#[derive(Debug)]
pub struct BandReconciler {
    group: SeriesGroup,
    metadata: BandMetadata,
    max_points: usize,
}

impl BandReconciler {
    pub fn new(descriptor: IndicatorDescriptor, config: &EngineConfig) -> Self {
        Self {
            group: SeriesGroup::new(descriptor, config),
            metadata: BandMetadata::default(),
            max_points: config.max_points,
        }
    }

    pub fn metadata(&self) -> &BandMetadata {
        &self.metadata
    }

    fn absorb(
        &mut self,
        payload: &UpdatePayload,
        ctx: &UpdateContext<'_>,
        surface: &mut dyn RenderSurface,
    ) -> Result<UpdateOutcome, SyncError> {
        let id = self.group.id();
        let incoming = BandMetadata::from_payload(payload);
        if incoming.is_empty() {
            return Err(SyncError::malformed(id, "band snapshot without band arrays"));
        }
        let merged = self.metadata.merged(&incoming, self.max_points);

        // With its own axis the incoming window is timed exactly; otherwise the
        // merged arrays are laid onto the tail of the candle axis.
        let batches = match payload.timestamps.as_deref() {
            Some(times) if !times.is_empty() => {
                let axis = Axis::Raw(times);
                incoming.lines().map(|values| axis.align(values))
            }
            _ if !ctx.candle_axis.is_empty() => {
                let times: &[Timestamp] = ctx.candle_axis;
                merged.lines().map(|values| align(values, times))
            }
            _ => return Err(SyncError::malformed(id, "band snapshot without a time axis")),
        };

        let outcome = self.group.absorb_snapshot(&batches, surface)?;
        self.metadata = merged;
        Ok(outcome)
    }
}

impl Reconciler for BandReconciler {
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
        match ctx.mode(self.group.id(), payload)? {
            UpdateMode::Snapshot => self.absorb(payload, ctx, surface),
            mode => {
                let Some(time) = self.group.tick_time(mode, payload, ctx)? else {
                    return Ok(UpdateOutcome::Ignored);
                };
                let meta = &payload.metadata;
                let latest = |s: &Option<SeriesValues>| s.as_ref().and_then(SeriesValues::latest);
                let values = [
                    latest(&meta.upper_band),
                    latest(&meta.middle_band).or(payload.value),
                    latest(&meta.lower_band),
                ];
                self.group.apply_tick(time, &values, surface)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::RecordingSurface;
    use crate::{IndicatorId, IndicatorKind};

    fn some(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().copied().map(Some).collect()
    }

    fn payload(json: &str) -> UpdatePayload {
        serde_json::from_str(json).unwrap()
    }

    fn attached(surface: &mut RecordingSurface) -> BandReconciler {
        let desc = IndicatorDescriptor {
            id: IndicatorId::new("bb"),
            display_name: "Bollinger".into(),
            kind: IndicatorKind::Band,
            overlay: true,
            axis_group: "price".into(),
            color: "#60a5fa".into(),
            visible: true,
        };
        let mut rec = BandReconciler::new(desc, &EngineConfig::default());
        rec.attach(surface);
        rec
    }

    #[test]
    fn shorter_array_replaces_tail() {
        let merged = merge_band_values(&some(&[1.0, 2.0, 3.0, 4.0]), &some(&[30.0, 40.0]));
        assert_eq!(merged, some(&[1.0, 2.0, 30.0, 40.0]));
    }

    #[test]
    fn longer_array_appends_suffix() {
        let merged = merge_band_values(&some(&[1.0, 2.0]), &some(&[9.0, 9.0, 3.0, 4.0]));
        assert_eq!(merged, some(&[1.0, 2.0, 3.0, 4.0]));
        assert_eq!(merge_band_values(&[], &some(&[5.0])), some(&[5.0]));
        assert_eq!(merge_band_values(&some(&[5.0]), &[]), some(&[5.0]));
    }

    #[test]
    fn merged_metadata_is_capped() {
        let cached = BandMetadata {
            upper: some(&[1.0, 2.0, 3.0]),
            ..BandMetadata::default()
        };
        let incoming = BandMetadata {
            upper: some(&[1.0, 2.0, 3.0, 4.0, 5.0]),
            ..BandMetadata::default()
        };
        let merged = cached.merged(&incoming, 4);
        assert_eq!(merged.upper, some(&[2.0, 3.0, 4.0, 5.0]));
        assert!(merged.lower.is_empty());
        // The inputs are untouched.
        assert_eq!(cached.upper.len(), 3);
    }

    #[test]
    fn timed_window_merges_by_time() {
        let mut surface = RecordingSurface::new();
        let mut rec = attached(&mut surface);
        let ctx = UpdateContext::default();
        rec.update_data(
            &payload(
                r#"{"timestamps":[60,120,180,240],"metadata":{
                    "upper_band":[11,12,13,14],
                    "middle_band":[10,10,10,10],
                    "lower_band":[9,8,7,6]}}"#,
            ),
            &ctx,
            &mut surface,
        )
        .unwrap();
        rec.update_data(
            &payload(
                r#"{"timestamps":[180,240,300],"metadata":{
                    "upper_band":[13.5,14.5,15],"middle_band":[10,10,10],"lower_band":[7,6,5]}}"#,
            ),
            &ctx,
            &mut surface,
        )
        .unwrap();
        assert_eq!(
            surface.values("bb", "upper"),
            vec![(60, 11.0), (120, 12.0), (180, 13.5), (240, 14.5), (300, 15.0)]
        );
        assert_eq!(surface.values("bb", "lower").len(), 5);
    }

    #[test]
    fn untimed_window_uses_length_policy_on_candle_axis() {
        let mut surface = RecordingSurface::new();
        let mut rec = attached(&mut surface);
        let axis = [60, 120, 180, 240];
        let ctx = UpdateContext::snapshot(&axis);
        rec.update_data(
            &payload(r#"{"metadata":{"upper":[12,13,14],"lower":[8,7,6],"middle":[10,10,10]}}"#),
            &ctx,
            &mut surface,
        )
        .unwrap();
        assert_eq!(surface.values("bb", "upper"), vec![(120, 12.0), (180, 13.0), (240, 14.0)]);

        rec.update_data(
            &payload(r#"{"metadata":{"upper":[14.2],"lower":[5.8]}}"#),
            &ctx,
            &mut surface,
        )
        .unwrap();
        assert_eq!(rec.metadata().upper, some(&[12.0, 13.0, 14.2]));
        assert_eq!(rec.metadata().middle, some(&[10.0, 10.0, 10.0]));
        assert_eq!(surface.values("bb", "upper"), vec![(120, 12.0), (180, 13.0), (240, 14.2)]);
        assert_eq!(surface.values("bb", "lower"), vec![(120, 8.0), (180, 7.0), (240, 5.8)]);
    }

    #[test]
    fn live_tick_updates_all_three_lines() {
        let mut surface = RecordingSurface::new();
        let mut rec = attached(&mut surface);
        let ctx = UpdateContext::default();
        rec.update_data(
            &payload(r#"{"timestamps":[60],"metadata":{"upper":[2],"lower":[1],"middle":[1.5]}}"#),
            &ctx,
            &mut surface,
        )
        .unwrap();
        let out = rec
            .update_data(
                &payload(r#"{"live_time":120,"metadata":{"upper":2.5,"lower":1.2},"value":1.8}"#),
                &ctx,
                &mut surface,
            )
            .unwrap();
        assert_eq!(out, UpdateOutcome::Tick { time: 120 });
        assert_eq!(surface.values("bb", "middle"), vec![(60, 1.5), (120, 1.8)]);
        assert_eq!(surface.values("bb", "upper"), vec![(60, 2.0), (120, 2.5)]);
    }
}
