use std::collections::BTreeMap;
use tracing::warn;

use data_feed::{MarkerEventWire, UpdatePayload};
use ts_core::Timestamp;

use super::series::{Axis, SeriesGroup};
use super::{Reconciler, ReconcilerPhase, UpdateContext, UpdateMode, UpdateOutcome};
use crate::config::EngineConfig;
use crate::surface::{Marker, MarkerPosition, RenderSurface};
use crate::{IndicatorDescriptor, SyncError};

/// Sparse timed events (climaxes, pivots, order blocks) drawn as markers.
///
/// Events are keyed by `(time, label)`; a newer event with the same key
/// replaces the older one.
#[derive(Debug)]
pub struct MarkerReconciler {
    group: SeriesGroup,
    markers: Vec<Marker>,
    max_markers: usize,
}

fn to_marker(event: &MarkerEventWire, time: Timestamp) -> Marker {
    Marker {
        time,
        price: event.price.filter(|p| p.is_finite()),
        label: event.label.clone(),
        position: event
            .position
            .as_deref()
            .and_then(MarkerPosition::parse)
            .unwrap_or_default(),
        color: event.color.clone(),
        fields: event.fields.clone(),
    }
}

impl MarkerReconciler {
    pub fn new(descriptor: IndicatorDescriptor, config: &EngineConfig) -> Self {
        Self {
            group: SeriesGroup::new(descriptor, config),
            markers: Vec::new(),
            max_markers: config.max_points,
        }
    }

    /// Markers carried by a snapshot payload.
    fn snapshot_markers(
        &self,
        payload: &UpdatePayload,
        ctx: &UpdateContext<'_>,
    ) -> Result<Vec<Marker>, SyncError> {
        let id = self.group.id();
        let axis = Axis::pick(payload.timestamps.as_deref(), ctx);

        if let Some(events) = &payload.metadata.events {
            let mut out = Vec::with_capacity(events.len());
            for event in events {
                let time = event
                    .time
                    .as_ref()
                    .and_then(|t| t.resolve())
                    .or_else(|| event.index.and_then(|i| axis.and_then(|a| a.time_at(i))));
                match time {
                    Some(time) => out.push(to_marker(event, time)),
                    None => warn!(
                        indicator = %id,
                        index = ?event.index,
                        "event without a usable time dropped"
                    ),
                }
            }
            if out.is_empty() && !events.is_empty() {
                return Err(SyncError::malformed(id, "no marker event has a usable time"));
            }
            return Ok(out);
        }

        // Value series where every non-null entry is an event at that bar.
        let values = payload
            .values
            .as_deref()
            .ok_or_else(|| SyncError::malformed(id, "marker snapshot without events"))?;
        let axis =
            axis.ok_or_else(|| SyncError::malformed(id, "marker snapshot without a time axis"))?;
        Ok(axis
            .align(values)
            .into_iter()
            .map(|p| Marker {
                time: p.time,
                price: Some(p.value),
                label: None,
                position: MarkerPosition::default(),
                color: None,
                fields: BTreeMap::new(),
            })
            .collect())
    }

    /// Merge markers in, newest key wins, bounded. Returns true if anything changed.
    fn merge(&mut self, incoming: Vec<Marker>) -> bool {
        let mut by_key: BTreeMap<(Timestamp, Option<String>), Marker> = self
            .markers
            .iter()
            .map(|m| ((m.time, m.label.clone()), m.clone()))
            .collect();
        for m in incoming {
            by_key.insert((m.time, m.label.clone()), m);
        }
        let mut merged: Vec<Marker> = by_key.into_values().collect();
        if merged.len() > self.max_markers {
            merged.drain(..merged.len() - self.max_markers);
        }
        if merged == self.markers {
            return false;
        }
        self.markers = merged;
        true
    }

    fn push_markers(&self, surface: &mut dyn RenderSurface) {
        if !self.group.is_visible() {
            return;
        }
        if let Some(key) = self.group.primary_key() {
            surface.set_markers(key, &self.markers);
        }
    }
}

impl Reconciler for MarkerReconciler {
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
            UpdateMode::Snapshot => {
                let incoming = self.snapshot_markers(payload, ctx)?;
                let count = incoming.len();
                let first = self.group.phase() != ReconcilerPhase::Synced;
                if self.merge(incoming) || first {
                    self.push_markers(surface);
                }
                self.group.mark_synced();
                Ok(UpdateOutcome::Snapshot { points: count })
            }
            mode => {
                let Some(time) = self.group.tick_time(mode, payload, ctx)? else {
                    return Ok(UpdateOutcome::Ignored);
                };
                if payload.signal != Some(true) {
                    return Ok(UpdateOutcome::Ignored);
                }
                let marker = match &payload.metadata.event {
                    Some(event) => {
                        let at = event.time.as_ref().and_then(|t| t.resolve()).unwrap_or(time);
                        to_marker(event, at)
                    }
                    None => {
                        let price = payload.value.filter(|v| v.is_finite()).ok_or_else(|| {
                            SyncError::malformed(self.group.id(), "signal without an event")
                        })?;
                        Marker {
                            time,
                            price: Some(price),
                            label: None,
                            position: MarkerPosition::default(),
                            color: None,
                            fields: BTreeMap::new(),
                        }
                    }
                };
                let at = marker.time;
                if self.merge(vec![marker]) {
                    self.push_markers(surface);
                }
                Ok(UpdateOutcome::Tick { time: at })
            }
        }
    }

    fn republish(&self, surface: &mut dyn RenderSurface) {
        self.push_markers(surface);
    }

    fn markers(&self) -> &[Marker] {
        &self.markers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{RecordingSurface, SurfaceOp};
    use crate::{IndicatorId, IndicatorKind};

    fn payload(json: &str) -> UpdatePayload {
        serde_json::from_str(json).unwrap()
    }

    fn attached(surface: &mut RecordingSurface) -> MarkerReconciler {
        let desc = IndicatorDescriptor {
            id: IndicatorId::new("climax"),
            display_name: "Buying Climax".into(),
            kind: IndicatorKind::MarkerBased,
            overlay: true,
            axis_group: "price".into(),
            color: "#fbbf24".into(),
            visible: true,
        };
        let mut rec = MarkerReconciler::new(desc, &EngineConfig::default().with_max_points(3));
        rec.attach(surface);
        rec
    }

    #[test]
    fn events_resolve_time_or_index() {
        let mut surface = RecordingSurface::new();
        let mut rec = attached(&mut surface);
        rec.update_data(
            &payload(
                r#"{"timestamps":[60,120,180],"metadata":{"events":[
                    {"time":60,"price":10.5,"label":"BC","position":"above","target":12.0},
                    {"index":2,"price":9.0,"text":"SC","position":"belowBar"},
                    {"index":7}]}}"#,
            ),
            &UpdateContext::default(),
            &mut surface,
        )
        .unwrap();
        let markers = surface.markers("climax", "markers").unwrap();
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].fields.get("target").and_then(|v| v.as_f64()), Some(12.0));
        assert_eq!(markers[1].time, 180);
        assert_eq!(markers[1].position, MarkerPosition::Below);
        assert_eq!(rec.phase(), ReconcilerPhase::Synced);
    }

    #[test]
    fn empty_event_list_syncs() {
        let mut surface = RecordingSurface::new();
        let mut rec = attached(&mut surface);
        let out = rec
            .update_data(
                &payload(r#"{"metadata":{"events":[]}}"#),
                &UpdateContext::default(),
                &mut surface,
            )
            .unwrap();
        assert_eq!(out, UpdateOutcome::Snapshot { points: 0 });
        assert_eq!(rec.phase(), ReconcilerPhase::Synced);
        assert!(matches!(surface.ops().last(), Some(SurfaceOp::SetMarkers { count: 0, .. })));
    }

    #[test]
    fn unresolvable_events_do_not_sync() {
        let mut surface = RecordingSurface::new();
        let mut rec = attached(&mut surface);
        let err = rec.update_data(
            &payload(r#"{"metadata":{"events":[{"index":7},{"price":3.0}]}}"#),
            &UpdateContext::default(),
            &mut surface,
        );
        assert!(matches!(err, Err(SyncError::MalformedPayload { .. })));
        assert_eq!(rec.phase(), ReconcilerPhase::AwaitingSnapshot);
        assert!(rec.markers().is_empty());
        assert!(!surface
            .ops()
            .iter()
            .any(|op| matches!(op, SurfaceOp::SetMarkers { .. })));
    }

    #[test]
    fn live_events_are_gated_on_signal() {
        let mut surface = RecordingSurface::new();
        let mut rec = attached(&mut surface);
        let ctx = UpdateContext::default();
        rec.update_data(&payload(r#"{"metadata":{"events":[]}}"#), &ctx, &mut surface)
            .unwrap();

        let quiet = payload(r#"{"signal":false,"live_time":120,"metadata":{"event":{"price":1}}}"#);
        assert_eq!(rec.update_data(&quiet, &ctx, &mut surface).unwrap(), UpdateOutcome::Ignored);
        assert!(rec.markers().is_empty());

        let fired = payload(
            r#"{"signal":true,"live_time":120,"metadata":{"event":{"price":1,"label":"BC"}}}"#,
        );
        assert_eq!(
            rec.update_data(&fired, &ctx, &mut surface).unwrap(),
            UpdateOutcome::Tick { time: 120 }
        );
        // Same event again on the next tick: no growth, no push.
        surface.take_ops();
        rec.update_data(&fired, &ctx, &mut surface).unwrap();
        assert_eq!(rec.markers().len(), 1);
        assert!(surface.ops().is_empty());
    }

    #[test]
    fn marker_list_is_bounded() {
        let mut surface = RecordingSurface::new();
        let mut rec = attached(&mut surface);
        rec.update_data(
            &payload(r#"{"timestamps":[60,120,180,240,300],"values":[1,null,3,4,5]}"#),
            &UpdateContext::default(),
            &mut surface,
        )
        .unwrap();
        let times: Vec<_> = rec.markers().iter().map(|m| m.time).collect();
        assert_eq!(times, vec![180, 240, 300]);
    }
}
