//! Per-kind update protocols.
//!
//! Every reconciler follows the same lifecycle:
//! `Uninitialized -> AwaitingSnapshot` on attach, `AwaitingSnapshot -> Synced`
//! on the first snapshot that yields at least one point, then `Synced` for good.
//! Live ticks and closes are ignored until the first snapshot has landed.

use serde::Serialize;
use std::fmt;
use tracing::debug;

use data_feed::{PayloadShape, UpdatePayload};
use ts_core::{TimePoint, Timestamp};

use crate::config::EngineConfig;
use crate::surface::{LevelLine, Marker, RenderSurface};
use crate::{IndicatorDescriptor, IndicatorId, IndicatorKind, SyncError};

mod band;
mod line;
mod marker;
mod multi_line;
mod oscillator;
mod series;

pub use band::{merge_band_values, BandMetadata, BandReconciler};
pub use line::LineReconciler;
pub use marker::MarkerReconciler;
pub use multi_line::MultiLineReconciler;
pub use oscillator::OscillatorReconciler;
pub use series::SeriesGroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReconcilerPhase {
    Uninitialized,
    AwaitingSnapshot,
    Synced,
}

/// How one payload is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// History arrays, merged into the caches.
    Snapshot,
    /// Provisional value for the in-progress candle.
    Live,
    /// Final value for a candle; overwrites the provisional one.
    Close,
}

impl UpdateMode {
    /// `None` when the payload carries nothing usable.
    pub fn of(payload: &UpdatePayload, closing: bool) -> Option<Self> {
        match payload.shape() {
            PayloadShape::Snapshot => Some(UpdateMode::Snapshot),
            PayloadShape::Live if closing || payload.is_closed() => Some(UpdateMode::Close),
            PayloadShape::Live => Some(UpdateMode::Live),
            PayloadShape::Empty => None,
        }
    }
}

/// Message-level facts a reconciler needs besides its own payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateContext<'a> {
    /// Set for candle-close messages.
    pub closing: bool,
    /// Times of the retained candles, used when a snapshot has no axis.
    pub candle_axis: &'a [Timestamp],
    /// Time of the candle the message refers to.
    pub candle_time: Option<Timestamp>,
}

impl<'a> UpdateContext<'a> {
    pub fn snapshot(candle_axis: &'a [Timestamp]) -> Self {
        Self {
            closing: false,
            candle_axis,
            candle_time: None,
        }
    }

    pub fn live(candle_axis: &'a [Timestamp], candle_time: Option<Timestamp>) -> Self {
        Self {
            closing: false,
            candle_axis,
            candle_time,
        }
    }

    pub fn close(candle_axis: &'a [Timestamp], candle_time: Option<Timestamp>) -> Self {
        Self {
            closing: true,
            candle_axis,
            candle_time,
        }
    }

    pub fn mode(&self, id: &IndicatorId, payload: &UpdatePayload) -> Result<UpdateMode, SyncError> {
        UpdateMode::of(payload, self.closing)
            .ok_or_else(|| SyncError::malformed(id, "payload has neither history nor a live value"))
    }

    /// Payload time first, then the message candle, then the newest candle.
    pub fn live_time(&self, payload: &UpdatePayload) -> Option<Timestamp> {
        payload
            .live_time
            .as_ref()
            .and_then(|t| t.resolve())
            .or(self.candle_time)
            .or_else(|| self.candle_axis.last().copied())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpdateOutcome {
    Snapshot { points: usize },
    Tick { time: Timestamp },
    Ignored,
}

/// One live indicator: its caches, its surface series and its update protocol.
pub trait Reconciler: fmt::Debug {
    fn group(&self) -> &SeriesGroup;
    fn group_mut(&mut self) -> &mut SeriesGroup;

    /// Apply one payload. On error no cached state has changed.
    fn update_data(
        &mut self,
        payload: &UpdatePayload,
        ctx: &UpdateContext<'_>,
        surface: &mut dyn RenderSurface,
    ) -> Result<UpdateOutcome, SyncError>;

    /// Push the full state again, e.g. after the indicator is shown.
    fn republish(&self, surface: &mut dyn RenderSurface) {
        self.group().publish_all(surface);
    }

    fn descriptor(&self) -> &IndicatorDescriptor {
        self.group().descriptor()
    }

    fn kind(&self) -> IndicatorKind {
        self.descriptor().kind
    }

    fn phase(&self) -> ReconcilerPhase {
        self.group().phase()
    }

    fn attach(&mut self, surface: &mut dyn RenderSurface) {
        self.group_mut().attach(surface);
    }

    fn set_visible(&mut self, visible: bool, surface: &mut dyn RenderSurface) {
        if self.group_mut().set_visible(visible, surface) && visible {
            self.republish(surface);
        }
    }

    fn detach(&mut self, surface: &mut dyn RenderSurface) {
        self.group_mut().detach(surface);
    }

    fn points(&self, line: &str) -> Option<&[TimePoint]> {
        self.group().points(line)
    }

    fn markers(&self) -> &[Marker] {
        &[]
    }

    fn levels(&self) -> &[LevelLine] {
        &[]
    }
}

pub fn create_reconciler(
    descriptor: IndicatorDescriptor,
    config: &EngineConfig,
) -> Box<dyn Reconciler> {
    debug!(indicator = %descriptor.id, kind = %descriptor.kind, "creating reconciler");
    match descriptor.kind {
        IndicatorKind::Line => Box::new(LineReconciler::new(descriptor, config)),
        IndicatorKind::Band => Box::new(BandReconciler::new(descriptor, config)),
        IndicatorKind::MultiLine => Box::new(MultiLineReconciler::new(descriptor, config)),
        IndicatorKind::OscillatorWithLevels => {
            Box::new(OscillatorReconciler::new(descriptor, config))
        }
        IndicatorKind::MarkerBased => Box::new(MarkerReconciler::new(descriptor, config)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(json: &str) -> UpdatePayload {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn mode_follows_shape_and_close_flag() {
        let snap = payload(r#"{"values":[1],"timestamps":[60]}"#);
        let tick = payload(r#"{"value":1.5,"live_time":60}"#);
        let flagged = payload(r#"{"value":1.5,"is_closed":true}"#);
        assert_eq!(UpdateMode::of(&snap, true), Some(UpdateMode::Snapshot));
        assert_eq!(UpdateMode::of(&tick, false), Some(UpdateMode::Live));
        assert_eq!(UpdateMode::of(&tick, true), Some(UpdateMode::Close));
        assert_eq!(UpdateMode::of(&flagged, false), Some(UpdateMode::Close));
        assert_eq!(UpdateMode::of(&UpdatePayload::default(), false), None);
    }

    #[test]
    fn live_time_falls_back_to_candles() {
        let axis = [60, 120];
        let ctx = UpdateContext::live(&axis, Some(180));
        assert_eq!(ctx.live_time(&payload(r#"{"value":1,"liveTime":"240"}"#)), Some(240));
        assert_eq!(ctx.live_time(&payload(r#"{"value":1}"#)), Some(180));
        let ctx = UpdateContext::live(&axis, None);
        assert_eq!(ctx.live_time(&payload(r#"{"value":1}"#)), Some(120));
        let ctx = UpdateContext::live(&[], None);
        assert_eq!(ctx.live_time(&payload(r#"{"value":1}"#)), None);
    }

    #[test]
    fn factory_matches_kind() {
        let config = EngineConfig::default();
        for kind in [
            IndicatorKind::Line,
            IndicatorKind::Band,
            IndicatorKind::MultiLine,
            IndicatorKind::OscillatorWithLevels,
            IndicatorKind::MarkerBased,
        ] {
            let desc = IndicatorDescriptor {
                id: IndicatorId::new("x"),
                display_name: "x".into(),
                kind,
                overlay: kind.default_overlay(),
                axis_group: "x".into(),
                color: "#fff".into(),
                visible: true,
            };
            let rec = create_reconciler(desc, &config);
            assert_eq!(rec.kind(), kind);
            assert_eq!(rec.phase(), ReconcilerPhase::Uninitialized);
        }
    }
}
