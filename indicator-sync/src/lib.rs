//! Indicator synchronization engine.
//!
//! Turns streamed indicator payloads (history snapshots, live ticks, candle
//! closes) into one ordered, duplicate-free series per indicator output and
//! pushes the minimal set of changes to a [`RenderSurface`].

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

use data_feed::IndicatorInfo;

pub mod config;
pub mod error;
pub mod kind;
pub mod pipeline;
pub mod reconciler;
pub mod registry;
pub mod style;
pub mod surface;

pub use config::EngineConfig;
pub use error::SyncError;
pub use kind::{classify, Classification, IndicatorKind, ParseIndicatorKindError};
pub use pipeline::{ChartContext, ContextToken, PipelineReport, UpdatePipeline};
pub use reconciler::{
    create_reconciler, Reconciler, ReconcilerPhase, UpdateContext, UpdateMode, UpdateOutcome,
};
pub use registry::{IndicatorHandle, IndicatorRegistry, SyncReport};
pub use style::{HistogramShade, LinePattern, LineStyle, SeriesStyle, SeriesType};
pub use surface::{
    LevelLine, Marker, MarkerPosition, PlotPoint, RecordingSurface, RenderSurface, SeriesKey,
    SurfaceOp,
};

/// Axis group shared by every overlay indicator.
pub const PRICE_AXIS: &str = "price";

/// Server-assigned indicator identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndicatorId(String);

impl IndicatorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IndicatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for IndicatorId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for IndicatorId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for IndicatorId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Everything the engine knows about one indicator apart from its data.
///
/// The kind is resolved once, when the descriptor is created, and never
/// re-derived from later payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorDescriptor {
    pub id: IndicatorId,
    pub display_name: String,
    pub kind: IndicatorKind,
    /// Shares the price axis instead of owning a separate pane.
    pub overlay: bool,
    pub axis_group: String,
    pub color: String,
    pub visible: bool,
}

impl IndicatorDescriptor {
    pub fn from_info(info: &IndicatorInfo, classification: Classification) -> Self {
        let id = IndicatorId::new(info.id.clone());
        let kind = classification.kind;
        let overlay = classification.overlay;
        let axis_group = info.axis_group.clone().unwrap_or_else(|| {
            if overlay {
                PRICE_AXIS.to_string()
            } else {
                id.to_string()
            }
        });
        let color = info
            .color
            .clone()
            .unwrap_or_else(|| style::default_line_style(kind, kind.primary_line()).color);
        Self {
            display_name: info.name.clone().unwrap_or_else(|| id.to_string()),
            id,
            kind,
            overlay,
            axis_group,
            color,
            visible: info.visible.unwrap_or(true),
        }
    }

    /// Round-trip form for persisting an indicator set and re-adding it later.
    pub fn to_info(&self) -> IndicatorInfo {
        IndicatorInfo {
            id: self.id.to_string(),
            name: Some(self.display_name.clone()),
            kind: Some(self.kind.to_string()),
            overlay: Some(self.overlay),
            axis_group: Some(self.axis_group.clone()),
            color: Some(self.color.clone()),
            visible: Some(self.visible),
        }
    }
}
