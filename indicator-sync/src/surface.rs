//! Outbound side of the engine: the rendering surface it pushes into, plus an
//! in-memory surface that records every call.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use ts_core::{Candle, Timestamp};

use crate::style::{LineStyle, SeriesStyle};
use crate::IndicatorId;

/// One output series of one indicator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SeriesKey {
    pub indicator: IndicatorId,
    pub line: &'static str,
}

impl SeriesKey {
    pub fn new(indicator: IndicatorId, line: &'static str) -> Self {
        Self { indicator, line }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.indicator, self.line)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotPoint {
    pub time: Timestamp,
    pub value: f64,
    /// Per-bar color, histograms only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl PlotPoint {
    pub fn new(time: Timestamp, value: f64) -> Self {
        Self {
            time,
            value,
            color: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerPosition {
    #[default]
    Above,
    Below,
    InBar,
}

impl MarkerPosition {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "above" | "above_bar" | "abovebar" | "top" => Some(MarkerPosition::Above),
            "below" | "below_bar" | "belowbar" | "bottom" => Some(MarkerPosition::Below),
            "in_bar" | "inbar" | "inside" => Some(MarkerPosition::InBar),
            _ => None,
        }
    }
}

/// One discrete event drawn at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub time: Timestamp,
    pub price: Option<f64>,
    pub label: Option<String>,
    pub position: MarkerPosition,
    pub color: Option<String>,
    /// Event-specific extras, e.g. stop or target prices.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// Static horizontal reference line, e.g. an oscillator's overbought level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelLine {
    pub value: f64,
    pub label: String,
    pub style: LineStyle,
}

/// The chart the engine draws into. The engine is the only writer of series
/// data; it never reads anything back.
pub trait RenderSurface {
    fn add_series(&mut self, key: &SeriesKey, style: &SeriesStyle);
    fn remove_series(&mut self, key: &SeriesKey);
    /// Replace the whole series.
    fn set_data(&mut self, key: &SeriesKey, points: &[PlotPoint]);
    /// Append, or overwrite the last point when the time matches.
    fn update(&mut self, key: &SeriesKey, point: PlotPoint);
    fn set_markers(&mut self, key: &SeriesKey, markers: &[Marker]);
    fn set_levels(&mut self, key: &SeriesKey, levels: &[LevelLine]);
    fn set_visible(&mut self, key: &SeriesKey, visible: bool);
    fn set_candles(&mut self, candles: &[Candle]);
    fn update_candle(&mut self, candle: Candle);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SurfaceOp {
    AddSeries { key: SeriesKey },
    RemoveSeries { key: SeriesKey },
    SetData { key: SeriesKey, len: usize },
    Update { key: SeriesKey, point: PlotPoint },
    SetMarkers { key: SeriesKey, count: usize },
    SetLevels { key: SeriesKey, count: usize },
    SetVisible { key: SeriesKey, visible: bool },
    SetCandles { count: usize },
    UpdateCandle { time: Timestamp },
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesState {
    pub style: SeriesStyle,
    pub points: Vec<PlotPoint>,
    pub markers: Vec<Marker>,
    pub levels: Vec<LevelLine>,
    pub visible: bool,
}

/// Surface that keeps the resulting chart state in memory and logs every call.
///
/// `update` follows the usual charting-library rule: a point older than the
/// series' last point is rejected and counted, never inserted.
#[derive(Debug, Default)]
pub struct RecordingSurface {
    ops: Vec<SurfaceOp>,
    series: BTreeMap<SeriesKey, SeriesState>,
    candles: Vec<Candle>,
    rejected: usize,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &[SurfaceOp] {
        &self.ops
    }

    pub fn take_ops(&mut self) -> Vec<SurfaceOp> {
        std::mem::take(&mut self.ops)
    }

    /// Calls that hit a missing series or went backwards in time.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    pub fn series(&self) -> impl Iterator<Item = (&SeriesKey, &SeriesState)> {
        self.series.iter()
    }

    pub fn state(&self, indicator: &str, line: &str) -> Option<&SeriesState> {
        self.series
            .iter()
            .find(|(k, _)| k.indicator.as_str() == indicator && k.line == line)
            .map(|(_, s)| s)
    }

    pub fn points(&self, indicator: &str, line: &str) -> Option<&[PlotPoint]> {
        self.state(indicator, line).map(|s| s.points.as_slice())
    }

    /// `(time, value)` pairs of a series, empty if it does not exist.
    pub fn values(&self, indicator: &str, line: &str) -> Vec<(Timestamp, f64)> {
        self.points(indicator, line)
            .map(|pts| pts.iter().map(|p| (p.time, p.value)).collect())
            .unwrap_or_default()
    }

    pub fn markers(&self, indicator: &str, line: &str) -> Option<&[Marker]> {
        self.state(indicator, line).map(|s| s.markers.as_slice())
    }

    pub fn levels(&self, indicator: &str, line: &str) -> Option<&[LevelLine]> {
        self.state(indicator, line).map(|s| s.levels.as_slice())
    }

    pub fn is_visible(&self, indicator: &str, line: &str) -> Option<bool> {
        self.state(indicator, line).map(|s| s.visible)
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    fn state_mut(&mut self, key: &SeriesKey) -> Option<&mut SeriesState> {
        let state = self.series.get_mut(key);
        if state.is_none() {
            self.rejected += 1;
        }
        state
    }
}

impl RenderSurface for RecordingSurface {
    fn add_series(&mut self, key: &SeriesKey, style: &SeriesStyle) {
        self.ops.push(SurfaceOp::AddSeries { key: key.clone() });
        self.series.insert(
            key.clone(),
            SeriesState {
                style: style.clone(),
                points: Vec::new(),
                markers: Vec::new(),
                levels: Vec::new(),
                visible: true,
            },
        );
    }

    fn remove_series(&mut self, key: &SeriesKey) {
        self.ops.push(SurfaceOp::RemoveSeries { key: key.clone() });
        if self.series.remove(key).is_none() {
            self.rejected += 1;
        }
    }

    fn set_data(&mut self, key: &SeriesKey, points: &[PlotPoint]) {
        self.ops.push(SurfaceOp::SetData {
            key: key.clone(),
            len: points.len(),
        });
        if let Some(state) = self.state_mut(key) {
            state.points = points.to_vec();
        }
    }

    fn update(&mut self, key: &SeriesKey, point: PlotPoint) {
        self.ops.push(SurfaceOp::Update {
            key: key.clone(),
            point: point.clone(),
        });
        let rejected = match self.series.get_mut(key) {
            None => true,
            Some(state) => match state.points.last_mut() {
                Some(last) if last.time == point.time => {
                    *last = point;
                    false
                }
                Some(last) if last.time > point.time => true,
                _ => {
                    state.points.push(point);
                    false
                }
            },
        };
        if rejected {
            self.rejected += 1;
        }
    }

    fn set_markers(&mut self, key: &SeriesKey, markers: &[Marker]) {
        self.ops.push(SurfaceOp::SetMarkers {
            key: key.clone(),
            count: markers.len(),
        });
        if let Some(state) = self.state_mut(key) {
            state.markers = markers.to_vec();
        }
    }

    fn set_levels(&mut self, key: &SeriesKey, levels: &[LevelLine]) {
        self.ops.push(SurfaceOp::SetLevels {
            key: key.clone(),
            count: levels.len(),
        });
        if let Some(state) = self.state_mut(key) {
            state.levels = levels.to_vec();
        }
    }

    fn set_visible(&mut self, key: &SeriesKey, visible: bool) {
        self.ops.push(SurfaceOp::SetVisible {
            key: key.clone(),
            visible,
        });
        if let Some(state) = self.state_mut(key) {
            state.visible = visible;
        }
    }

    fn set_candles(&mut self, candles: &[Candle]) {
        self.ops.push(SurfaceOp::SetCandles {
            count: candles.len(),
        });
        self.candles = candles.to_vec();
    }

    fn update_candle(&mut self, candle: Candle) {
        self.ops.push(SurfaceOp::UpdateCandle { time: candle.time });
        match self.candles.last_mut() {
            Some(last) if last.time == candle.time => *last = candle,
            Some(last) if last.time > candle.time => self.rejected += 1,
            _ => self.candles.push(candle),
        }
    }
}
