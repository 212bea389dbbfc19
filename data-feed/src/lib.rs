use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use ts_core::{Candle, RawTime};

/// Payloads keyed by server-assigned indicator id.
pub type IndicatorPayloads = BTreeMap<String, UpdatePayload>;

/// One transport message, optionally stamped with the chart context it was
/// produced for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<String>,
    #[serde(flatten)]
    pub message: FeedMessage,
}

impl From<FeedMessage> for FeedEnvelope {
    fn from(message: FeedMessage) -> Self {
        Self {
            symbol: None,
            timeframe: None,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    /// Full chart state: candles plus every active indicator's history.
    ChartInitialized {
        #[serde(default)]
        candles: Vec<Candle>,
        #[serde(default)]
        indicators: IndicatorPayloads,
    },
    /// In-progress candle tick.
    PriceUpdate {
        #[serde(default)]
        live_candle: Option<Candle>,
        #[serde(default)]
        indicators: IndicatorPayloads,
    },
    /// Candle finalization.
    CandleClose {
        #[serde(default)]
        candle: Option<Candle>,
        #[serde(default)]
        indicators: IndicatorPayloads,
    },
    /// Server acknowledged a newly added indicator.
    IndicatorAdded {
        indicator: IndicatorInfo,
        #[serde(default, alias = "indicators")]
        indicators_results: IndicatorPayloads,
    },
}

impl FeedMessage {
    pub fn name(&self) -> &'static str {
        match self {
            FeedMessage::ChartInitialized { .. } => "chart_initialized",
            FeedMessage::PriceUpdate { .. } => "price_update",
            FeedMessage::CandleClose { .. } => "candle_close",
            FeedMessage::IndicatorAdded { .. } => "indicator_added",
        }
    }

    pub fn indicators(&self) -> &IndicatorPayloads {
        match self {
            FeedMessage::ChartInitialized { indicators, .. }
            | FeedMessage::PriceUpdate { indicators, .. }
            | FeedMessage::CandleClose { indicators, .. } => indicators,
            FeedMessage::IndicatorAdded {
                indicators_results, ..
            } => indicators_results,
        }
    }

    /// The candle a live or close message refers to.
    pub fn candle(&self) -> Option<&Candle> {
        match self {
            FeedMessage::PriceUpdate { live_candle, .. } => live_candle.as_ref(),
            FeedMessage::CandleClose { candle, .. } => candle.as_ref(),
            _ => None,
        }
    }
}

/// Indicator description as the server or the UI reports it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorInfo {
    pub id: String,
    #[serde(alias = "display_name")]
    pub name: Option<String>,
    pub kind: Option<String>,
    pub overlay: Option<bool>,
    pub axis_group: Option<String>,
    pub color: Option<String>,
    pub visible: Option<bool>,
}

impl IndicatorInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

/// A series field that may arrive as a single value or as an array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SeriesValues {
    Many(Vec<Option<f64>>),
    One(f64),
}

impl SeriesValues {
    pub fn as_array(&self) -> Option<&[Option<f64>]> {
        match self {
            SeriesValues::Many(values) => Some(values),
            SeriesValues::One(_) => None,
        }
    }

    /// The scalar, or the newest finite element of the array.
    pub fn latest(&self) -> Option<f64> {
        match self {
            SeriesValues::One(v) => v.is_finite().then_some(*v),
            SeriesValues::Many(values) => values
                .iter()
                .rev()
                .flatten()
                .copied()
                .find(|v| v.is_finite()),
        }
    }

    fn has_history(&self) -> bool {
        self.as_array().is_some_and(|a| !a.is_empty())
    }

    fn is_scalar(&self) -> bool {
        matches!(self, SeriesValues::One(v) if v.is_finite())
    }
}

/// Composite (MACD-style) series nested under one shared `index` axis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalSeries {
    #[serde(alias = "timestamps")]
    pub index: Option<Vec<RawTime>>,
    #[serde(alias = "main")]
    pub macd: Option<SeriesValues>,
    pub signal: Option<SeriesValues>,
    #[serde(alias = "hist")]
    pub histogram: Option<SeriesValues>,
}

impl SignalSeries {
    fn series(&self) -> impl Iterator<Item = &SeriesValues> {
        [&self.macd, &self.signal, &self.histogram]
            .into_iter()
            .flatten()
    }
}

/// One discrete event of a marker-based indicator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerEventWire {
    pub time: Option<RawTime>,
    /// Position in the payload's `timestamps` when `time` is absent.
    pub index: Option<usize>,
    pub price: Option<f64>,
    #[serde(alias = "text")]
    pub label: Option<String>,
    pub position: Option<String>,
    pub color: Option<String>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadMetadata {
    #[serde(alias = "upper")]
    pub upper_band: Option<SeriesValues>,
    #[serde(alias = "lower")]
    pub lower_band: Option<SeriesValues>,
    #[serde(alias = "middle", alias = "basis")]
    pub middle_band: Option<SeriesValues>,
    pub signals: Option<SignalSeries>,
    pub overbought: Option<f64>,
    pub oversold: Option<f64>,
    pub levels: Option<Vec<f64>>,
    pub events: Option<Vec<MarkerEventWire>>,
    pub event: Option<MarkerEventWire>,
}

impl PayloadMetadata {
    pub fn has_band(&self) -> bool {
        self.upper_band.is_some() && self.lower_band.is_some()
    }

    pub fn band_series(&self) -> impl Iterator<Item = &SeriesValues> {
        [&self.upper_band, &self.lower_band, &self.middle_band]
            .into_iter()
            .flatten()
    }

    /// True when `signals` carries all three composite series.
    pub fn has_composite(&self) -> bool {
        self.signals
            .as_ref()
            .is_some_and(|s| s.macd.is_some() && s.signal.is_some() && s.histogram.is_some())
    }

    fn has_history(&self) -> bool {
        self.band_series().any(SeriesValues::has_history)
            || self
                .signals
                .as_ref()
                .is_some_and(|s| s.series().any(SeriesValues::has_history))
            || self.events.is_some()
    }

    fn has_live_value(&self) -> bool {
        self.band_series().any(SeriesValues::is_scalar)
            || self
                .signals
                .as_ref()
                .is_some_and(|s| s.series().any(SeriesValues::is_scalar))
            || self.event.is_some()
    }
}

/// How a payload should be interpreted, judged from its content alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// Carries history arrays.
    Snapshot,
    /// Carries a single in-progress value.
    Live,
    /// Carries nothing usable.
    Empty,
}

/// Per-indicator update as delivered inside a `FeedMessage`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatePayload {
    #[serde(alias = "display_name")]
    pub name: Option<String>,
    pub kind: Option<String>,
    pub overlay: Option<bool>,
    pub color: Option<String>,
    pub axis_group: Option<String>,
    pub values: Option<Vec<Option<f64>>>,
    pub timestamps: Option<Vec<RawTime>>,
    pub value: Option<f64>,
    #[serde(alias = "liveTime", alias = "time")]
    pub live_time: Option<RawTime>,
    #[serde(alias = "is_closed")]
    pub closed: Option<bool>,
    pub signal: Option<bool>,
    pub metadata: PayloadMetadata,
}

impl UpdatePayload {
    pub fn shape(&self) -> PayloadShape {
        if self.has_history() {
            PayloadShape::Snapshot
        } else if self.has_live_value() {
            PayloadShape::Live
        } else {
            PayloadShape::Empty
        }
    }

    pub fn has_history(&self) -> bool {
        self.values.as_ref().is_some_and(|v| !v.is_empty()) || self.metadata.has_history()
    }

    pub fn has_live_value(&self) -> bool {
        self.value.is_some_and(f64::is_finite)
            || self.signal.is_some()
            || self.metadata.has_live_value()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.unwrap_or(false)
    }

    /// Descriptor hints carried by the payload itself.
    pub fn info(&self, id: &str) -> IndicatorInfo {
        IndicatorInfo {
            id: id.to_string(),
            name: self.name.clone(),
            kind: self.kind.clone(),
            overlay: self.overlay,
            axis_group: self.axis_group.clone(),
            color: self.color.clone(),
            visible: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("empty message")]
    EmptyLine,
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Decode one transport frame.
pub fn parse_envelope(text: &str) -> Result<FeedEnvelope, FeedError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(FeedError::EmptyLine);
    }
    Ok(serde_json::from_str(text)?)
}

/// Consumer interface for decoded transport messages.
pub trait MessageSink {
    fn on_message(&mut self, envelope: FeedEnvelope);
}
