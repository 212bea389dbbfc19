use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use data_feed::{IndicatorInfo, UpdatePayload};

/// How an indicator's payloads are interpreted and drawn.
///
/// Lines per kind:
/// - Line: `main`
/// - Band: `upper`, `middle`, `lower` on one time axis
/// - MultiLine: `macd`, `signal`, `histogram` on one time axis
/// - OscillatorWithLevels: `main` plus static reference levels
/// - MarkerBased: `markers`, a sparse list of timed events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    Line,
    Band,
    MultiLine,
    OscillatorWithLevels,
    MarkerBased,
}

impl IndicatorKind {
    pub fn line_names(&self) -> &'static [&'static str] {
        match self {
            IndicatorKind::Line | IndicatorKind::OscillatorWithLevels => &["main"],
            IndicatorKind::Band => &["upper", "middle", "lower"],
            IndicatorKind::MultiLine => &["macd", "signal", "histogram"],
            IndicatorKind::MarkerBased => &["markers"],
        }
    }

    /// Line that takes the descriptor color.
    pub fn primary_line(&self) -> &'static str {
        match self {
            IndicatorKind::Band => "middle",
            IndicatorKind::MultiLine => "macd",
            IndicatorKind::MarkerBased => "markers",
            IndicatorKind::Line | IndicatorKind::OscillatorWithLevels => "main",
        }
    }

    pub fn default_overlay(&self) -> bool {
        matches!(
            self,
            IndicatorKind::Line | IndicatorKind::Band | IndicatorKind::MarkerBased
        )
    }
}

impl fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IndicatorKind::Line => "line",
            IndicatorKind::Band => "band",
            IndicatorKind::MultiLine => "multi_line",
            IndicatorKind::OscillatorWithLevels => "oscillator_with_levels",
            IndicatorKind::MarkerBased => "marker_based",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIndicatorKindError(pub String);

impl fmt::Display for ParseIndicatorKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown indicator kind: {}", self.0)
    }
}

impl std::error::Error for ParseIndicatorKindError {}

impl FromStr for IndicatorKind {
    type Err = ParseIndicatorKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalized(s).as_str() {
            "line" | "single" | "single_line" | "ma" | "sma" | "ema" => Ok(IndicatorKind::Line),
            "band" | "bands" | "bollinger" | "bbands" => Ok(IndicatorKind::Band),
            "multi_line" | "multiline" | "macd" | "composite" => Ok(IndicatorKind::MultiLine),
            "oscillator" | "oscillator_with_levels" | "rsi" | "stoch" => {
                Ok(IndicatorKind::OscillatorWithLevels)
            }
            "marker" | "markers" | "marker_based" | "events" | "pattern" => {
                Ok(IndicatorKind::MarkerBased)
            }
            _ => Err(ParseIndicatorKindError(s.to_string())),
        }
    }
}

struct Family {
    needles: &'static [&'static str],
    kind: IndicatorKind,
    overlay: bool,
}

// First match wins, so narrower families come before broader ones.
const FAMILIES: &[Family] = &[
    Family {
        needles: &["climax", "harmonic", "order_block", "pivot", "pattern", "fvg"],
        kind: IndicatorKind::MarkerBased,
        overlay: true,
    },
    Family {
        needles: &["bollinger", "bband", "keltner", "donchian", "envelope"],
        kind: IndicatorKind::Band,
        overlay: true,
    },
    Family {
        needles: &["macd"],
        kind: IndicatorKind::MultiLine,
        overlay: false,
    },
    Family {
        needles: &["rsi", "stoch", "williams", "mfi", "cci"],
        kind: IndicatorKind::OscillatorWithLevels,
        overlay: false,
    },
    Family {
        needles: &["atr", "obv", "adx", "volume"],
        kind: IndicatorKind::Line,
        overlay: false,
    },
    Family {
        needles: &["sma", "ema", "wma", "vwap", "moving_average"],
        kind: IndicatorKind::Line,
        overlay: true,
    },
];

fn family_for(name: &str) -> Option<&'static Family> {
    let name = normalized(name);
    FAMILIES
        .iter()
        .find(|f| f.needles.iter().any(|n| name.contains(n)))
}

/// Kind implied by the payload's structure alone.
pub fn shape_kind(payload: &UpdatePayload) -> IndicatorKind {
    let meta = &payload.metadata;
    if meta.has_band() {
        IndicatorKind::Band
    } else if meta.has_composite() {
        IndicatorKind::MultiLine
    } else if meta.events.is_some() || meta.event.is_some() {
        IndicatorKind::MarkerBased
    } else if meta.overbought.is_some() || meta.oversold.is_some() {
        IndicatorKind::OscillatorWithLevels
    } else {
        IndicatorKind::Line
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: IndicatorKind,
    pub overlay: bool,
}

/// Resolve kind and axis placement for a new indicator.
///
/// Order: explicit kind tag, name family, payload shape. An explicit tag that
/// does not parse is an error rather than a fallback.
pub fn classify(
    info: &IndicatorInfo,
    payload: Option<&UpdatePayload>,
) -> Result<Classification, ParseIndicatorKindError> {
    let explicit = info
        .kind
        .as_deref()
        .or_else(|| payload.and_then(|p| p.kind.as_deref()));
    let name = info
        .name
        .as_deref()
        .or_else(|| payload.and_then(|p| p.name.as_deref()))
        .unwrap_or(&info.id);
    let family = family_for(name).or_else(|| family_for(&info.id));

    let kind = match explicit {
        Some(tag) => tag.parse()?,
        None => match (family, payload) {
            (Some(f), _) => f.kind,
            (None, Some(p)) => shape_kind(p),
            (None, None) => IndicatorKind::Line,
        },
    };

    let overlay = info
        .overlay
        .or_else(|| payload.and_then(|p| p.overlay))
        .or_else(|| family.filter(|f| f.kind == kind).map(|f| f.overlay))
        .unwrap_or_else(|| kind.default_overlay());

    Ok(Classification { kind, overlay })
}

fn normalized(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .replace([' ', '-'], "_")
}
