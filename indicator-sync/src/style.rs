use serde::{Deserialize, Serialize};

use crate::{IndicatorDescriptor, IndicatorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinePattern {
    Solid,
    Dashed,
    Dotted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineStyle {
    pub color: String,
    pub width: f64,
    pub pattern: LinePattern,
}

impl LineStyle {
    fn new(color: &str, width: f64, pattern: LinePattern) -> Self {
        Self {
            color: color.to_string(),
            width,
            pattern,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeriesType {
    Line,
    Histogram,
    Markers,
}

/// Everything the surface needs to create one output series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesStyle {
    pub series_type: SeriesType,
    pub line: LineStyle,
    pub overlay: bool,
    pub axis_group: String,
}

impl SeriesStyle {
    pub fn for_line(descriptor: &IndicatorDescriptor, line: &str) -> Self {
        let mut style = default_line_style(descriptor.kind, line);
        if line == descriptor.kind.primary_line() {
            style.color = descriptor.color.clone();
        }
        let series_type = match (descriptor.kind, line) {
            (IndicatorKind::MultiLine, "histogram") => SeriesType::Histogram,
            (IndicatorKind::MarkerBased, _) => SeriesType::Markers,
            _ => SeriesType::Line,
        };
        Self {
            series_type,
            line: style,
            overlay: descriptor.overlay,
            axis_group: descriptor.axis_group.clone(),
        }
    }
}

pub fn default_line_style(kind: IndicatorKind, line: &str) -> LineStyle {
    match (kind, line) {
        (IndicatorKind::Line, _) => LineStyle::new("#7ee0ff", 1.8, LinePattern::Solid),
        (IndicatorKind::Band, "middle") => LineStyle::new("#60a5fa", 1.2, LinePattern::Solid),
        (IndicatorKind::Band, _) => LineStyle::new("#93c5fd", 1.0, LinePattern::Dashed),
        (IndicatorKind::MultiLine, "signal") => {
            LineStyle::new("#f472b6", 1.6, LinePattern::Solid)
        }
        (IndicatorKind::MultiLine, "histogram") => {
            LineStyle::new("#94a3b8", 1.2, LinePattern::Solid)
        }
        (IndicatorKind::MultiLine, _) => LineStyle::new("#4ade80", 1.8, LinePattern::Solid),
        (IndicatorKind::OscillatorWithLevels, "level") => {
            LineStyle::new("#64748b", 1.0, LinePattern::Dotted)
        }
        (IndicatorKind::OscillatorWithLevels, _) => {
            LineStyle::new("#7dd3fc", 1.6, LinePattern::Solid)
        }
        (IndicatorKind::MarkerBased, _) => LineStyle::new("#fbbf24", 1.0, LinePattern::Solid),
    }
}

/// Histogram bar shade, derived from the bar's sign and its move against the
/// previous bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistogramShade {
    StrongUp,
    WeakUp,
    StrongDown,
    WeakDown,
}

impl HistogramShade {
    pub fn color(&self) -> &'static str {
        match self {
            HistogramShade::StrongUp => "#26a69a",
            HistogramShade::WeakUp => "#b2dfdb",
            HistogramShade::StrongDown => "#ef5350",
            HistogramShade::WeakDown => "#ffcdd2",
        }
    }
}

/// Darker when the bar grows away from zero, lighter when it shrinks back.
pub fn shade_for(prev: Option<f64>, value: f64) -> HistogramShade {
    if value >= 0.0 {
        match prev {
            Some(p) if value < p => HistogramShade::WeakUp,
            _ => HistogramShade::StrongUp,
        }
    } else {
        match prev {
            Some(p) if value > p => HistogramShade::WeakDown,
            _ => HistogramShade::StrongDown,
        }
    }
}
