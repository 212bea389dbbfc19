//! Message driver: takes decoded transport messages in arrival order, guards
//! against writes from torn-down chart contexts and feeds the registry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

use data_feed::{FeedEnvelope, FeedMessage, IndicatorInfo, MessageSink};
use ts_core::{Candle, TimeFrame, Timestamp};

use crate::config::EngineConfig;
use crate::reconciler::UpdateContext;
use crate::registry::{IndicatorHandle, IndicatorRegistry, SyncReport};
use crate::surface::RenderSurface;
use crate::{IndicatorDescriptor, SyncError};

/// The symbol and candle granularity a chart is showing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartContext {
    pub symbol: String,
    pub timeframe: TimeFrame,
}

impl ChartContext {
    pub fn new(symbol: impl Into<String>, timeframe: TimeFrame) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }

    /// False if the envelope names a different symbol or timeframe.
    /// Envelopes that name neither always match.
    pub fn accepts(&self, envelope: &FeedEnvelope) -> bool {
        let symbol_ok = envelope
            .symbol
            .as_deref()
            .map_or(true, |s| s.eq_ignore_ascii_case(&self.symbol));
        let timeframe_ok = envelope
            .timeframe
            .as_deref()
            .map_or(true, |tf| TimeFrame::parse(tf) == Some(self.timeframe));
        symbol_ok && timeframe_ok
    }
}

impl fmt::Display for ChartContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.symbol, self.timeframe)
    }
}

/// Identifies one chart context. Every context switch issues a new token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ContextToken(u64);

impl fmt::Display for ContextToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context#{}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineReport {
    pub message: &'static str,
    /// Candles forwarded to the surface.
    pub candles: usize,
    pub sync: SyncReport,
}

/// Owns the registry and the surface for one chart.
#[derive(Debug)]
pub struct UpdatePipeline<S: RenderSurface> {
    registry: IndicatorRegistry,
    surface: S,
    context: Option<ChartContext>,
    token: ContextToken,
    /// Times of the retained candles, ascending.
    candle_axis: Vec<Timestamp>,
}

impl<S: RenderSurface> UpdatePipeline<S> {
    pub fn new(config: EngineConfig, surface: S) -> Self {
        Self {
            registry: IndicatorRegistry::new(config),
            surface,
            context: None,
            token: ContextToken::default(),
            candle_axis: Vec::new(),
        }
    }

    pub fn token(&self) -> ContextToken {
        self.token
    }

    pub fn context(&self) -> Option<&ChartContext> {
        self.context.as_ref()
    }

    pub fn registry(&self) -> &IndicatorRegistry {
        &self.registry
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn into_surface(self) -> S {
        self.surface
    }

    pub fn candle_axis(&self) -> &[Timestamp] {
        &self.candle_axis
    }

    /// Tear down every indicator and the candle axis, then start a new
    /// context. Messages carrying an older token are rejected from now on.
    pub fn switch_context(&mut self, context: ChartContext) -> ContextToken {
        let removed = self.registry.clear(&mut self.surface);
        self.candle_axis.clear();
        self.surface.set_candles(&[]);
        self.token = ContextToken(self.token.0 + 1);
        info!(
            context = %context,
            token = %self.token,
            removed = removed.len(),
            "chart context switched"
        );
        self.context = Some(context);
        self.token
    }

    /// Apply one message if it belongs to the current context.
    pub fn handle(
        &mut self,
        token: ContextToken,
        envelope: &FeedEnvelope,
    ) -> Result<PipelineReport, SyncError> {
        if token != self.token {
            warn!(expected = %self.token, received = %token, "message for a stale context dropped");
            return Err(SyncError::StaleContextWrite {
                expected: self.token,
                received: token.to_string(),
            });
        }
        if let Some(context) = self.context.as_ref().filter(|c| !c.accepts(envelope)) {
            let received = format!(
                "{}/{}",
                envelope.symbol.as_deref().unwrap_or(&context.symbol),
                envelope.timeframe.as_deref().unwrap_or("?")
            );
            warn!(context = %context, %received, "message for another chart dropped");
            return Err(SyncError::StaleContextWrite {
                expected: self.token,
                received,
            });
        }
        Ok(self.apply(&envelope.message))
    }

    /// Apply one message without any context check.
    pub fn apply(&mut self, message: &FeedMessage) -> PipelineReport {
        let mut report = PipelineReport {
            message: message.name(),
            ..PipelineReport::default()
        };
        match message {
            FeedMessage::ChartInitialized {
                candles,
                indicators,
            } => {
                let candles = ordered_candles(candles);
                self.surface.set_candles(&candles);
                report.candles = candles.len();
                self.candle_axis = candles.iter().map(|c| c.time).collect();
                self.trim_axis();
                let ctx = UpdateContext::snapshot(&self.candle_axis);
                report.sync = self.registry.sync(indicators, &ctx, &mut self.surface);
            }
            FeedMessage::PriceUpdate {
                live_candle,
                indicators,
            } => {
                let time = self.forward_candle(live_candle.as_ref(), &mut report);
                let ctx = UpdateContext::live(&self.candle_axis, time);
                report.sync = self
                    .registry
                    .update_existing(indicators, &ctx, &mut self.surface);
            }
            FeedMessage::CandleClose { candle, indicators } => {
                let time = self.forward_candle(candle.as_ref(), &mut report);
                let ctx = UpdateContext::close(&self.candle_axis, time);
                report.sync = self
                    .registry
                    .update_existing(indicators, &ctx, &mut self.surface);
            }
            FeedMessage::IndicatorAdded {
                indicator,
                indicators_results,
            } => {
                let ctx = UpdateContext::snapshot(&self.candle_axis);
                report.sync = self.registry.create_or_update(
                    Some(indicator),
                    indicators_results,
                    &ctx,
                    &mut self.surface,
                );
            }
        }
        debug!(
            message = report.message,
            candles = report.candles,
            updated = report.sync.updated.len(),
            skipped = report.sync.skipped.len(),
            "message applied"
        );
        report
    }

    fn forward_candle(
        &mut self,
        candle: Option<&Candle>,
        report: &mut PipelineReport,
    ) -> Option<Timestamp> {
        let candle = candle?;
        self.surface.update_candle(*candle);
        report.candles = 1;
        if self.candle_axis.last().map_or(true, |&last| candle.time > last) {
            self.candle_axis.push(candle.time);
            self.trim_axis();
        }
        Some(candle.time)
    }

    fn trim_axis(&mut self) {
        let max = self.registry.config().max_points;
        if self.candle_axis.len() > max {
            let excess = self.candle_axis.len() - max;
            self.candle_axis.drain(..excess);
        }
    }

    pub fn add_indicator(&mut self, info: IndicatorInfo) -> Result<IndicatorHandle, SyncError> {
        self.registry.add_indicator(info, &mut self.surface)
    }

    pub fn remove_indicator(&mut self, id: &str) -> Result<IndicatorDescriptor, SyncError> {
        self.registry.remove_indicator(id, &mut self.surface)
    }

    pub fn set_visible(&mut self, id: &str, visible: bool) -> Result<(), SyncError> {
        self.registry.set_visible(id, visible, &mut self.surface)
    }

    pub fn indicator_count(&self) -> usize {
        self.registry.indicator_count()
    }

    pub fn descriptors(&self) -> Vec<IndicatorDescriptor> {
        self.registry.descriptors()
    }
}

impl<S: RenderSurface> MessageSink for UpdatePipeline<S> {
    fn on_message(&mut self, envelope: FeedEnvelope) {
        let token = self.token;
        if let Err(err) = self.handle(token, &envelope) {
            debug!(error = %err, "message not applied");
        }
    }
}

/// Sorted by time; on duplicate times the later candle wins.
fn ordered_candles(candles: &[Candle]) -> Vec<Candle> {
    candles
        .iter()
        .map(|c| (c.time, *c))
        .collect::<BTreeMap<_, _>>()
        .into_values()
        .collect()
}
