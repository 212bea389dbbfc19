use data_feed::{PayloadMetadata, UpdatePayload};

use super::series::{Axis, SeriesGroup};
use super::{Reconciler, UpdateContext, UpdateMode, UpdateOutcome};
use crate::config::EngineConfig;
use crate::style::default_line_style;
use crate::surface::{LevelLine, RenderSurface};
use crate::{IndicatorDescriptor, IndicatorKind, SyncError};

/// RSI-style line plus static reference levels.
#[derive(Debug)]
pub struct OscillatorReconciler {
    group: SeriesGroup,
    levels: Option<Vec<LevelLine>>,
    default_levels: (f64, f64),
}

impl OscillatorReconciler {
    pub fn new(descriptor: IndicatorDescriptor, config: &EngineConfig) -> Self {
        Self {
            group: SeriesGroup::new(descriptor, config),
            levels: None,
            default_levels: (config.default_overbought, config.default_oversold),
        }
    }

    fn push_levels(&self, surface: &mut dyn RenderSurface) {
        let (Some(levels), Some(key)) = (&self.levels, self.group.primary_key()) else {
            return;
        };
        if self.group.is_visible() {
            surface.set_levels(key, levels);
        }
    }
}

/// Reference lines from payload metadata, or the configured defaults.
fn level_lines(meta: &PayloadMetadata, (overbought, oversold): (f64, f64)) -> Vec<LevelLine> {
    let line = |value: f64, label: String| LevelLine {
        value,
        label,
        style: default_line_style(IndicatorKind::OscillatorWithLevels, "level"),
    };
    if let Some(levels) = meta.levels.as_ref().filter(|l| !l.is_empty()) {
        return levels
            .iter()
            .filter(|v| v.is_finite())
            .map(|&v| line(v, format!("{v}")))
            .collect();
    }
    vec![
        line(meta.overbought.unwrap_or(overbought), "overbought".to_string()),
        line(meta.oversold.unwrap_or(oversold), "oversold".to_string()),
    ]
}

impl Reconciler for OscillatorReconciler {
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
        match ctx.mode(id, payload)? {
            UpdateMode::Snapshot => {
                let values = payload
                    .values
                    .as_deref()
                    .ok_or_else(|| SyncError::malformed(id, "snapshot without values"))?;
                let axis = Axis::pick(payload.timestamps.as_deref(), ctx)
                    .ok_or_else(|| SyncError::malformed(id, "snapshot without a time axis"))?;
                let points = axis.align(values);
                let outcome = self.group.absorb_snapshot(&[points], surface)?;
                if self.levels.is_none() {
                    self.levels = Some(level_lines(&payload.metadata, self.default_levels));
                    self.push_levels(surface);
                }
                Ok(outcome)
            }
            mode => match self.group.tick_time(mode, payload, ctx)? {
                Some(time) => self.group.apply_tick(time, &[payload.value], surface),
                None => Ok(UpdateOutcome::Ignored),
            },
        }
    }

    fn republish(&self, surface: &mut dyn RenderSurface) {
        self.group.publish_all(surface);
        self.push_levels(surface);
    }

    fn levels(&self) -> &[LevelLine] {
        self.levels.as_deref().unwrap_or_default()
    }
}
