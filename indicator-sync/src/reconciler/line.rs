use data_feed::UpdatePayload;

use super::series::{Axis, SeriesGroup};
use super::{Reconciler, UpdateContext, UpdateMode, UpdateOutcome};
use crate::config::EngineConfig;
use crate::surface::RenderSurface;
use crate::{IndicatorDescriptor, SyncError};

/// Single-line indicators: moving averages, ATR, OBV and the like.
#[derive(Debug)]
pub struct LineReconciler {
    group: SeriesGroup,
}

impl LineReconciler {
    pub fn new(descriptor: IndicatorDescriptor, config: &EngineConfig) -> Self {
        Self {
            group: SeriesGroup::new(descriptor, config),
        }
    }
}

impl Reconciler for LineReconciler {
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
                self.group.absorb_snapshot(&[points], surface)
            }
            mode => match self.group.tick_time(mode, payload, ctx)? {
                Some(time) => self.group.apply_tick(time, &[payload.value], surface),
                None => Ok(UpdateOutcome::Ignored),
            },
        }
    }
}
