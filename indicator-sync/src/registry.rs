//! The set of live indicators: create/update/destroy diffing, routing and
//! visibility.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use data_feed::{IndicatorInfo, IndicatorPayloads, UpdatePayload};
use ts_core::TimePoint;

use crate::config::EngineConfig;
use crate::kind::classify;
use crate::reconciler::{create_reconciler, Reconciler, UpdateContext, UpdateOutcome};
use crate::surface::RenderSurface;
use crate::{IndicatorDescriptor, IndicatorId, SyncError};

/// Generation-checked reference to a registry slot. A handle to a destroyed
/// indicator never resolves, even after its slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct IndicatorHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<Box<dyn Reconciler>>,
}

/// What one `sync` (or update batch) did, per indicator id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub created: Vec<IndicatorId>,
    pub updated: Vec<IndicatorId>,
    pub removed: Vec<IndicatorId>,
    /// Payloads that were accepted but had no effect (e.g. ticks before the
    /// first snapshot, or ids that are not active).
    pub ignored: Vec<IndicatorId>,
    #[serde(serialize_with = "errors_as_strings")]
    pub skipped: Vec<SyncError>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.ignored.is_empty()
            && self.skipped.is_empty()
    }

    fn record(&mut self, id: &IndicatorId, result: Result<UpdateOutcome, SyncError>) {
        match result {
            Ok(UpdateOutcome::Ignored) => self.ignored.push(id.clone()),
            Ok(_) => self.updated.push(id.clone()),
            Err(err) => self.skip(err),
        }
    }

    fn skip(&mut self, err: SyncError) {
        warn!(error = %err, "indicator payload skipped");
        self.skipped.push(err);
    }
}

fn errors_as_strings<S: Serializer>(errors: &[SyncError], s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(errors.iter().map(ToString::to_string))
}

/// Fill hints the caller left out from the hints carried by the payload.
fn merge_hints(mut info: IndicatorInfo, payload: Option<&UpdatePayload>) -> IndicatorInfo {
    if let Some(hints) = payload.map(|p| p.info(&info.id)) {
        info.name = info.name.or(hints.name);
        info.kind = info.kind.or(hints.kind);
        info.overlay = info.overlay.or(hints.overlay);
        info.axis_group = info.axis_group.or(hints.axis_group);
        info.color = info.color.or(hints.color);
    }
    info
}

/// Owns every reconciler. Ids map to arena handles; all creation and
/// destruction goes through this type.
#[derive(Debug)]
pub struct IndicatorRegistry {
    config: EngineConfig,
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_id: BTreeMap<IndicatorId, IndicatorHandle>,
}

impl IndicatorRegistry {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            slots: Vec::new(),
            free: Vec::new(),
            by_id: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn indicator_count(&self) -> usize {
        self.by_id.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &IndicatorId> {
        self.by_id.keys()
    }

    pub fn handle(&self, id: &str) -> Option<IndicatorHandle> {
        self.by_id.get(id).copied()
    }

    pub fn get(&self, handle: IndicatorHandle) -> Result<&dyn Reconciler, SyncError> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_deref())
            .ok_or(SyncError::StaleHandle)
    }

    fn get_mut(
        &mut self,
        handle: IndicatorHandle,
    ) -> Result<&mut (dyn Reconciler + 'static), SyncError> {
        match self.slots.get_mut(handle.index as usize) {
            Some(slot) if slot.generation == handle.generation => {
                slot.entry.as_deref_mut().ok_or(SyncError::StaleHandle)
            }
            _ => Err(SyncError::StaleHandle),
        }
    }

    pub fn reconciler(&self, id: &str) -> Option<&dyn Reconciler> {
        self.handle(id).and_then(|h| self.get(h).ok())
    }

    fn reconciler_mut(&mut self, id: &str) -> Result<&mut (dyn Reconciler + 'static), SyncError> {
        let handle = self
            .handle(id)
            .ok_or_else(|| SyncError::UnknownIndicator(IndicatorId::from(id)))?;
        self.get_mut(handle)
    }

    /// Active descriptors in id order, e.g. to persist the indicator set.
    pub fn descriptors(&self) -> Vec<IndicatorDescriptor> {
        self.by_id
            .keys()
            .filter_map(|id| self.reconciler(id.as_str()))
            .map(|r| r.descriptor().clone())
            .collect()
    }

    pub fn points(&self, id: &str, line: &str) -> Option<&[TimePoint]> {
        self.reconciler(id).and_then(|r| r.points(line))
    }

    fn insert(&mut self, reconciler: Box<dyn Reconciler>) -> IndicatorHandle {
        let id = reconciler.descriptor().id.clone();
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(reconciler);
                IndicatorHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(reconciler),
                });
                IndicatorHandle {
                    index,
                    generation: 0,
                }
            }
        };
        self.by_id.insert(id, handle);
        handle
    }

    fn take(&mut self, id: &str) -> Option<Box<dyn Reconciler>> {
        let handle = self.by_id.remove(id)?;
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let entry = slot.entry.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        entry
    }

    /// Resolve a descriptor and build an attached reconciler, optionally fed
    /// with its first payload. Nothing is registered unless every step works.
    fn create(
        &mut self,
        info: IndicatorInfo,
        payload: Option<&UpdatePayload>,
        ctx: &UpdateContext<'_>,
        surface: &mut dyn RenderSurface,
    ) -> Result<(IndicatorHandle, UpdateOutcome), SyncError> {
        let id = IndicatorId::new(info.id.clone());
        if self.by_id.contains_key(&id) {
            return Err(SyncError::DuplicateIndicator(id));
        }
        let info = merge_hints(info, payload);
        let classification = classify(&info, payload).map_err(|err| {
            SyncError::UnknownIndicatorKind {
                id: id.clone(),
                kind: err.0,
            }
        })?;
        let descriptor = IndicatorDescriptor::from_info(&info, classification);
        let mut reconciler = create_reconciler(descriptor, &self.config);
        reconciler.attach(surface);

        let outcome = match payload {
            Some(payload) => match reconciler.update_data(payload, ctx, surface) {
                Ok(outcome) => outcome,
                Err(err) => {
                    reconciler.detach(surface);
                    return Err(err);
                }
            },
            None => UpdateOutcome::Ignored,
        };
        debug!(indicator = %id, kind = %reconciler.kind(), "indicator created");
        Ok((self.insert(reconciler), outcome))
    }

    /// Register an indicator from the UI. It stays empty until data arrives.
    pub fn add_indicator(
        &mut self,
        info: IndicatorInfo,
        surface: &mut dyn RenderSurface,
    ) -> Result<IndicatorHandle, SyncError> {
        self.create(info, None, &UpdateContext::default(), surface)
            .map(|(handle, _)| handle)
    }

    pub fn remove_indicator(
        &mut self,
        id: &str,
        surface: &mut dyn RenderSurface,
    ) -> Result<IndicatorDescriptor, SyncError> {
        let mut reconciler = self
            .take(id)
            .ok_or_else(|| SyncError::UnknownIndicator(IndicatorId::from(id)))?;
        reconciler.detach(surface);
        debug!(indicator = %id, "indicator destroyed");
        Ok(reconciler.descriptor().clone())
    }

    /// Only changes what is pushed to the surface; caches keep updating.
    pub fn set_visible(
        &mut self,
        id: &str,
        visible: bool,
        surface: &mut dyn RenderSurface,
    ) -> Result<(), SyncError> {
        self.reconciler_mut(id)?.set_visible(visible, surface);
        Ok(())
    }

    /// Destroy every indicator.
    pub fn clear(&mut self, surface: &mut dyn RenderSurface) -> Vec<IndicatorId> {
        let ids: Vec<IndicatorId> = self.by_id.keys().cloned().collect();
        for id in &ids {
            if let Some(mut reconciler) = self.take(id.as_str()) {
                reconciler.detach(surface);
            }
        }
        ids
    }

    /// Route one payload to an existing indicator.
    pub fn route(
        &mut self,
        id: &str,
        payload: &UpdatePayload,
        ctx: &UpdateContext<'_>,
        surface: &mut dyn RenderSurface,
    ) -> Result<UpdateOutcome, SyncError> {
        self.reconciler_mut(id)?.update_data(payload, ctx, surface)
    }

    /// Make the active set equal to `desired`: update ids present in both,
    /// destroy ids no longer desired, then create the new ones.
    pub fn sync(
        &mut self,
        desired: &IndicatorPayloads,
        ctx: &UpdateContext<'_>,
        surface: &mut dyn RenderSurface,
    ) -> SyncReport {
        let mut report = SyncReport::default();

        let active: Vec<IndicatorId> = self.by_id.keys().cloned().collect();
        for id in &active {
            if let Some(payload) = desired.get(id.as_str()) {
                let result = self.route(id.as_str(), payload, ctx, surface);
                report.record(id, result);
            }
        }

        for id in active.iter().filter(|id| !desired.contains_key(id.as_str())) {
            if self.remove_indicator(id.as_str(), surface).is_ok() {
                report.removed.push(id.clone());
            }
        }

        let fresh: Vec<(&String, &UpdatePayload)> = desired
            .iter()
            .filter(|(id, _)| !self.contains(id.as_str()))
            .collect();
        for (id, payload) in fresh {
            self.create_into(IndicatorInfo::new(id.as_str()), payload, ctx, surface, &mut report);
        }

        info!(
            active = self.indicator_count(),
            created = report.created.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            skipped = report.skipped.len(),
            "indicator sync"
        );
        report
    }

    /// Route payloads to ids that already exist; never creates or destroys.
    pub fn update_existing(
        &mut self,
        payloads: &IndicatorPayloads,
        ctx: &UpdateContext<'_>,
        surface: &mut dyn RenderSurface,
    ) -> SyncReport {
        let mut report = SyncReport::default();
        for (id, payload) in payloads {
            let id = IndicatorId::from(id.as_str());
            if !self.contains(id.as_str()) {
                debug!(indicator = %id, "payload for inactive indicator ignored");
                report.ignored.push(id);
                continue;
            }
            let result = self.route(id.as_str(), payload, ctx, surface);
            report.record(&id, result);
        }
        report
    }

    /// Update ids that exist and create the rest; never destroys. `info`
    /// supplies the descriptor hints for the indicator it names.
    pub fn create_or_update(
        &mut self,
        info: Option<&IndicatorInfo>,
        payloads: &IndicatorPayloads,
        ctx: &UpdateContext<'_>,
        surface: &mut dyn RenderSurface,
    ) -> SyncReport {
        let mut report = SyncReport::default();
        for (id, payload) in payloads {
            if self.contains(id) {
                let result = self.route(id, payload, ctx, surface);
                report.record(&IndicatorId::from(id.as_str()), result);
                continue;
            }
            let hints = info
                .filter(|i| i.id == *id)
                .cloned()
                .unwrap_or_else(|| IndicatorInfo::new(id.as_str()));
            self.create_into(hints, payload, ctx, surface, &mut report);
        }
        // Acknowledged without data: register it empty.
        let unseen = info.filter(|i| !self.contains(&i.id) && !payloads.contains_key(&i.id));
        if let Some(info) = unseen {
            match self.add_indicator(info.clone(), surface) {
                Ok(_) => report.created.push(IndicatorId::from(info.id.as_str())),
                Err(err) => report.skip(err),
            }
        }
        report
    }

    fn create_into(
        &mut self,
        info: IndicatorInfo,
        payload: &UpdatePayload,
        ctx: &UpdateContext<'_>,
        surface: &mut dyn RenderSurface,
        report: &mut SyncReport,
    ) {
        let id = IndicatorId::from(info.id.as_str());
        match self.create(info, Some(payload), ctx, surface) {
            Ok(_) => report.created.push(id),
            Err(err) => report.skip(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::RecordingSurface;
    use crate::{IndicatorKind, ReconcilerPhase};

    fn payloads(json: &str) -> IndicatorPayloads {
        serde_json::from_str(json).unwrap()
    }

    fn registry() -> IndicatorRegistry {
        IndicatorRegistry::new(EngineConfig::default())
    }

    #[test]
    fn churn_destroys_keeps_and_creates() {
        let mut surface = RecordingSurface::new();
        let mut reg = registry();
        let ctx = UpdateContext::default();
        let first = payloads(
            r#"{"A":{"name":"SMA 5","values":[1,2],"timestamps":[60,120]},
                "B":{"name":"EMA 5","values":[3,4],"timestamps":[60,120]}}"#,
        );
        let report = reg.sync(&first, &ctx, &mut surface);
        assert_eq!(report.created.len(), 2);
        let b_before = reg.points("B", "main").unwrap().to_vec();

        let second = payloads(
            r#"{"B":{"values":[3,4],"timestamps":[60,120]},
                "C":{"name":"ATR 14","values":[0.5],"timestamps":[120]}}"#,
        );
        let report = reg.sync(&second, &ctx, &mut surface);
        assert_eq!(report.removed, vec![IndicatorId::from("A")]);
        assert_eq!(report.created, vec![IndicatorId::from("C")]);
        assert!(!reg.contains("A"));
        assert_eq!(reg.points("B", "main").unwrap(), b_before.as_slice());
        assert_eq!(reg.points("C", "main").unwrap(), &[TimePoint::new(120, 0.5)]);
        assert_eq!(reg.indicator_count(), 2);
        assert!(surface.state("A", "main").is_none());
    }

    #[test]
    fn malformed_payload_keeps_existing_cache() {
        let mut surface = RecordingSurface::new();
        let mut reg = registry();
        let ctx = UpdateContext::default();
        reg.sync(&payloads(r#"{"A":{"values":[1,2],"timestamps":[60,120]}}"#), &ctx, &mut surface);
        let report = reg.sync(&payloads(r#"{"A":{}}"#), &ctx, &mut surface);
        assert!(matches!(report.skipped.as_slice(), [SyncError::MalformedPayload { .. }]));
        assert_eq!(reg.points("A", "main").map(<[_]>::len), Some(2));
    }

    #[test]
    fn unknown_kind_never_materializes() {
        let mut surface = RecordingSurface::new();
        let mut reg = registry();
        let report = reg.sync(
            &payloads(r#"{"X":{"kind":"hologram","values":[1],"timestamps":[60]}}"#),
            &UpdateContext::default(),
            &mut surface,
        );
        assert!(matches!(
            report.skipped.as_slice(),
            [SyncError::UnknownIndicatorKind { kind, .. }] if kind == "hologram"
        ));
        assert_eq!(reg.indicator_count(), 0);
        assert_eq!(surface.series_count(), 0);
    }

    #[test]
    fn malformed_first_payload_leaves_no_series_behind() {
        let mut surface = RecordingSurface::new();
        let mut reg = registry();
        let report = reg.sync(
            &payloads(r#"{"A":{"values":[1]}}"#),
            &UpdateContext::default(),
            &mut surface,
        );
        assert_eq!(report.skipped.len(), 1);
        assert!(!reg.contains("A"));
        assert_eq!(surface.series_count(), 0);
    }

    #[test]
    fn stale_handle_never_aliases_a_new_indicator() {
        let mut surface = RecordingSurface::new();
        let mut reg = registry();
        let old = reg.add_indicator(IndicatorInfo::new("A"), &mut surface).unwrap();
        reg.remove_indicator("A", &mut surface).unwrap();
        let new = reg.add_indicator(IndicatorInfo::new("B"), &mut surface).unwrap();
        assert!(matches!(reg.get(old), Err(SyncError::StaleHandle)));
        assert_eq!(reg.get(new).unwrap().descriptor().id.as_str(), "B");
        assert!(matches!(
            reg.add_indicator(IndicatorInfo::new("B"), &mut surface),
            Err(SyncError::DuplicateIndicator(_))
        ));
        assert!(matches!(
            reg.remove_indicator("A", &mut surface),
            Err(SyncError::UnknownIndicator(_))
        ));
    }

    #[test]
    fn visibility_is_non_destructive() {
        let mut surface = RecordingSurface::new();
        let mut reg = registry();
        let ctx = UpdateContext::default();
        reg.sync(
            &payloads(r#"{"A":{"values":[1,2,3],"timestamps":[60,120,180]}}"#),
            &ctx,
            &mut surface,
        );
        let before = surface.values("A", "main");

        reg.set_visible("A", false, &mut surface).unwrap();
        reg.update_existing(
            &payloads(r#"{"A":{"value":3.5,"live_time":180}}"#),
            &ctx,
            &mut surface,
        );
        assert_eq!(surface.values("A", "main"), before);
        assert_eq!(reg.points("A", "main").unwrap().last(), Some(&TimePoint::new(180, 3.5)));

        reg.set_visible("A", true, &mut surface).unwrap();
        assert_eq!(surface.values("A", "main"), vec![(60, 1.0), (120, 2.0), (180, 3.5)]);
        assert_eq!(surface.is_visible("A", "main"), Some(true));
    }

    #[test]
    fn update_existing_never_creates() {
        let mut surface = RecordingSurface::new();
        let mut reg = registry();
        let report = reg.update_existing(
            &payloads(r#"{"A":{"values":[1],"timestamps":[60]}}"#),
            &UpdateContext::default(),
            &mut surface,
        );
        assert_eq!(report.ignored, vec![IndicatorId::from("A")]);
        assert_eq!(reg.indicator_count(), 0);
    }

    #[test]
    fn create_or_update_uses_info_hints() {
        let mut surface = RecordingSurface::new();
        let mut reg = registry();
        let info = IndicatorInfo::new("ind_7").with_name("Keltner Channel");
        let report = reg.create_or_update(
            Some(&info),
            &payloads(r#"{"ind_7":{"timestamps":[60],"metadata":{"upper":[2],"lower":[1]}}}"#),
            &UpdateContext::default(),
            &mut surface,
        );
        assert_eq!(report.created, vec![IndicatorId::from("ind_7")]);
        let rec = reg.reconciler("ind_7").unwrap();
        assert_eq!(rec.kind(), IndicatorKind::Band);
        assert_eq!(rec.phase(), ReconcilerPhase::Synced);
        assert_eq!(rec.descriptor().display_name, "Keltner Channel");

        let other = IndicatorInfo::new("rsi").with_kind("oscillator");
        let report = reg.create_or_update(
            Some(&other),
            &IndicatorPayloads::new(),
            &UpdateContext::default(),
            &mut surface,
        );
        assert_eq!(report.created, vec![IndicatorId::from("rsi")]);
        assert_eq!(reg.reconciler("rsi").unwrap().phase(), ReconcilerPhase::AwaitingSnapshot);
    }

    #[test]
    fn descriptors_restore_the_indicator_set() {
        let mut surface = RecordingSurface::new();
        let mut reg = registry();
        reg.add_indicator(IndicatorInfo::new("macd_1").with_name("MACD"), &mut surface)
            .unwrap();
        reg.add_indicator(IndicatorInfo::new("bb").with_kind("bollinger"), &mut surface)
            .unwrap();
        reg.set_visible("bb", false, &mut surface).unwrap();
        let saved = reg.descriptors();

        let mut restored = registry();
        let mut other_surface = RecordingSurface::new();
        for desc in &saved {
            restored.add_indicator(desc.to_info(), &mut other_surface).unwrap();
        }
        assert_eq!(restored.descriptors(), saved);
        assert_eq!(other_surface.is_visible("bb", "upper"), Some(false));
    }
}
