//! Per-mapping message counters.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::context::Tenant;
use crate::model::Mapping;

/// Status id under which messages without a matching rule are counted.
pub const UNSPECIFIED: &str = "UNSPECIFIED";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingStatus {
    pub id: String,
    pub ident: String,
    pub subscription_topic: String,
    pub messages_received: u64,
    pub errors: u64,
    pub snooped_templates_total: u64,
}

#[derive(Debug, Default)]
pub struct MappingStatusTracker {
    statuses: Mutex<HashMap<Tenant, HashMap<String, MappingStatus>>>,
}

impl MappingStatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, tenant: &Tenant, id: &str, init: impl FnOnce() -> MappingStatus, f: impl FnOnce(&mut MappingStatus)) {
        let mut guard = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        let status = guard
            .entry(tenant.clone())
            .or_default()
            .entry(id.to_string())
            .or_insert_with(init);
        f(status);
    }

    fn for_mapping(mapping: &Mapping) -> impl FnOnce() -> MappingStatus + '_ {
        move || MappingStatus {
            id: mapping.id.clone(),
            ident: mapping.ident.clone(),
            subscription_topic: mapping.subscription_topic.clone(),
            ..Default::default()
        }
    }

    pub fn received(&self, tenant: &Tenant, mapping: &Mapping) {
        self.update(tenant, &mapping.id, Self::for_mapping(mapping), |s| s.messages_received += 1);
    }

    pub fn error(&self, tenant: &Tenant, mapping: &Mapping) {
        self.update(tenant, &mapping.id, Self::for_mapping(mapping), |s| s.errors += 1);
    }

    pub fn snooped(&self, tenant: &Tenant, mapping: &Mapping) {
        self.update(tenant, &mapping.id, Self::for_mapping(mapping), |s| {
            s.snooped_templates_total += 1
        });
    }

    /// Count a message no rule matched.
    pub fn unmatched(&self, tenant: &Tenant) {
        let init = || MappingStatus {
            id: UNSPECIFIED.to_string(),
            ident: UNSPECIFIED.to_string(),
            ..Default::default()
        };
        self.update(tenant, UNSPECIFIED, init, |s| s.messages_received += 1);
    }

    pub fn forget(&self, tenant: &Tenant, id: &str) {
        if let Some(statuses) = self
            .statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(tenant)
        {
            statuses.remove(id);
        }
    }

    /// Statuses of one tenant ordered by id.
    pub fn snapshot(&self, tenant: &Tenant) -> Vec<MappingStatus> {
        let guard = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<MappingStatus> = guard
            .get(tenant)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}
