//! Active mapping rules per tenant.
//!
//! Readers take an `Arc<MappingSnapshot>` and keep it for the whole message.
//! Writers are serialised by an async gate, persist the full rule list, then
//! swap in a fresh snapshot; an active rule is never edited in place.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use jsonpath_lib::select;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::ServiceConfiguration;
use crate::context::Tenant;
use crate::model::{Direction, Mapping, SnoopStatus, ValidationError};
use crate::processor::json::json_path;
use crate::store::MappingStore;
use crate::topic::{self, TopicMatcher};
use crate::validation;

/// Upper bound of payload samples kept on a snooping rule.
pub const MAX_SNOOPED_TEMPLATES: usize = 10;

#[derive(Debug, Error)]
pub enum MappingChangeError {
    #[error("mapping is invalid: {0:?}")]
    Invalid(Vec<ValidationError>),
    #[error("mapping {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

// ------------------------------------------------------------------ //
//  Snapshot                                                           //
// ------------------------------------------------------------------ //

#[derive(Debug, Default)]
pub struct MappingSnapshot {
    pub mappings: Vec<Arc<Mapping>>,
    pub configuration: ServiceConfiguration,
    /// Active inbound rules with their mapping topic compiled, in rule order.
    inbound: Vec<(Arc<Mapping>, TopicMatcher)>,
}

impl MappingSnapshot {
    fn new(mappings: Vec<Mapping>, configuration: ServiceConfiguration) -> Self {
        let mappings: Vec<Arc<Mapping>> = mappings.into_iter().map(Arc::new).collect();
        let inbound = mappings
            .iter()
            .filter(|m| m.active && m.direction == Direction::Inbound)
            .filter_map(|m| match TopicMatcher::new(&m.mapping_topic) {
                Ok(matcher) => Some((Arc::clone(m), matcher)),
                Err(e) => {
                    warn!(mapping = %m.id, topic = %m.mapping_topic, error = %e, "mapping topic not usable");
                    None
                }
            })
            .collect();
        Self {
            mappings,
            configuration,
            inbound,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mapping>> {
        self.mappings.iter().find(|m| m.id == id).cloned()
    }

    fn owned(&self) -> Vec<Mapping> {
        self.mappings.iter().map(|m| Mapping::clone(m)).collect()
    }

    /// Active inbound rules whose mapping topic covers `topic`.
    pub fn resolve_inbound(&self, topic: &str) -> Vec<Arc<Mapping>> {
        let topic = topic::normalize(topic);
        self.inbound
            .iter()
            .filter(|(_, matcher)| matcher.covers(&topic))
            .map(|(m, _)| Arc::clone(m))
            .collect()
    }

    /// Active outbound rules whose filter selects something in `payload`.
    pub fn resolve_outbound(&self, payload: &Value) -> Vec<Arc<Mapping>> {
        self.mappings
            .iter()
            .filter(|m| m.active && m.direction == Direction::Outbound)
            .filter(|m| !m.filter_outbound.trim().is_empty())
            .filter(|m| {
                select(payload, &json_path(&m.filter_outbound))
                    .map(|found| found.iter().any(|v| !v.is_null()))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

// ------------------------------------------------------------------ //
//  Registry                                                           //
// ------------------------------------------------------------------ //

pub struct MappingRegistry {
    store: Arc<dyn MappingStore>,
    tenants: RwLock<HashMap<Tenant, Arc<MappingSnapshot>>>,
    write_gate: Mutex<()>,
}

impl MappingRegistry {
    pub fn new(store: Arc<dyn MappingStore>) -> Self {
        Self {
            store,
            tenants: RwLock::new(HashMap::new()),
            write_gate: Mutex::new(()),
        }
    }

    /// Current rules of `tenant`; empty until [`MappingRegistry::load`] ran.
    pub fn snapshot(&self, tenant: &Tenant) -> Arc<MappingSnapshot> {
        self.tenants
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(tenant)
            .cloned()
            .unwrap_or_default()
    }

    fn swap(&self, tenant: &Tenant, snapshot: MappingSnapshot) -> Arc<MappingSnapshot> {
        let snapshot = Arc::new(snapshot);
        self.tenants
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tenant.clone(), Arc::clone(&snapshot));
        snapshot
    }

    /// (Re)read rules and service configuration of `tenant` from the store.
    pub async fn load(&self, tenant: &Tenant) -> anyhow::Result<Arc<MappingSnapshot>> {
        let _gate = self.write_gate.lock().await;
        let mut mappings = self.store.load_mappings(tenant).await?;
        for m in &mut mappings {
            m.normalize_topics();
        }
        let configuration = self.store.load_configuration(tenant).await?;
        info!(tenant = %tenant, mappings = mappings.len(), "mappings loaded");
        Ok(self.swap(tenant, MappingSnapshot::new(mappings, configuration)))
    }

    /// Validate `candidate` against the current rules without storing it.
    pub fn validate(&self, tenant: &Tenant, candidate: &Mapping) -> Vec<ValidationError> {
        let mut candidate = candidate.clone();
        candidate.normalize_topics();
        validation::validate(&self.snapshot(tenant).owned(), &candidate)
    }

    async fn commit(
        &self,
        tenant: &Tenant,
        mappings: Vec<Mapping>,
        configuration: ServiceConfiguration,
    ) -> Result<(), MappingChangeError> {
        self.store.save_mappings(tenant, &mappings).await?;
        self.swap(tenant, MappingSnapshot::new(mappings, configuration));
        Ok(())
    }

    fn prepare(current: &MappingSnapshot, mut candidate: Mapping) -> Result<Mapping, MappingChangeError> {
        candidate.normalize_topics();
        let errors = validation::validate(&current.owned(), &candidate);
        if !errors.is_empty() {
            return Err(MappingChangeError::Invalid(errors));
        }
        candidate.last_update = chrono::Utc::now().timestamp_millis();
        Ok(candidate)
    }

    /// Validate and store a new rule under a fresh id.
    pub async fn create(&self, tenant: &Tenant, mut candidate: Mapping) -> Result<Mapping, MappingChangeError> {
        let _gate = self.write_gate.lock().await;
        let current = self.snapshot(tenant);

        candidate.id = uuid::Uuid::new_v4().to_string();
        let mapping = Self::prepare(&current, candidate)?;

        let mut next = current.owned();
        next.push(mapping.clone());
        self.commit(tenant, next, current.configuration.clone()).await?;
        info!(tenant = %tenant, mapping = %mapping.id, ident = %mapping.ident, "mapping created");
        Ok(mapping)
    }

    /// Validate and replace the rule with `id`.
    pub async fn update(&self, tenant: &Tenant, id: &str, mut candidate: Mapping) -> Result<Mapping, MappingChangeError> {
        let _gate = self.write_gate.lock().await;
        let current = self.snapshot(tenant);
        if current.get(id).is_none() {
            return Err(MappingChangeError::NotFound(id.to_string()));
        }

        candidate.id = id.to_string();
        let mapping = Self::prepare(&current, candidate)?;

        let next = current
            .owned()
            .into_iter()
            .map(|m| if m.id == id { mapping.clone() } else { m })
            .collect();
        self.commit(tenant, next, current.configuration.clone()).await?;
        info!(tenant = %tenant, mapping = %id, "mapping updated");
        Ok(mapping)
    }

    pub async fn delete(&self, tenant: &Tenant, id: &str) -> Result<Mapping, MappingChangeError> {
        let _gate = self.write_gate.lock().await;
        let current = self.snapshot(tenant);
        let removed = current
            .get(id)
            .ok_or_else(|| MappingChangeError::NotFound(id.to_string()))?;

        let next = current.owned().into_iter().filter(|m| m.id != id).collect();
        self.commit(tenant, next, current.configuration.clone()).await?;
        info!(tenant = %tenant, mapping = %id, "mapping deleted");
        Ok(Mapping::clone(&removed))
    }

    /// Keep a payload sample on a snooping rule and mark snooping as
    /// started. Samples beyond [`MAX_SNOOPED_TEMPLATES`] are dropped.
    pub async fn record_snoop(&self, tenant: &Tenant, id: &str, template: String) -> Result<bool, MappingChangeError> {
        let _gate = self.write_gate.lock().await;
        let current = self.snapshot(tenant);
        let mut mapping = current
            .get(id)
            .map(|m| Mapping::clone(&m))
            .ok_or_else(|| MappingChangeError::NotFound(id.to_string()))?;

        let kept = mapping.snooped_templates.len() < MAX_SNOOPED_TEMPLATES;
        if !kept && mapping.snoop_status != SnoopStatus::Enabled {
            return Ok(false);
        }
        if kept {
            mapping.snooped_templates.push(template);
        }
        if mapping.snoop_status == SnoopStatus::Enabled {
            mapping.snoop_status = SnoopStatus::Started;
        }

        let next = current
            .owned()
            .into_iter()
            .map(|m| if m.id == id { mapping.clone() } else { m })
            .collect();
        self.commit(tenant, next, current.configuration.clone()).await?;
        Ok(kept)
    }

    pub async fn set_configuration(&self, tenant: &Tenant, configuration: ServiceConfiguration) -> anyhow::Result<()> {
        let _gate = self.write_gate.lock().await;
        self.store.save_configuration(tenant, &configuration).await?;
        let current = self.snapshot(tenant);
        self.swap(tenant, MappingSnapshot::new(current.owned(), configuration));
        Ok(())
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //

#[cfg(test)]
mod tests {
    use serde_json::json;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::model::Substitution;
    use crate::store::InMemoryMappingStore;

    /// Counts rule list writes on top of an in-memory store.
    #[derive(Default)]
    struct CountingStore {
        inner: InMemoryMappingStore,
        saves: AtomicUsize,
    }

    #[async_trait]
    impl MappingStore for CountingStore {
        async fn load_mappings(&self, tenant: &Tenant) -> anyhow::Result<Vec<Mapping>> {
            self.inner.load_mappings(tenant).await
        }

        async fn save_mappings(&self, tenant: &Tenant, mappings: &[Mapping]) -> anyhow::Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner.save_mappings(tenant, mappings).await
        }

        async fn load_configuration(&self, tenant: &Tenant) -> anyhow::Result<ServiceConfiguration> {
            self.inner.load_configuration(tenant).await
        }

        async fn save_configuration(
            &self,
            tenant: &Tenant,
            configuration: &ServiceConfiguration,
        ) -> anyhow::Result<()> {
            self.inner.save_configuration(tenant, configuration).await
        }
    }

    fn rule(ident: &str, mapping_topic: &str) -> Mapping {
        Mapping {
            ident: ident.into(),
            active: true,
            subscription_topic: "device/#".into(),
            mapping_topic: mapping_topic.into(),
            substitutions: vec![Substitution::new("$.id", "source.id")],
            ..Default::default()
        }
    }

    fn registry() -> (MappingRegistry, InMemoryMappingStore) {
        let store = InMemoryMappingStore::new();
        (MappingRegistry::new(Arc::new(store.clone())), store)
    }

    #[tokio::test]
    async fn create_assigns_id_normalizes_and_persists() {
        let (reg, store) = registry();
        let tenant = Tenant::new("t100");

        let created = reg.create(&tenant, rule("temps", "device//+/temp//")).await.unwrap();
        assert!(!created.id.is_empty());
        assert_eq!(created.mapping_topic, "device//+/temp/");
        assert!(created.last_update > 0);

        assert_eq!(reg.snapshot(&tenant).mappings.len(), 1);
        assert_eq!(store.load_mappings(&tenant).await.unwrap(), vec![created]);
        assert!(reg.snapshot(&Tenant::new("other")).mappings.is_empty());
    }

    #[tokio::test]
    async fn invalid_rule_is_rejected_and_not_stored() {
        let (reg, store) = registry();
        let tenant = Tenant::new("t100");
        let bad = Mapping {
            substitutions: Vec::new(),
            ..rule("bad", "other/+")
        };

        match reg.create(&tenant, bad).await {
            Err(MappingChangeError::Invalid(errors)) => assert_eq!(
                errors,
                vec![
                    ValidationError::OneSubstitutionDefiningDeviceIdentifierMustBeUsed,
                    ValidationError::MappingTopicMustMatchTheSubscriptionTopic,
                ]
            ),
            other => panic!("unexpected {other:?}"),
        }
        assert!(store.load_mappings(&tenant).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn readers_keep_their_snapshot_across_updates() {
        let (reg, _) = registry();
        let tenant = Tenant::new("t100");
        let created = reg.create(&tenant, rule("v1", "device/+/temp")).await.unwrap();

        let before = reg.snapshot(&tenant);
        reg.update(&tenant, &created.id, rule("v2", "device/+/temp"))
            .await
            .unwrap();

        assert_eq!(before.mappings[0].ident, "v1");
        assert_eq!(reg.snapshot(&tenant).mappings[0].ident, "v2");
        assert_eq!(reg.snapshot(&tenant).mappings[0].id, created.id);
    }

    #[tokio::test]
    async fn update_and_delete_unknown_ids() {
        let (reg, _) = registry();
        let tenant = Tenant::new("t100");
        assert!(matches!(
            reg.update(&tenant, "nope", rule("x", "device/x")).await,
            Err(MappingChangeError::NotFound(_))
        ));
        assert!(matches!(
            reg.delete(&tenant, "nope").await,
            Err(MappingChangeError::NotFound(_))
        ));

        let created = reg.create(&tenant, rule("x", "device/x")).await.unwrap();
        let removed = reg.delete(&tenant, &created.id).await.unwrap();
        assert_eq!(removed.id, created.id);
        assert!(reg.snapshot(&tenant).mappings.is_empty());
    }

    #[tokio::test]
    async fn load_reads_store_and_configuration() {
        let (reg, store) = registry();
        let tenant = Tenant::new("t100");
        let stored = Mapping {
            id: "m1".into(),
            ..rule("stored", "///device/+/temp")
        };
        store.save_mappings(&tenant, &[stored]).await.unwrap();
        store
            .save_configuration(
                &tenant,
                &ServiceConfiguration {
                    log_substitution: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let snapshot = reg.load(&tenant).await.unwrap();
        assert_eq!(snapshot.mappings[0].mapping_topic, "/device/+/temp");
        assert!(snapshot.configuration.log_substitution);
    }

    #[tokio::test]
    async fn inbound_resolution_honours_topic_and_activity() {
        let (reg, _) = registry();
        let tenant = Tenant::new("t100");
        reg.create(&tenant, rule("temps", "device/+/temp")).await.unwrap();
        reg.create(&tenant, rule("all", "device/+/+")).await.unwrap();
        reg.create(
            &tenant,
            Mapping {
                active: false,
                ..rule("inactive", "device/+/temp")
            },
        )
        .await
        .unwrap();

        let snapshot = reg.snapshot(&tenant);
        let idents = |topic: &str| -> Vec<String> {
            snapshot
                .resolve_inbound(topic)
                .iter()
                .map(|m| m.ident.clone())
                .collect()
        };
        assert_eq!(snapshot.inbound.len(), 2);
        assert_eq!(idents("device/d1/temp"), vec!["temps", "all"]);
        assert_eq!(idents("device/d1/status"), vec!["all"]);
        assert!(idents("device/d1").is_empty());
    }

    #[tokio::test]
    async fn outbound_resolution_uses_filter() {
        let (reg, _) = registry();
        let tenant = Tenant::new("t100");
        let outbound = Mapping {
            ident: "out".into(),
            active: true,
            direction: Direction::Outbound,
            filter_outbound: "c8y_Temperature".into(),
            publish_topic: "evt/+".into(),
            publish_topic_sample: "evt/d1".into(),
            ..Default::default()
        };
        reg.create(&tenant, outbound).await.unwrap();

        let snapshot = reg.snapshot(&tenant);
        assert_eq!(snapshot.resolve_outbound(&json!({"c8y_Temperature": {"T": 1}})).len(), 1);
        assert!(snapshot.resolve_outbound(&json!({"c8y_Pressure": {}})).is_empty());
    }

    #[tokio::test]
    async fn snooping_collects_bounded_samples() {
        let (reg, _) = registry();
        let tenant = Tenant::new("t100");
        let snooping = Mapping {
            snoop_status: SnoopStatus::Enabled,
            substitutions: Vec::new(),
            ..rule("snoop", "device/+/raw")
        };
        let created = reg.create(&tenant, snooping).await.unwrap();

        for i in 0..MAX_SNOOPED_TEMPLATES {
            assert!(reg.record_snoop(&tenant, &created.id, format!("{{\"i\": {i}}}")).await.unwrap());
        }
        assert!(!reg.record_snoop(&tenant, &created.id, "{}".into()).await.unwrap());

        let stored = reg.snapshot(&tenant).get(&created.id).unwrap();
        assert_eq!(stored.snoop_status, SnoopStatus::Started);
        assert_eq!(stored.snooped_templates.len(), MAX_SNOOPED_TEMPLATES);
    }

    #[tokio::test]
    async fn full_snoop_buffer_is_not_rewritten() {
        let store = Arc::new(CountingStore::default());
        let reg = MappingRegistry::new(store.clone());
        let tenant = Tenant::new("t100");
        let snooping = Mapping {
            snoop_status: SnoopStatus::Enabled,
            substitutions: Vec::new(),
            ..rule("snoop", "device/+/raw")
        };
        let created = reg.create(&tenant, snooping).await.unwrap();
        for i in 0..MAX_SNOOPED_TEMPLATES {
            reg.record_snoop(&tenant, &created.id, format!("{i}")).await.unwrap();
        }
        let saves = store.saves.load(Ordering::SeqCst);
        assert_eq!(saves, 1 + MAX_SNOOPED_TEMPLATES);

        let before = reg.snapshot(&tenant);
        for _ in 0..100 {
            assert!(!reg.record_snoop(&tenant, &created.id, "{}".into()).await.unwrap());
        }
        assert_eq!(store.saves.load(Ordering::SeqCst), saves);
        assert!(Arc::ptr_eq(&before, &reg.snapshot(&tenant)));
    }
}
