//! Message dispatch and the worker pool.
//!
//! Every inbound message is matched against the tenant's current snapshot.
//! Each matching rule gets its own [`ProcessingContext`]; one rule failing
//! does not affect the others, and no failure stops a worker.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServiceConfiguration;
use crate::context::{ProcessingContext, TargetRequest, Tenant};
use crate::error::ProcessingError;
use crate::mapping_registry::MappingRegistry;
use crate::model::Mapping;
use crate::outbound::{self, OutboundMessage};
use crate::platform::TargetPlatform;
use crate::processor::ProcessorSet;
use crate::status::MappingStatusTracker;
use crate::substitution::SubstitutionEngine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub tenant: Tenant,
    pub topic: String,
    pub payload: Vec<u8>,
}

/// What happened to one inbound message.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Ids of the rules that processed the message.
    pub matched: Vec<String>,
    /// Ids of the snooping rules that only sampled it.
    pub snooped: Vec<String>,
    pub requests: Vec<TargetRequest>,
    /// `(mapping id, error)` for rules that failed as a whole.
    pub failures: Vec<(String, String)>,
}

impl DispatchReport {
    pub fn is_unmatched(&self) -> bool {
        self.matched.is_empty() && self.snooped.is_empty()
    }
}

pub struct Dispatcher {
    registry: Arc<MappingRegistry>,
    processors: ProcessorSet,
    platform: Arc<dyn TargetPlatform>,
    status: Arc<MappingStatusTracker>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<MappingRegistry>,
        processors: ProcessorSet,
        platform: Arc<dyn TargetPlatform>,
        status: Arc<MappingStatusTracker>,
    ) -> Self {
        Self {
            registry,
            processors,
            platform,
            status,
        }
    }

    pub async fn process(&self, message: &InboundMessage) -> DispatchReport {
        let snapshot = self.registry.snapshot(&message.tenant);
        let configuration = &snapshot.configuration;
        let mut report = DispatchReport::default();

        if configuration.log_payload {
            info!(
                tenant = %message.tenant,
                topic = %message.topic,
                payload = %String::from_utf8_lossy(&message.payload),
                "inbound message"
            );
        }

        let mappings = snapshot.resolve_inbound(&message.topic);
        if mappings.is_empty() {
            debug!(tenant = %message.tenant, topic = %message.topic, "no mapping matches topic");
            self.status.unmatched(&message.tenant);
            return report;
        }

        for mapping in mappings {
            self.status.received(&message.tenant, &mapping);

            if mapping.is_snooping() {
                self.snoop(message, &mapping).await;
                report.snooped.push(mapping.id.clone());
                continue;
            }

            report.matched.push(mapping.id.clone());
            match self.process_mapping(message, Arc::clone(&mapping), configuration).await {
                Ok(requests) => {
                    for failed in requests.iter().filter(|r| r.failed()) {
                        debug!(mapping = %mapping.id, index = failed.index, "request failed");
                        self.status.error(&message.tenant, &mapping);
                    }
                    report.requests.extend(requests);
                }
                Err(e) => {
                    warn!(
                        tenant = %message.tenant,
                        topic = %message.topic,
                        mapping = %mapping.id,
                        error = %e,
                        "message processing failed"
                    );
                    self.status.error(&message.tenant, &mapping);
                    report.failures.push((mapping.id.clone(), e.to_string()));
                }
            }
        }
        report
    }

    async fn process_mapping(
        &self,
        message: &InboundMessage,
        mapping: Arc<Mapping>,
        configuration: &ServiceConfiguration,
    ) -> Result<Vec<TargetRequest>, ProcessingError> {
        let processor = self.processors.get(mapping.mapping_type)?;
        let mut context = ProcessingContext::new(
            message.tenant.clone(),
            message.topic.clone(),
            mapping,
            &message.payload,
        );
        processor.decode(&mut context, &message.payload)?;

        SubstitutionEngine::new(Arc::clone(&self.platform))
            .with_substitution_logging(configuration.log_substitution)
            .expand(&mut context)
            .await
    }

    async fn snoop(&self, message: &InboundMessage, mapping: &Mapping) {
        let template = match std::str::from_utf8(&message.payload) {
            Ok(text) => text.to_string(),
            Err(_) => hex::encode(&message.payload),
        };
        match self
            .registry
            .record_snoop(&message.tenant, &mapping.id, template)
            .await
        {
            Ok(true) => self.status.snooped(&message.tenant, mapping),
            Ok(false) => debug!(mapping = %mapping.id, "snoop buffer full"),
            Err(e) => warn!(mapping = %mapping.id, error = %e, "could not store snooped payload"),
        }
    }

    /// Render a platform payload through every matching outbound rule.
    pub fn process_outbound(&self, tenant: &Tenant, payload: &Value) -> Vec<OutboundMessage> {
        let snapshot = self.registry.snapshot(tenant);
        let mut messages = Vec::new();
        for mapping in snapshot.resolve_outbound(payload) {
            self.status.received(tenant, &mapping);
            match outbound::render(tenant, Arc::clone(&mapping), payload) {
                Ok(rendered) => messages.extend(rendered),
                Err(e) => {
                    warn!(tenant = %tenant, mapping = %mapping.id, error = %e, "outbound rendering failed");
                    self.status.error(tenant, &mapping);
                }
            }
        }
        messages
    }
}

// ------------------------------------------------------------------ //
//  Worker pool                                                        //
// ------------------------------------------------------------------ //

/// Start `workers` tasks draining one shared queue. They exit once every
/// sender is dropped.
pub fn spawn_workers(
    dispatcher: Arc<Dispatcher>,
    rx: mpsc::Receiver<InboundMessage>,
    workers: usize,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..workers.max(1))
        .map(|worker| {
            let rx = Arc::clone(&rx);
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(message) = next else {
                        debug!(worker, "queue closed, worker exiting");
                        return;
                    };
                    let report = dispatcher.process(&message).await;
                    debug!(
                        worker,
                        topic = %message.topic,
                        matched = report.matched.len(),
                        requests = report.requests.len(),
                        "message dispatched"
                    );
                }
            })
        })
        .collect()
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //
