//! Processor extension registry.
//!
//! An extension artifact ships a manifest of `event=symbol` lines. Each
//! symbol is resolved through the artifact's [`ExtensionLoader`], must yield
//! the inbound processor capability, and for external artifacts must live in
//! [`EXTERNAL_NAMESPACE`]. Failures are recorded on the entry and never keep
//! the other entries from loading.
//!
//! `reload` builds the new set without holding the lock and swaps it in
//! whole. Lookups hand out `Arc` handles, so a message that already has its
//! processor finishes on that version.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::context::{ProcessingContext, Tenant};
use crate::error::ProcessingError;

pub const EXTERNAL_NAMESPACE: &str = "mapping.processor.extension.external";
pub const INTERNAL_NAMESPACE: &str = "mapping.processor.extension.internal";

// ------------------------------------------------------------------ //
//  Contract                                                           //
// ------------------------------------------------------------------ //

/// What an extension entry must implement to process inbound payloads.
///
/// The context payload holds the raw bytes as [`crate::context::Payload::Binary`].
pub trait ProcessorExtension: Send + Sync {
    fn extract_from_source(&self, context: &mut ProcessingContext) -> Result<(), ProcessingError>;
}

/// What a resolved symbol turned out to be.
pub enum Capability {
    InboundProcessor(Arc<dyn ProcessorExtension>),
    /// Anything else; the string names the kind for the status message.
    Unsupported(&'static str),
}

/// Instantiates the object behind one symbol.
pub type SymbolFactory = fn() -> Result<Capability, String>;

/// Symbol table of one artifact.
pub trait ExtensionLoader: Send + Sync {
    fn resolve(&self, symbol: &str) -> Option<SymbolFactory>;
}

#[derive(Clone)]
pub struct ExtensionArtifact {
    pub id: String,
    pub name: String,
    pub external: bool,
    /// Manifest text; `None` when the artifact carries none.
    pub manifest: Option<String>,
    pub loader: Arc<dyn ExtensionLoader>,
}

/// Where extension artifacts come from.
#[async_trait]
pub trait ExtensionSource: Send + Sync {
    async fn artifacts(&self, tenant: &Tenant) -> Result<Vec<ExtensionArtifact>, ExtensionError>;
}

#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("manifest is missing")]
    MissingManifest,
    #[error("symbol {0} not found")]
    SymbolNotFound(String),
    #[error("symbol {symbol} is a {kind}, not an inbound processor")]
    NotAProcessor { symbol: String, kind: &'static str },
    #[error("external symbol {0} is outside namespace mapping.processor.extension.external")]
    NamespaceViolation(String),
    #[error("could not instantiate {symbol}: {reason}")]
    Instantiation { symbol: String, reason: String },
    #[error("extension {0} not found")]
    NotFound(String),
}

// ------------------------------------------------------------------ //
//  Status                                                             //
// ------------------------------------------------------------------ //

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryState {
    Unloaded,
    Loading,
    Loaded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtensionStatus {
    Complete,
    Partially,
    NotLoaded,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionEntry {
    pub event: String,
    pub symbol: String,
    pub state: EntryState,
    pub message: Option<String>,
    #[serde(skip)]
    pub implementation: Option<Arc<dyn ProcessorExtension>>,
}

impl std::fmt::Debug for ExtensionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionEntry")
            .field("event", &self.event)
            .field("symbol", &self.symbol)
            .field("state", &self.state)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Extension {
    pub id: String,
    pub name: String,
    pub external: bool,
    pub status: ExtensionStatus,
    pub message: Option<String>,
    pub entries: BTreeMap<String, ExtensionEntry>,
}

impl Extension {
    fn roll_up(entries: &BTreeMap<String, ExtensionEntry>) -> ExtensionStatus {
        let loaded = entries
            .values()
            .filter(|e| e.state == EntryState::Loaded)
            .count();
        match loaded {
            0 => ExtensionStatus::NotLoaded,
            n if n == entries.len() => ExtensionStatus::Complete,
            _ => ExtensionStatus::Partially,
        }
    }
}

// ------------------------------------------------------------------ //
//  Manifest                                                           //
// ------------------------------------------------------------------ //

/// Parse properties-style `key=value` (or `key: value`) lines. Blank lines
/// and lines starting with `#` or `!` are skipped; later keys win.
pub fn parse_manifest(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with('!'))
        .filter_map(|l| {
            let split = l.find(['=', ':'])?;
            let (key, value) = (l[..split].trim(), l[split + 1..].trim());
            (!key.is_empty() && !value.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

// ------------------------------------------------------------------ //
//  Loading                                                            //
// ------------------------------------------------------------------ //

/// `symbol` lies inside the dotted `namespace`, not merely sharing a prefix.
pub fn in_namespace(symbol: &str, namespace: &str) -> bool {
    symbol
        .strip_prefix(namespace)
        .is_some_and(|rest| rest.starts_with('.'))
}

fn admit(
    artifact: &ExtensionArtifact,
    symbol: &str,
) -> Result<Arc<dyn ProcessorExtension>, ExtensionError> {
    if artifact.external && !in_namespace(symbol, EXTERNAL_NAMESPACE) {
        return Err(ExtensionError::NamespaceViolation(symbol.to_string()));
    }
    let factory = artifact
        .loader
        .resolve(symbol)
        .ok_or_else(|| ExtensionError::SymbolNotFound(symbol.to_string()))?;
    match factory().map_err(|reason| ExtensionError::Instantiation {
        symbol: symbol.to_string(),
        reason,
    })? {
        Capability::InboundProcessor(processor) => Ok(processor),
        Capability::Unsupported(kind) => Err(ExtensionError::NotAProcessor {
            symbol: symbol.to_string(),
            kind,
        }),
    }
}

fn load_entry(artifact: &ExtensionArtifact, entry: &mut ExtensionEntry) {
    entry.state = EntryState::Loading;
    match admit(artifact, &entry.symbol) {
        Ok(processor) => {
            entry.state = EntryState::Loaded;
            entry.implementation = Some(processor);
        }
        Err(e) => {
            warn!(extension = %artifact.name, event = %entry.event, error = %e, "extension entry failed");
            entry.state = EntryState::Failed;
            entry.message = Some(e.to_string());
        }
    }
}

/// Turn one artifact into an [`Extension`], loading entries unless the
/// artifact is external and external extensions are disabled.
pub fn load_extension(artifact: &ExtensionArtifact, external_enabled: bool) -> Extension {
    let mut extension = Extension {
        id: artifact.id.clone(),
        name: artifact.name.clone(),
        external: artifact.external,
        status: ExtensionStatus::NotLoaded,
        message: None,
        entries: BTreeMap::new(),
    };

    let Some(manifest) = &artifact.manifest else {
        extension.message = Some(ExtensionError::MissingManifest.to_string());
        return extension;
    };

    extension.entries = parse_manifest(manifest)
        .into_iter()
        .map(|(event, symbol)| {
            let entry = ExtensionEntry {
                event: event.clone(),
                symbol,
                state: EntryState::Unloaded,
                message: None,
                implementation: None,
            };
            (event, entry)
        })
        .collect();

    if artifact.external && !external_enabled {
        extension.message = Some("external extensions are disabled".to_string());
        return extension;
    }

    for entry in extension.entries.values_mut() {
        load_entry(artifact, entry);
    }
    extension.status = Extension::roll_up(&extension.entries);
    extension
}

// ------------------------------------------------------------------ //
//  Registry                                                           //
// ------------------------------------------------------------------ //

type ExtensionSet = Arc<BTreeMap<String, Extension>>;

pub struct ExtensionRegistry {
    source: Arc<dyn ExtensionSource>,
    extensions: RwLock<ExtensionSet>,
}

impl ExtensionRegistry {
    pub fn new(source: Arc<dyn ExtensionSource>) -> Self {
        Self {
            source,
            extensions: RwLock::new(Arc::new(BTreeMap::new())),
        }
    }

    fn current(&self) -> ExtensionSet {
        self.extensions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn swap(&self, next: ExtensionSet) {
        *self.extensions.write().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// Rebuild the whole set from the source and swap it in.
    pub async fn reload(&self, tenant: &Tenant, external_enabled: bool) -> Result<usize, ExtensionError> {
        let artifacts = self.source.artifacts(tenant).await?;
        let next: BTreeMap<String, Extension> = artifacts
            .iter()
            .map(|a| (a.name.clone(), load_extension(a, external_enabled)))
            .collect();

        for ext in next.values() {
            info!(
                tenant = %tenant,
                extension = %ext.name,
                status = ?ext.status,
                entries = ext.entries.len(),
                "extension loaded"
            );
        }
        let count = next.len();
        self.swap(Arc::new(next));
        Ok(count)
    }

    /// The loaded processor for `event` of extension `name`.
    pub fn processor(&self, name: &str, event: &str) -> Option<Arc<dyn ProcessorExtension>> {
        self.current()
            .get(name)?
            .entries
            .get(event)
            .filter(|e| e.state == EntryState::Loaded)?
            .implementation
            .clone()
    }

    pub fn extensions(&self) -> Vec<Extension> {
        self.current().values().cloned().collect()
    }

    pub fn extension(&self, name: &str) -> Option<Extension> {
        self.current().get(name).cloned()
    }

    /// Drop one extension from the active set.
    pub fn delete(&self, name: &str) -> Result<Extension, ExtensionError> {
        let mut guard = self.extensions.write().unwrap_or_else(|e| e.into_inner());
        let mut next = BTreeMap::clone(&guard);
        let removed = next
            .remove(name)
            .ok_or_else(|| ExtensionError::NotFound(name.to_string()))?;
        *guard = Arc::new(next);
        Ok(removed)
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::context::SubstituteValue;
    use crate::model::RepairStrategy;

    struct Marker;

    impl ProcessorExtension for Marker {
        fn extract_from_source(&self, context: &mut ProcessingContext) -> Result<(), ProcessingError> {
            context.add_substitute("marker", SubstituteValue::new(json!(true), RepairStrategy::Default));
            Ok(())
        }
    }

    struct TestLoader;

    impl ExtensionLoader for TestLoader {
        fn resolve(&self, symbol: &str) -> Option<SymbolFactory> {
            fn marker() -> Result<Capability, String> {
                Ok(Capability::InboundProcessor(Arc::new(Marker)))
            }
            fn mapper() -> Result<Capability, String> {
                Ok(Capability::Unsupported("outbound mapper"))
            }
            fn broken() -> Result<Capability, String> {
                Err("constructor panicked".to_string())
            }
            let factory: SymbolFactory = match symbol.rsplit('.').next()? {
                "Marker" => marker,
                "Mapper" => mapper,
                "Broken" => broken,
                _ => return None,
            };
            Some(factory)
        }
    }

    struct TestSource(Vec<ExtensionArtifact>);

    #[async_trait]
    impl ExtensionSource for TestSource {
        async fn artifacts(&self, _tenant: &Tenant) -> Result<Vec<ExtensionArtifact>, ExtensionError> {
            Ok(self.0.clone())
        }
    }

    fn artifact(name: &str, external: bool, manifest: Option<&str>) -> ExtensionArtifact {
        ExtensionArtifact {
            id: format!("{name}-id"),
            name: name.to_string(),
            external,
            manifest: manifest.map(str::to_string),
            loader: Arc::new(TestLoader),
        }
    }

    fn registry(artifacts: Vec<ExtensionArtifact>) -> ExtensionRegistry {
        ExtensionRegistry::new(Arc::new(TestSource(artifacts)))
    }

    #[test]
    fn manifest_skips_comments_and_blanks() {
        let parsed = parse_manifest("# header\n! bang\n\nA = x.y.A\nB: x.y.B\nbroken\n=novalue\n");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["A"], "x.y.A");
        assert_eq!(parsed["B"], "x.y.B");
    }

    #[test]
    fn all_entries_loaded_is_complete() {
        let ext = load_extension(
            &artifact("internal", false, Some("M=mapping.processor.extension.internal.Marker")),
            false,
        );
        assert_eq!(ext.status, ExtensionStatus::Complete);
        assert_eq!(ext.entries["M"].state, EntryState::Loaded);
    }

    #[test]
    fn failures_are_recorded_per_entry() {
        let manifest = "\
            ok=mapping.processor.extension.external.Marker\n\
            missing=mapping.processor.extension.external.Nope\n\
            mapper=mapping.processor.extension.external.Mapper\n\
            broken=mapping.processor.extension.external.Broken\n\
            foreign=com.acme.Marker\n\
            lookalike=mapping.processor.extension.externalx.Marker\n";
        let ext = load_extension(&artifact("ext", true, Some(manifest)), true);

        assert_eq!(ext.status, ExtensionStatus::Partially);
        assert_eq!(ext.entries["ok"].state, EntryState::Loaded);
        for event in ["missing", "mapper", "broken", "foreign", "lookalike"] {
            assert_eq!(ext.entries[event].state, EntryState::Failed, "{event}");
            assert!(ext.entries[event].message.is_some());
        }
        assert!(ext.entries["foreign"]
            .message
            .as_deref()
            .unwrap()
            .contains(EXTERNAL_NAMESPACE));
    }

    #[test]
    fn namespace_ends_at_a_dot() {
        assert!(in_namespace("mapping.processor.extension.external.Marker", EXTERNAL_NAMESPACE));
        assert!(!in_namespace("mapping.processor.extension.externalx.Marker", EXTERNAL_NAMESPACE));
        assert!(!in_namespace(EXTERNAL_NAMESPACE, EXTERNAL_NAMESPACE));
    }

    #[test]
    fn internal_symbols_need_no_namespace() {
        let ext = load_extension(&artifact("internal", false, Some("M=com.acme.Marker")), false);
        assert_eq!(ext.status, ExtensionStatus::Complete);
    }

    #[test]
    fn missing_manifest_is_not_loaded() {
        let ext = load_extension(&artifact("bare", false, None), true);
        assert_eq!(ext.status, ExtensionStatus::NotLoaded);
        assert!(ext.entries.is_empty());
        assert!(ext.message.is_some());
    }

    #[test]
    fn external_disabled_leaves_entries_unloaded() {
        let ext = load_extension(
            &artifact("ext", true, Some("M=mapping.processor.extension.external.Marker")),
            false,
        );
        assert_eq!(ext.status, ExtensionStatus::NotLoaded);
        assert_eq!(ext.entries["M"].state, EntryState::Unloaded);
    }

    #[tokio::test]
    async fn reload_lookup_and_delete() {
        let reg = registry(vec![
            artifact("a", false, Some("M=x.Marker\nX=x.Mapper")),
            artifact("b", false, Some("M=x.Marker")),
        ]);
        let tenant = Tenant::new("t100");
        assert!(reg.processor("a", "M").is_none());

        assert_eq!(reg.reload(&tenant, false).await.unwrap(), 2);
        assert!(reg.processor("a", "M").is_some());
        assert!(reg.processor("a", "X").is_none());
        assert_eq!(reg.extension("a").unwrap().status, ExtensionStatus::Partially);

        let held = reg.processor("b", "M").unwrap();
        reg.delete("b").unwrap();
        assert!(reg.processor("b", "M").is_none());
        assert_eq!(reg.extensions().len(), 1);
        assert!(matches!(reg.delete("b"), Err(ExtensionError::NotFound(_))));

        // A handle taken before the delete keeps working.
        let mut ctx = ProcessingContext::new(
            tenant,
            "t",
            Arc::new(crate::model::Mapping::default()),
            b"",
        );
        held.extract_from_source(&mut ctx).unwrap();
        assert_eq!(ctx.post_processing_cache["marker"][0].value, json!(true));
    }
}
