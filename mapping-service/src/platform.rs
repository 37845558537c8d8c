//! Target platform facade and implementations.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::context::{TargetRequest, Tenant};
use crate::model::Api;

// ------------------------------------------------------------------ //
//  Domain types                                                       //
// ------------------------------------------------------------------ //

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform connection failed: {0}")]
    Connection(String),
    #[error("platform rejected {method} {path}: {status}")]
    Rejected {
        method: String,
        path: String,
        status: u16,
    },
    #[error("unexpected platform response: {0}")]
    Response(String),
}

/// An identity as known outside the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ExternalId {
    pub id: String,
    pub id_type: String,
}

impl ExternalId {
    pub fn new(id: impl Into<String>, id_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            id_type: id_type.into(),
        }
    }
}

// ------------------------------------------------------------------ //
//  Trait                                                              //
// ------------------------------------------------------------------ //

#[async_trait]
pub trait TargetPlatform: Send + Sync {
    /// Internal id registered for `external_id`, if any.
    async fn resolve_identity(
        &self,
        tenant: &Tenant,
        external_id: &ExternalId,
    ) -> Result<Option<String>, PlatformError>;

    /// Send one request. Inventory requests without `source_id` create the
    /// device and register `external_id` for it; the response then carries
    /// the new internal id under `id`.
    async fn create_or_update(
        &self,
        tenant: &Tenant,
        request: &TargetRequest,
    ) -> Result<Value, PlatformError>;
}

// ------------------------------------------------------------------ //
//  FakeTargetPlatform (for tests and local runs)                      //
// ------------------------------------------------------------------ //

/// In-memory platform that records every request for test assertions.
#[derive(Debug, Default, Clone)]
pub struct FakeTargetPlatform {
    pub identities: Arc<Mutex<HashMap<(Tenant, ExternalId), String>>>,
    pub requests: Arc<Mutex<Vec<(Tenant, TargetRequest)>>>,
    failing: Arc<Mutex<HashSet<Api>>>,
    next_id: Arc<Mutex<u64>>,
    lookups: Arc<Mutex<usize>>,
}

impl FakeTargetPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tenant: &Tenant, external_id: ExternalId, internal_id: impl Into<String>) {
        self.identities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((tenant.clone(), external_id), internal_id.into());
    }

    /// Reject every later request for `api`.
    pub fn fail_on(&self, api: Api) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(api);
    }

    /// Non-destructive snapshot of the requests sent so far.
    pub fn snapshot(&self) -> Vec<TargetRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Number of `resolve_identity` calls so far.
    pub fn lookups(&self) -> usize {
        *self.lookups.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn allocate_id(&self) -> String {
        let mut next = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
        *next += 1;
        format!("{}", 1000 + *next)
    }
}

#[async_trait]
impl TargetPlatform for FakeTargetPlatform {
    async fn resolve_identity(
        &self,
        tenant: &Tenant,
        external_id: &ExternalId,
    ) -> Result<Option<String>, PlatformError> {
        *self.lookups.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(self
            .identities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(tenant.clone(), external_id.clone()))
            .cloned())
    }

    async fn create_or_update(
        &self,
        tenant: &Tenant,
        request: &TargetRequest,
    ) -> Result<Value, PlatformError> {
        if self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&request.api)
        {
            return Err(PlatformError::Rejected {
                method: "POST".to_string(),
                path: api_path(request.api).to_string(),
                status: 500,
            });
        }

        let mut response = request.body.clone();
        if request.api == Api::Inventory && request.source_id.is_none() {
            let id = self.allocate_id();
            if let Some(external_id) = &request.external_id {
                self.register(
                    tenant,
                    ExternalId::new(external_id, &request.external_id_type),
                    id.clone(),
                );
            }
            set_id(&mut response, id);
        } else if let Some(id) = &request.source_id {
            if request.api == Api::Inventory {
                set_id(&mut response, id.clone());
            }
        }

        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((tenant.clone(), request.clone()));
        Ok(response)
    }
}

fn set_id(body: &mut Value, id: String) {
    if let Value::Object(map) = body {
        map.insert("id".to_string(), Value::String(id));
    }
}

// ------------------------------------------------------------------ //
//  HttpTargetPlatform (production)                                    //
// ------------------------------------------------------------------ //

fn api_path(api: Api) -> &'static str {
    match api {
        Api::Alarm => "/alarm/alarms",
        Api::Event => "/event/events",
        Api::Measurement => "/measurement/measurements",
        Api::Inventory => "/inventory/managedObjects",
        Api::Operation => "/devicecontrol/operations",
    }
}

/// REST client for a Cumulocity-style platform.
pub struct HttpTargetPlatform {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpTargetPlatform {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Base URL extended by `segments`, each percent-encoded as one path
    /// segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, PlatformError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| PlatformError::Connection(format!("invalid platform url {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| PlatformError::Connection(format!("platform url {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn call(
        &self,
        tenant: &Tenant,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<(StatusCode, Value), PlatformError> {
        debug!(tenant = %tenant, method = %method, url = %url, "platform call");

        let mut req = self
            .client
            .request(method, url)
            .header("Accept", "application/json");
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req
            .send()
            .await
            .map_err(|e| PlatformError::Connection(e.to_string()))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT {
            return Ok((status, Value::Null));
        }
        let value = response
            .json()
            .await
            .map_err(|e| PlatformError::Response(e.to_string()))?;
        Ok((status, value))
    }

    fn check(method: &Method, path: &str, status: StatusCode) -> Result<(), PlatformError> {
        if status.is_success() {
            Ok(())
        } else {
            Err(PlatformError::Rejected {
                method: method.to_string(),
                path: path.to_string(),
                status: status.as_u16(),
            })
        }
    }
}

#[async_trait]
impl TargetPlatform for HttpTargetPlatform {
    async fn resolve_identity(
        &self,
        tenant: &Tenant,
        external_id: &ExternalId,
    ) -> Result<Option<String>, PlatformError> {
        let url = self.endpoint(&["identity", "externalIds", external_id.id_type.as_str(), external_id.id.as_str()])?;
        let path = url.path().to_string();
        let (status, body) = self.call(tenant, Method::GET, url, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::check(&Method::GET, &path, status)?;
        body.pointer("/managedObject/id")
            .and_then(Value::as_str)
            .map(|id| Some(id.to_string()))
            .ok_or_else(|| PlatformError::Response("identity without managedObject.id".to_string()))
    }

    async fn create_or_update(
        &self,
        tenant: &Tenant,
        request: &TargetRequest,
    ) -> Result<Value, PlatformError> {
        let base: Vec<&str> = api_path(request.api).trim_start_matches('/').split('/').collect();

        if request.api == Api::Inventory {
            if let Some(id) = &request.source_id {
                let mut segments = base.clone();
                segments.push(id.as_str());
                let url = self.endpoint(&segments)?;
                let path = url.path().to_string();
                let (status, body) = self
                    .call(tenant, Method::PUT, url, Some(&request.body))
                    .await?;
                Self::check(&Method::PUT, &path, status)?;
                return Ok(body);
            }
        }

        let url = self.endpoint(&base)?;
        let path = url.path().to_string();
        let (status, body) = self
            .call(tenant, Method::POST, url, Some(&request.body))
            .await?;
        Self::check(&Method::POST, &path, status)?;

        if request.api == Api::Inventory {
            if let (Some(external_id), Some(id)) =
                (&request.external_id, body.get("id").and_then(Value::as_str))
            {
                let url = self.endpoint(&["identity", "globalIds", id, "externalIds"])?;
                let path = url.path().to_string();
                let registration = json!({
                    "externalId": external_id,
                    "type": request.external_id_type,
                });
                let (status, _) = self
                    .call(tenant, Method::POST, url, Some(&registration))
                    .await?;
                Self::check(&Method::POST, &path, status)?;
            }
        }
        Ok(body)
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //
