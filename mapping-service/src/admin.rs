//! Admin HTTP surface.
//!
//! | Route                        | Purpose                                   |
//! |------------------------------|-------------------------------------------|
//! | `GET /health`                | liveness                                  |
//! | `GET/POST /mappings`         | list / create rules                       |
//! | `PUT/DELETE /mappings/:id`   | replace / remove one rule                 |
//! | `POST /mappings/validate`    | validation errors of a candidate rule     |
//! | `GET /extensions`            | extension load status                     |
//! | `POST /extensions/reload`    | rebuild the extension set                 |
//! | `DELETE /extensions/:name`   | drop one extension                        |
//! | `GET /status`                | per-rule message counters                 |
//! | `GET/PUT /configuration`     | tenant service configuration              |
//! | `POST /outbound`             | render a platform payload and publish it  |

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServiceConfiguration;
use crate::context::Tenant;
use crate::dispatcher::Dispatcher;
use crate::extension::{ExtensionError, ExtensionRegistry};
use crate::mapping_registry::{MappingChangeError, MappingRegistry};
use crate::model::Mapping;
use crate::publisher::UdpPublisher;
use crate::status::MappingStatusTracker;

// ------------------------------------------------------------------ //
//  Shared application state                                           //
// ------------------------------------------------------------------ //

/// Shared state injected into every handler via `State`.
pub struct AppState {
    /// Tenant the admin surface operates on.
    pub tenant: Tenant,
    pub registry: Arc<MappingRegistry>,
    pub extensions: Arc<ExtensionRegistry>,
    pub status: Arc<MappingStatusTracker>,
    pub dispatcher: Arc<Dispatcher>,
    /// Rendered outbound messages are also sent here when set.
    pub publisher: Option<Arc<UdpPublisher>>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/mappings", get(list_mappings).post(create_mapping))
        .route("/mappings/validate", post(validate_mapping))
        .route("/mappings/:id", put(update_mapping).delete(delete_mapping))
        .route("/extensions", get(list_extensions))
        .route("/extensions/reload", post(reload_extensions))
        .route("/extensions/:name", delete(delete_extension))
        .route("/status", get(get_status))
        .route("/configuration", get(get_configuration).put(put_configuration))
        .route("/outbound", post(render_outbound))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_body(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

fn change_error(e: MappingChangeError) -> Response {
    match e {
        MappingChangeError::Invalid(errors) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "errors": errors })),
        )
            .into_response(),
        MappingChangeError::NotFound(id) => {
            error_body(StatusCode::NOT_FOUND, format!("mapping {id} not found"))
        }
        MappingChangeError::Store(e) => {
            error!(error = %e, "mapping store failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

// ------------------------------------------------------------------ //
//  Handlers                                                           //
// ------------------------------------------------------------------ //

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn list_mappings(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.registry.snapshot(&state.tenant);
    let mappings: Vec<&Mapping> = snapshot.mappings.iter().map(|m| m.as_ref()).collect();
    (StatusCode::OK, Json(mappings)).into_response()
}

async fn create_mapping(State(state): State<Arc<AppState>>, Json(candidate): Json<Mapping>) -> Response {
    match state.registry.create(&state.tenant, candidate).await {
        Ok(mapping) => (StatusCode::CREATED, Json(mapping)).into_response(),
        Err(e) => change_error(e),
    }
}

async fn update_mapping(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(candidate): Json<Mapping>,
) -> Response {
    match state.registry.update(&state.tenant, &id, candidate).await {
        Ok(mapping) => (StatusCode::OK, Json(mapping)).into_response(),
        Err(e) => change_error(e),
    }
}

async fn delete_mapping(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.registry.delete(&state.tenant, &id).await {
        Ok(mapping) => {
            state.status.forget(&state.tenant, &id);
            (StatusCode::OK, Json(mapping)).into_response()
        }
        Err(e) => change_error(e),
    }
}

async fn validate_mapping(State(state): State<Arc<AppState>>, Json(candidate): Json<Mapping>) -> Response {
    let errors = state.registry.validate(&state.tenant, &candidate);
    (StatusCode::OK, Json(json!({ "errors": errors }))).into_response()
}

async fn list_extensions(State(state): State<Arc<AppState>>) -> Response {
    (StatusCode::OK, Json(state.extensions.extensions())).into_response()
}

async fn reload_extensions(State(state): State<Arc<AppState>>) -> Response {
    let external_enabled = state
        .registry
        .snapshot(&state.tenant)
        .configuration
        .external_extension_enabled;
    match state.extensions.reload(&state.tenant, external_enabled).await {
        Ok(loaded) => {
            info!(loaded, "extensions reloaded");
            (StatusCode::OK, Json(json!({ "loaded": loaded }))).into_response()
        }
        Err(e) => {
            error!(error = %e, "extension reload failed");
            error_body(StatusCode::BAD_GATEWAY, e)
        }
    }
}

async fn delete_extension(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.extensions.delete(&name) {
        Ok(extension) => (StatusCode::OK, Json(extension)).into_response(),
        Err(e @ ExtensionError::NotFound(_)) => error_body(StatusCode::NOT_FOUND, e),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn get_status(State(state): State<Arc<AppState>>) -> Response {
    (StatusCode::OK, Json(state.status.snapshot(&state.tenant))).into_response()
}

async fn get_configuration(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.registry.snapshot(&state.tenant);
    (StatusCode::OK, Json(snapshot.configuration.clone())).into_response()
}

async fn put_configuration(
    State(state): State<Arc<AppState>>,
    Json(configuration): Json<ServiceConfiguration>,
) -> Response {
    match state
        .registry
        .set_configuration(&state.tenant, configuration.clone())
        .await
    {
        Ok(()) => (StatusCode::OK, Json(configuration)).into_response(),
        Err(e) => {
            error!(error = %e, "saving service configuration failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

async fn render_outbound(State(state): State<Arc<AppState>>, Json(payload): Json<Value>) -> Response {
    let messages = state.dispatcher.process_outbound(&state.tenant, &payload);
    if let Some(publisher) = &state.publisher {
        let sent = publisher.publish(&messages).await;
        info!(rendered = messages.len(), sent, "outbound messages published");
    }
    (StatusCode::OK, Json(messages)).into_response()
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //
