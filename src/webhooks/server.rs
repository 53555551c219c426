//! Webhook HTTP server handlers
//!
//! Implements the ValidatingAdmissionWebhook HTTP endpoints for
//! PostgresCluster and ScheduledBackup resources.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::post};
use axum_server::tls_rustls::RustlsConfig;
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, Client};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use super::policies::{ValidationContext, ValidationResult, validate_all, validate_scheduled_backup};
use crate::crd::{PostgresCluster, ScheduledBackup};

/// Kubernetes AdmissionReview request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    pub api_version: String,
    pub kind: String,
    pub request: Option<AdmissionRequest>,
}

/// AdmissionRequest contains the details of the admission request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    pub operation: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub object: Option<serde_json::Value>,
    pub old_object: Option<serde_json::Value>,
}

/// AdmissionReview response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewResponse {
    pub api_version: String,
    pub kind: String,
    pub response: AdmissionResponse,
}

/// AdmissionResponse contains the result
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AdmissionStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionStatus {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Shared state for webhook handlers
pub(crate) struct WebhookState {
    pub client: Client,
}

/// Create the webhook router
pub(crate) fn create_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/validate", post(validate_postgres_cluster))
        .route("/validate-scheduledbackup", post(validate_scheduled_backup_request))
        .with_state(state)
}

type HandlerResponse = (StatusCode, Json<AdmissionReviewResponse>);

/// Parsed request objects, or the response to send when parsing failed
struct Parsed<T> {
    uid: String,
    request: AdmissionRequest,
    object: T,
    old_object: Option<T>,
}

fn parse_review<T: DeserializeOwned>(review: AdmissionReview, kind: &str) -> Result<Parsed<T>, HandlerResponse> {
    let Some(request) = review.request else {
        error!("Admission review missing request");
        return Err((
            StatusCode::BAD_REQUEST,
            Json(create_response("", false, "Missing request in AdmissionReview", None)),
        ));
    };
    let uid = request.uid.clone();
    info!(
        uid = %uid,
        kind,
        operation = %request.operation,
        namespace = ?request.namespace,
        name = ?request.name,
        "Processing admission request"
    );

    // DELETE operations are always allowed
    if request.operation == "DELETE" {
        return Err((StatusCode::OK, Json(create_response(&uid, true, "", None))));
    }

    let object: T = match request.object.clone().map(serde_json::from_value) {
        Some(Ok(object)) => object,
        Some(Err(e)) => {
            error!(error = %e, "Failed to parse {}", kind);
            return Err((
                StatusCode::OK,
                Json(create_response(&uid, false, &format!("Failed to parse object: {}", e), None)),
            ));
        }
        None => {
            return Err((
                StatusCode::OK,
                Json(create_response(&uid, false, "Missing object in request", None)),
            ));
        }
    };

    let old_object = match request.old_object.clone().map(serde_json::from_value) {
        Some(Ok(old)) => Some(old),
        Some(Err(e)) => {
            warn!(error = %e, "Failed to parse old {}, treating as CREATE", kind);
            None
        }
        None => None,
    };

    Ok(Parsed {
        uid,
        request,
        object,
        old_object,
    })
}

fn respond(uid: &str, result: ValidationResult) -> HandlerResponse {
    if result.allowed {
        info!(uid = %uid, "Admission request allowed");
        return (StatusCode::OK, Json(create_response(uid, true, "", None)));
    }
    let reason = result.reason.unwrap_or_else(|| "ValidationFailed".to_string());
    let message = result.message.unwrap_or_else(|| "Validation failed".to_string());
    warn!(uid = %uid, reason = %reason, message = %message, "Admission request denied");
    (StatusCode::OK, Json(create_response(uid, false, &message, Some(&reason))))
}

/// Validate PostgresCluster admission webhook handler
pub(crate) async fn validate_postgres_cluster(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview>,
) -> impl IntoResponse {
    let parsed: Parsed<PostgresCluster> = match parse_review(review, "PostgresCluster") {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };

    // Get namespace labels for production policy
    let namespace_labels = match &parsed.request.namespace {
        Some(ns) => get_namespace_labels(&state.client, ns).await,
        None => BTreeMap::new(),
    };

    let ctx = ValidationContext::new(&parsed.object, parsed.old_object.as_ref(), namespace_labels);
    respond(&parsed.uid, validate_all(&ctx))
}

/// Validate ScheduledBackup admission webhook handler
pub(crate) async fn validate_scheduled_backup_request(Json(review): Json<AdmissionReview>) -> impl IntoResponse {
    let parsed: Parsed<ScheduledBackup> = match parse_review(review, "ScheduledBackup") {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };
    respond(&parsed.uid, validate_scheduled_backup(&parsed.object))
}

/// Get namespace labels for policy decisions
async fn get_namespace_labels(client: &Client, namespace: &str) -> BTreeMap<String, String> {
    let ns_api: Api<Namespace> = Api::all(client.clone());

    match ns_api.get(namespace).await {
        Ok(ns) => ns.metadata.labels.unwrap_or_default(),
        Err(e) => {
            warn!(namespace = %namespace, error = %e, "Failed to get namespace, using empty labels");
            BTreeMap::new()
        }
    }
}

/// Create an AdmissionReview response
fn create_response(uid: &str, allowed: bool, message: &str, reason: Option<&str>) -> AdmissionReviewResponse {
    AdmissionReviewResponse {
        api_version: "admission.k8s.io/v1".to_string(),
        kind: "AdmissionReview".to_string(),
        response: AdmissionResponse {
            uid: uid.to_string(),
            allowed,
            status: if allowed {
                None
            } else {
                Some(AdmissionStatus {
                    code: 403,
                    message: message.to_string(),
                    reason: reason.map(String::from),
                })
            },
        },
    }
}

/// Default webhook server port
pub const WEBHOOK_PORT: u16 = 8443;

/// Run the webhook server with TLS
///
/// Binds to 0.0.0.0:8443. TLS certificates are loaded from the given PEM
/// files.
pub async fn run_webhook_server(client: Client, cert_path: &str, key_path: &str) -> Result<(), WebhookError> {
    let state = Arc::new(WebhookState { client });
    let app = create_webhook_router(state);

    let config = RustlsConfig::from_pem_file(PathBuf::from(cert_path), PathBuf::from(key_path))
        .await
        .map_err(|e| WebhookError::TlsConfig(e.to_string()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], WEBHOOK_PORT));
    info!("Webhook server listening on {} with TLS", addr);

    axum_server::bind_rustls(addr, config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))?;

    Ok(())
}

/// Errors that can occur when running the webhook server
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
    #[error("Webhook server error: {0}")]
    Server(String),
}
