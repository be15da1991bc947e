use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;

use crate::objectstore::ObjectStoreAdapter;
use crate::origin::OriginAdapter;
use crate::projectmap::ProjectMap;

/// Resolves a project id to the local root and object-store placement the
/// Webhook Router needs to act on it. Owned by the Orchestrator, which is
/// the only component that knows how project roots and prefixes are laid
/// out on disk and in the bucket.
#[async_trait::async_trait]
pub trait ProjectLocator: Send + Sync {
    async fn locate(&self, project_id: i64) -> Option<ProjectPlacement>;
    /// The cached object key for a document, used by delete routing.
    async fn cached_key(&self, project_id: i64, document_id: i64) -> Option<String>;
    /// Remembers the key a document was last uploaded to, so a later
    /// delete event can find it again.
    async fn record_key(&self, project_id: i64, document_id: i64, rel_key: &str);
    /// Triggers a full reconciliation pass for a project (used by
    /// `__background_sync` and the no-match fallback).
    async fn full_sync(&self, project_id: i64);
}

#[derive(Debug, Clone)]
pub struct ProjectPlacement {
    pub local_root: PathBuf,
    pub bucket: String,
    pub object_prefix: String,
}

pub struct WebhookState {
    pub object_store: Arc<dyn ObjectStoreAdapter>,
    pub origin: Arc<dyn OriginAdapter>,
    pub projects: Arc<dyn ProjectLocator>,
    pub project_map: Arc<ProjectMap>,
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .with_state(state)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Classification {
    FullSync(Option<i64>),
    DocumentDelete { project_id: i64, document_id: i64 },
    DocumentCreateOrUpdate { project_id: i64, document_id: i64 },
    ProbeThenDecide { project_id: i64, document_id: i64 },
}

/// Unwraps an optional API-Gateway-style envelope (`{"body": "<json>"}`)
/// before classification proper.
fn unwrap_envelope(body: Value) -> Value {
    if let Value::Object(ref map) = body {
        if let Some(Value::String(inner)) = map.get("body") {
            if let Ok(parsed) = serde_json::from_str::<Value>(inner) {
                return parsed;
            }
        }
    }
    body
}

/// `{native: int}` or a bare scalar int.
fn parse_document_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::Object(map) => map.get("native").and_then(Value::as_i64),
        _ => None,
    }
}

fn classify(body: &Value) -> Option<Classification> {
    let background_sync = body
        .get("__background_sync")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if background_sync {
        return Some(Classification::FullSync(body.get("projectId").and_then(Value::as_i64)));
    }

    let project_id = body.get("projectId").and_then(Value::as_i64);
    let event_type = body.get("eventType").and_then(Value::as_str);
    let document_id = body.get("documentId").and_then(parse_document_id);

    if let Some(event_type) = event_type {
        let lower = event_type.to_lowercase();
        let Some(project_id) = project_id else {
            return Some(Classification::FullSync(None));
        };
        if lower.starts_with("delete") {
            let Some(document_id) = document_id else {
                return Some(Classification::FullSync(Some(project_id)));
            };
            return Some(Classification::DocumentDelete { project_id, document_id });
        }
        if lower.starts_with("create") || lower.starts_with("update") {
            let Some(document_id) = document_id else {
                return Some(Classification::FullSync(Some(project_id)));
            };
            return Some(Classification::DocumentCreateOrUpdate { project_id, document_id });
        }
        return Some(Classification::FullSync(Some(project_id)));
    }

    if let (Some(project_id), Some(document_id)) = (project_id, document_id) {
        return Some(Classification::ProbeThenDecide { project_id, document_id });
    }

    Some(Classification::FullSync(project_id))
}

async fn handle_webhook(
    State(state): State<Arc<WebhookState>>,
    Json(raw): Json<Value>,
) -> StatusCode {
    let body = unwrap_envelope(raw);
    let Some(classification) = classify(&body) else {
        return StatusCode::BAD_REQUEST;
    };
    dispatch(&state, classification).await;
    StatusCode::ACCEPTED
}

async fn dispatch(state: &WebhookState, classification: Classification) {
    match classification {
        Classification::FullSync(project_id) => match project_id {
            Some(project_id) => state.projects.full_sync(project_id).await,
            None => crate::logging::warn("webhook: full sync requested but no project id present".to_string()),
        },
        Classification::DocumentDelete { project_id, document_id } => {
            if let Some(key) = state.projects.cached_key(project_id, document_id).await {
                if let Some(placement) = state.projects.locate(project_id).await {
                    let uri = format!("s3://{}/{}{}", placement.bucket, placement.object_prefix, key);
                    if let Err(e) = state.object_store.remove(&uri).await {
                        crate::logging::warn(format!("webhook delete failed {uri}: {e}"));
                    }
                }
            }
        }
        Classification::DocumentCreateOrUpdate { project_id, document_id } => {
            create_or_update(state, project_id, document_id).await;
        }
        Classification::ProbeThenDecide { project_id, document_id } => {
            match state.origin.document_exists(project_id, document_id).await {
                Ok(true) => create_or_update(state, project_id, document_id).await,
                Ok(false) => {
                    if let Some(key) = state.projects.cached_key(project_id, document_id).await {
                        if let Some(placement) = state.projects.locate(project_id).await {
                            let uri = format!("s3://{}/{}{}", placement.bucket, placement.object_prefix, key);
                            let _ = state.object_store.remove(&uri).await;
                        }
                    }
                }
                Err(e) => crate::logging::warn(format!("document probe failed: {e}")),
            }
        }
    }
}

async fn create_or_update(state: &WebhookState, project_id: i64, document_id: i64) {
    let Some(placement) = state.projects.locate(project_id).await else {
        crate::logging::warn(format!("webhook: unknown project {project_id}"));
        return;
    };
    let (local_tmp, stamp) = match state.origin.download_document(project_id, document_id).await {
        Ok(v) => v,
        Err(e) => {
            crate::logging::warn(format!("webhook download failed for document {document_id}: {e}"));
            return;
        }
    };
    let rel_key = format!("{}/document-{}", stamp.folder_path.trim_matches('/'), document_id);
    let uri = format!("s3://{}/{}{}", placement.bucket, placement.object_prefix, rel_key);
    if let Err(e) = state.object_store.copy_up(&local_tmp, &uri).await {
        crate::logging::warn(format!("webhook upload failed {uri}: {e}"));
        let _ = tokio::fs::remove_file(&local_tmp).await;
        return;
    }
    let tags = vec![
        ("documentId".to_string(), document_id.to_string()),
        ("projectId".to_string(), project_id.to_string()),
        ("folderId".to_string(), stamp.folder_id.map(|v| v.to_string()).unwrap_or_default()),
        ("origin".to_string(), "filevine".to_string()),
        ("fv_docid".to_string(), document_id.to_string()),
    ];
    if let Err(e) = state.object_store.tag(&uri, &tags).await {
        crate::logging::warn(format!("webhook tagging failed {uri}: {e}"));
    }
    state.projects.record_key(project_id, document_id, &rel_key).await;
    let _ = tokio::fs::remove_file(&local_tmp).await;
}
