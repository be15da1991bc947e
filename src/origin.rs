use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::retry::{retry, RetryPolicy};

#[derive(Debug, Clone)]
pub struct OriginCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub user_id: String,
    pub org_id: String,
    pub session_url: String,
}

/// Folder placement and provenance for a single document, as returned by
/// Origin alongside its content. Used by the Webhook Router to place the
/// downloaded file and stamp the resulting object.
#[derive(Debug, Clone)]
pub struct DocumentStamp {
    pub document_id: i64,
    pub project_id: i64,
    pub folder_id: Option<i64>,
    pub folder_path: String,
}

/// Narrow contract to the remote case-management system. The REST surface
/// for folder/document listing and the upload helper's actual transport
/// stay opaque per scope: callers only ever see these operations.
#[async_trait]
pub trait OriginAdapter: Send + Sync {
    async fn resolve_project_id(&self, name: &str) -> Result<Option<i64>>;
    async fn refresh_from_origin(&self, project_id: i64) -> Result<()>;
    async fn upload_file(
        &self,
        project_id: i64,
        local_path: &Path,
        folder_subpath: &str,
        root_folder_id: Option<i64>,
        require_resolved: bool,
    ) -> Result<()>;
    /// Downloads a single document's current content to a local temp file,
    /// returning its path plus the folder placement to stamp onto the
    /// resulting object.
    async fn download_document(&self, project_id: i64, document_id: i64) -> Result<(std::path::PathBuf, DocumentStamp)>;
    /// Probes whether a document still exists on Origin (used by the
    /// Webhook Router's no-eventType fallback).
    async fn document_exists(&self, project_id: i64, document_id: i64) -> Result<bool>;
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "refreshToken")]
    #[allow(dead_code)]
    refresh_token: Option<String>,
    #[serde(rename = "userId")]
    #[allow(dead_code)]
    user_id: Option<String>,
}

struct AuthState {
    bearer: Mutex<Option<String>>,
}

/// Production Origin Adapter: MD5 session-key handshake against
/// `SESSION_URL`, then Bearer-authenticated calls, with retry on 401/429/5xx.
pub struct HttpOriginAdapter {
    http: Client,
    creds: OriginCredentials,
    webhook_url: Option<String>,
    auth: AuthState,
    retry_policy: RetryPolicy,
}

impl HttpOriginAdapter {
    pub fn new(creds: OriginCredentials, webhook_url: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .context("build origin http client")?;
        Ok(Self {
            http,
            creds,
            webhook_url,
            auth: AuthState {
                bearer: Mutex::new(None),
            },
            retry_policy: RetryPolicy::default(),
        })
    }

    /// `timestamp = now().utc().iso8601(ms)+"Z"`;
    /// `apiHash = md5(apiKey + "/" + timestamp + "/" + apiSecret)`.
    fn auth_hash(&self, timestamp: &str) -> String {
        let material = format!("{}/{}/{}", self.creds.api_key, timestamp, self.creds.api_secret);
        format!("{:x}", md5::compute(material.as_bytes()))
    }

    async fn authenticate(&self) -> Result<String> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let api_hash = self.auth_hash(&timestamp);
        let body = serde_json::json!({
            "mode": "key",
            "apiKey": self.creds.api_key,
            "apiSecret": self.creds.api_secret,
            "apiHash": api_hash,
            "apiTimestamp": timestamp,
            "userId": self.creds.user_id,
            "orgId": self.creds.org_id,
        });
        let resp = self
            .http
            .post(&self.creds.session_url)
            .json(&body)
            .send()
            .await
            .context("post session handshake")?;
        if !resp.status().is_success() {
            anyhow::bail!("origin session handshake failed: {}", resp.status());
        }
        let session: SessionResponse = resp.json().await.context("parse session response")?;
        let mut guard = self.auth.bearer.lock().await;
        *guard = Some(session.access_token.clone());
        Ok(session.access_token)
    }

    async fn ensure_bearer(&self) -> Result<String> {
        let existing = self.auth.bearer.lock().await.clone();
        match existing {
            Some(token) => Ok(token),
            None => self.authenticate().await,
        }
    }

    fn should_retry_status(status: Option<StatusCode>) -> bool {
        match status {
            Some(s) => s == StatusCode::UNAUTHORIZED || s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error(),
            None => true, // network-level error, not a status
        }
    }
}

#[async_trait]
impl OriginAdapter for HttpOriginAdapter {
    async fn resolve_project_id(&self, name: &str) -> Result<Option<i64>> {
        let name = name.to_string();
        let result: Result<Option<i64>> = retry(
            self.retry_policy,
            |r: &Result<Option<i64>>| r.is_err(),
            || async {
                let bearer = self.ensure_bearer().await?;
                let resp = self
                    .http
                    .get(format!("{}/projects/resolve", self.creds.session_url))
                    .query(&[("name", &name)])
                    .bearer_auth(&bearer)
                    .send()
                    .await?;
                if resp.status() == StatusCode::UNAUTHORIZED {
                    *self.auth.bearer.lock().await = None;
                }
                if !resp.status().is_success() {
                    if Self::should_retry_status(Some(resp.status())) {
                        anyhow::bail!("resolve_project_id transient error: {}", resp.status());
                    }
                    return Ok(None);
                }
                #[derive(Deserialize)]
                struct Resolved {
                    #[serde(rename = "projectId")]
                    project_id: Option<i64>,
                }
                let parsed: Resolved = resp.json().await?;
                Ok(parsed.project_id)
            },
        )
        .await;
        result
    }

    async fn refresh_from_origin(&self, project_id: i64) -> Result<()> {
        let Some(webhook_url) = self.webhook_url.clone() else {
            crate::logging::info("webhook refresh skipped: no webhook url configured");
            return Ok(());
        };
        let outcome: Result<()> = retry(
            self.retry_policy,
            |r: &Result<()>| r.is_err(),
            || async {
                let resp = self
                    .http
                    .post(&webhook_url)
                    .timeout(std::time::Duration::from_secs(60))
                    .json(&serde_json::json!({ "projectId": project_id }))
                    .send()
                    .await?;
                if !resp.status().is_success() && Self::should_retry_status(Some(resp.status())) {
                    anyhow::bail!("webhook refresh transient error: {}", resp.status());
                }
                Ok(())
            },
        )
        .await;
        if outcome.is_ok() {
            // Best-effort settle delay so Origin's own async processing has
            // time to land before the caller re-lists documents.
            tokio::time::sleep(std::time::Duration::from_secs(4)).await;
        } else if let Err(e) = &outcome {
            crate::logging::warn(format!("webhook refresh failed for project {project_id}: {e}"));
        }
        Ok(())
    }

    async fn upload_file(
        &self,
        project_id: i64,
        local_path: &Path,
        folder_subpath: &str,
        root_folder_id: Option<i64>,
        require_resolved: bool,
    ) -> Result<()> {
        if require_resolved && project_id <= 0 {
            anyhow::bail!("upload_file requires a resolved project id");
        }
        let bearer = self.ensure_bearer().await?;
        let form = reqwest::multipart::Form::new()
            .text("projectId", project_id.to_string())
            .text("folderSubpath", folder_subpath.to_string())
            .text("rootFolderId", root_folder_id.map(|v| v.to_string()).unwrap_or_default())
            .file("file", local_path)
            .await
            .with_context(|| format!("attach {}", local_path.display()))?;
        let resp = self
            .http
            .post(format!("{}/documents/upload", self.creds.session_url))
            .bearer_auth(&bearer)
            .multipart(form)
            .send()
            .await
            .context("post upload")?;
        if !resp.status().is_success() {
            anyhow::bail!("origin upload failed: {}", resp.status());
        }
        Ok(())
    }

    async fn download_document(&self, project_id: i64, document_id: i64) -> Result<(std::path::PathBuf, DocumentStamp)> {
        let bearer = self.ensure_bearer().await?;
        #[derive(Deserialize)]
        struct DocumentInfo {
            #[serde(rename = "downloadUrl")]
            download_url: String,
            #[serde(rename = "folderId")]
            folder_id: Option<i64>,
            #[serde(rename = "folderPath")]
            folder_path: String,
        }
        let info: DocumentInfo = self
            .http
            .get(format!("{}/projects/{project_id}/documents/{document_id}", self.creds.session_url))
            .bearer_auth(&bearer)
            .send()
            .await
            .context("fetch document info")?
            .json()
            .await
            .context("parse document info")?;

        let resp = self.http.get(&info.download_url).send().await.context("download document")?;
        if !resp.status().is_success() {
            anyhow::bail!("document download failed: {}", resp.status());
        }
        let tmp_dir = std::env::temp_dir();
        let tmp_path = tmp_dir.join(format!("originsync-doc-{document_id}-{}.tmp", uuid::Uuid::new_v4()));
        let bytes = resp.bytes().await.context("read document body")?;
        tokio::fs::write(&tmp_path, &bytes).await.context("write document temp file")?;

        Ok((
            tmp_path,
            DocumentStamp {
                document_id,
                project_id,
                folder_id: info.folder_id,
                folder_path: info.folder_path,
            },
        ))
    }

    async fn document_exists(&self, project_id: i64, document_id: i64) -> Result<bool> {
        let bearer = self.ensure_bearer().await?;
        let resp = self
            .http
            .get(format!("{}/projects/{project_id}/documents/{document_id}", self.creds.session_url))
            .bearer_auth(&bearer)
            .send()
            .await
            .context("probe document existence")?;
        Ok(resp.status().is_success())
    }
}
