//! Workspace and blob store access.

use crate::error::{HomologyError, Result};
use crate::reference::ObjectReference;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::fmt;
use std::path::Path;
use tokio::io::AsyncWriteExt;

const SERVICE: &str = "workspace";
const BLOB_SERVICE: &str = "blobstore";

/// Subset of the workspace object info tuple the pipeline needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub workspace_id: u64,
    pub object_id: u64,
    pub version: u64,
    pub name: String,
    pub type_name: String,
}

impl ObjectInfo {
    /// Parses the positional info array:
    /// `[objid, name, type, save_date, version, saved_by, wsid, ...]`.
    pub fn from_info_tuple(info: &Value) -> Result<Self> {
        let items = info.as_array().ok_or_else(|| {
            HomologyError::backend(SERVICE, "Object info is not an array".to_string())
        })?;
        let number = |idx: usize, label: &str| {
            items.get(idx).and_then(Value::as_u64).ok_or_else(|| {
                HomologyError::backend(SERVICE, format!("Object info lacks numeric {label}"))
            })
        };
        let text = |idx: usize, label: &str| {
            items
                .get(idx)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| HomologyError::backend(SERVICE, format!("Object info lacks {label}")))
        };
        Ok(Self {
            object_id: number(0, "object id")?,
            name: text(1, "name")?,
            type_name: text(2, "type")?,
            version: number(4, "version")?,
            workspace_id: number(6, "workspace id")?,
        })
    }

    pub fn reference(&self) -> ObjectReference {
        ObjectReference::resolved(self.workspace_id, self.object_id, self.version)
    }

    /// `KBaseGenomes.Genome-17.0` -> `KBaseGenomes.Genome`
    pub fn base_type(&self) -> &str {
        self.type_name
            .split_once('-')
            .map(|(base, _)| base)
            .unwrap_or(&self.type_name)
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceObject {
    pub info: ObjectInfo,
    pub data: Value,
}

#[async_trait]
pub trait WorkspaceClient: Send + Sync {
    /// Access-checked metadata only; no object data is transferred.
    async fn get_object_info(&self, ref_path: &str, token: Option<&str>) -> Result<ObjectInfo>;

    async fn get_object(&self, ref_path: &str, token: Option<&str>) -> Result<WorkspaceObject>;

    /// Streams the blob into `dest` and returns the number of bytes written.
    async fn download_blob(&self, node_id: &str, token: Option<&str>, dest: &Path) -> Result<u64>;
}

/// Maps a workspace error message onto an error kind. Access failures keep
/// the upstream text so callers see exactly what the workspace said.
pub fn classify_workspace_error(reference: &str, message: &str) -> HomologyError {
    let lower = message.to_ascii_lowercase();
    let access = [
        "may not read",
        "not have permission",
        "token",
        "unauthorized",
        "anonymous users",
    ];
    let missing = [
        "no object with",
        "no workspace with",
        "has been deleted",
        "is deleted",
        "illegal",
        "is not a valid",
        "does not exist",
    ];
    if access.iter().any(|needle| lower.contains(needle)) {
        HomologyError::Unauthorized(message.to_string())
    } else if missing.iter().any(|needle| lower.contains(needle)) {
        HomologyError::invalid_reference(reference, message)
    } else {
        HomologyError::backend(SERVICE, format!("Workspace error: {message}"))
    }
}

pub struct HttpWorkspaceClient {
    client: reqwest::Client,
    workspace_url: String,
    blobstore_url: String,
}

impl fmt::Debug for HttpWorkspaceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpWorkspaceClient")
            .field("workspace_url", &self.workspace_url)
            .field("blobstore_url", &self.blobstore_url)
            .finish()
    }
}

impl HttpWorkspaceClient {
    pub fn new(client: reqwest::Client, workspace_url: &str, blobstore_url: &str) -> Self {
        Self {
            client,
            workspace_url: workspace_url.trim_end_matches('/').to_string(),
            blobstore_url: blobstore_url.trim_end_matches('/').to_string(),
        }
    }

    async fn call(&self, method: &str, params: Value, token: Option<&str>, reference: &str) -> Result<Value> {
        let body = json!({
            "version": "1.1",
            "method": method,
            "params": [params],
            "id": "0",
        });
        let mut request = self.client.post(&self.workspace_url).json(&body);
        if let Some(token) = token {
            request = request.header(reqwest::header::AUTHORIZATION, token);
        }
        let mut response = request
            .send()
            .await
            .map_err(|e| HomologyError::from_transport(SERVICE, "Could not reach workspace", e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| HomologyError::from_transport(SERVICE, "Could not read workspace reply", e))?;
        let reply: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(_) => {
                return Err(HomologyError::backend(
                    SERVICE,
                    format!("Workspace returned HTTP {status}: {text}"),
                ));
            }
        };
        if let Some(error) = reply.get("error").filter(|e| !e.is_null()) {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(classify_workspace_error(reference, &message));
        }
        if !status.is_success() {
            return Err(HomologyError::backend(
                SERVICE,
                format!("Workspace returned HTTP {status}: {text}"),
            ));
        }
        reply
            .pointer("/result/0")
            .cloned()
            .ok_or_else(|| HomologyError::backend(SERVICE, "Workspace reply has no result"))
    }
}

fn object_specs(ref_path: &str) -> Value {
    json!([{ "ref": ref_path }])
}

#[async_trait]
impl WorkspaceClient for HttpWorkspaceClient {
    async fn get_object_info(&self, ref_path: &str, token: Option<&str>) -> Result<ObjectInfo> {
        let result = self
            .call(
                "Workspace.get_object_info3",
                json!({ "objects": object_specs(ref_path), "includeMetadata": 0 }),
                token,
                ref_path,
            )
            .await?;
        let info = result
            .pointer("/infos/0")
            .ok_or_else(|| HomologyError::backend(SERVICE, "Workspace reply has no object info"))?;
        ObjectInfo::from_info_tuple(info)
    }

    async fn get_object(&self, ref_path: &str, token: Option<&str>) -> Result<WorkspaceObject> {
        let mut result = self
            .call(
                "Workspace.get_objects2",
                json!({ "objects": object_specs(ref_path) }),
                token,
                ref_path,
            )
            .await?;
        let entry = result
            .pointer_mut("/data/0")
            .map(Value::take)
            .ok_or_else(|| HomologyError::backend(SERVICE, "Workspace reply has no object data"))?;
        let info = ObjectInfo::from_info_tuple(&entry["info"])?;
        let data = match entry {
            Value::Object(mut map) => map.remove("data").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        Ok(WorkspaceObject { info, data })
    }

    async fn download_blob(&self, node_id: &str, token: Option<&str>, dest: &Path) -> Result<u64> {
        if node_id.is_empty()
            || !node_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(HomologyError::backend(
                BLOB_SERVICE,
                format!("Invalid blob node id '{node_id}'"),
            ));
        }
        let url = format!("{}/node/{node_id}?download", self.blobstore_url);
        let mut request = self.client.get(url);
        if let Some(token) = token {
            request = request.header(reqwest::header::AUTHORIZATION, format!("OAuth {token}"));
        }
        let mut response = request
            .send()
            .await
            .map_err(|e| HomologyError::from_transport(BLOB_SERVICE, "Could not reach blob store", e))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            let text = response.text().await.unwrap_or_default();
            return Err(HomologyError::Unauthorized(blob_error_message(&text, status)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HomologyError::backend(
                BLOB_SERVICE,
                format!("Could not download blob {node_id}: {}", blob_error_message(&text, status)),
            ));
        }
        let mut file = tokio::fs::File::create(dest).await.map_err(|e| {
            HomologyError::Internal(format!("Could not open '{}' for download: {e}", dest.display()))
        })?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| HomologyError::from_transport(BLOB_SERVICE, "Could not read blob", e))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

/// The blob store wraps failures as `{"error": ["message", ..]}`.
fn blob_error_message(text: &str, status: reqwest::StatusCode) -> String {
    let parsed = serde_json::from_str::<Value>(text).ok();
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(|e| match e {
            Value::Array(items) => items.first().and_then(Value::as_str).map(str::to_string),
            Value::String(s) => Some(s.clone()),
            _ => None,
        });
    match message {
        Some(message) if !message.is_empty() => message,
        _ if !text.trim().is_empty() => text.trim().to_string(),
        _ => format!("HTTP {status}"),
    }
}
