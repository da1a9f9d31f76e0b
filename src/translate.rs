//! Maps backend identifiers onto workspace identifiers.

use crate::config::UnmappedPolicy;
use crate::error::{HomologyError, Result};
use async_trait::async_trait;
use homology_protocol::{DistanceRecord, HomologyHit};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedId {
    pub kbase_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scientific_name: Option<String>,
}

#[async_trait]
pub trait IdRegistry: Send + Sync {
    /// Ids without a mapping are simply absent from the returned map.
    async fn map_ids(&self, namespace: &str, ids: &[String]) -> Result<HashMap<String, MappedId>>;
}

#[derive(Debug, Deserialize)]
struct RegistryReply {
    #[serde(default)]
    mappings: HashMap<String, MappedId>,
}

pub struct HttpIdRegistry {
    client: reqwest::Client,
    url: String,
    service_token: Option<String>,
}

impl HttpIdRegistry {
    pub fn new(client: reqwest::Client, url: &str, service_token: Option<String>) -> Self {
        Self {
            client,
            url: url.to_string(),
            service_token,
        }
    }
}

impl fmt::Debug for HttpIdRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpIdRegistry")
            .field("url", &self.url)
            .field("has_service_token", &self.service_token.is_some())
            .finish()
    }
}

#[async_trait]
impl IdRegistry for HttpIdRegistry {
    async fn map_ids(&self, namespace: &str, ids: &[String]) -> Result<HashMap<String, MappedId>> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&json!({ "namespace": namespace, "ids": ids }));
        if let Some(token) = &self.service_token {
            request = request.header(reqwest::header::AUTHORIZATION, token);
        }
        let response = request.send().await.map_err(|e| {
            HomologyError::TranslationPartialFailure(format!("Could not reach id registry: {e}"))
        })?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HomologyError::TranslationPartialFailure(format!(
                "Id registry returned HTTP {status}: {text}"
            )));
        }
        let reply: RegistryReply = response.json().await.map_err(|e| {
            HomologyError::TranslationPartialFailure(format!("Could not parse id registry reply: {e}"))
        })?;
        Ok(reply.mappings)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogRow {
    external_id: String,
    kbase_id: String,
    #[serde(default)]
    strain: Option<String>,
    #[serde(default)]
    scientific_name: Option<String>,
}

/// Static id map loaded from a CSV file with the header
/// `external_id,kbase_id,strain,scientific_name`.
#[derive(Debug, Clone, Default)]
pub struct CatalogIdRegistry {
    entries: HashMap<String, MappedId>,
}

impl CatalogIdRegistry {
    pub fn from_csv_path(path: &Path) -> std::result::Result<Self, String> {
        let file = std::fs::File::open(path)
            .map_err(|e| format!("Could not open id catalog '{}': {e}", path.display()))?;
        Self::from_reader(file).map_err(|e| format!("Could not read id catalog '{}': {e}", path.display()))
    }

    pub fn from_reader<R: std::io::Read>(reader: R) -> std::result::Result<Self, String> {
        let mut entries = HashMap::new();
        let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        for (line, row) in csv_reader.deserialize::<CatalogRow>().enumerate() {
            let row = row.map_err(|e| format!("row {}: {e}", line + 2))?;
            let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());
            entries.insert(
                row.external_id,
                MappedId {
                    kbase_id: row.kbase_id,
                    strain: non_empty(row.strain),
                    scientific_name: non_empty(row.scientific_name),
                },
            );
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl IdRegistry for CatalogIdRegistry {
    async fn map_ids(&self, _namespace: &str, ids: &[String]) -> Result<HashMap<String, MappedId>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.entries.get(id).map(|m| (id.clone(), m.clone())))
            .collect())
    }
}

pub struct IdentifierTranslator {
    registry: Arc<dyn IdRegistry>,
    policy: UnmappedPolicy,
}

impl IdentifierTranslator {
    pub fn new(registry: Arc<dyn IdRegistry>, policy: UnmappedPolicy) -> Self {
        Self { registry, policy }
    }

    /// Rewrites hits in backend order. Under `Passthrough` the output has
    /// exactly one record per hit.
    pub async fn translate(&self, namespace: &str, hits: Vec<HomologyHit>) -> Result<Vec<DistanceRecord>> {
        if hits.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = hits.iter().map(|h| h.sourceid.clone()).unique().collect();
        let mappings = self.registry.map_ids(namespace, &ids).await?;

        let mut unresolved = 0usize;
        let mut records = Vec::with_capacity(hits.len());
        for hit in hits {
            match mappings.get(&hit.sourceid) {
                Some(mapped) => records.push(mapped_record(hit, mapped)),
                None => {
                    unresolved += 1;
                    if self.policy == UnmappedPolicy::Passthrough {
                        records.push(DistanceRecord {
                            kbase_id: None,
                            sourceid: hit.sourceid,
                            namespaceid: hit.namespaceid,
                            dist: hit.dist,
                            unresolved: true,
                            extra: backend_extra(hit.extra),
                        });
                    }
                }
            }
        }
        if unresolved > 0 {
            warn!(namespace, unresolved, policy = ?self.policy, "unmapped result ids");
        }
        debug!(namespace, ids = ids.len(), records = records.len(), "translated ids");
        Ok(records)
    }
}

/// Record fields the translator owns; the backend cannot set them.
const RESERVED_FIELDS: [&str; 5] = ["kbase_id", "sourceid", "namespaceid", "dist", "unresolved"];

fn backend_extra(mut extra: Map<String, Value>) -> Map<String, Value> {
    for field in RESERVED_FIELDS {
        extra.remove(field);
    }
    extra
}

fn mapped_record(hit: HomologyHit, mapped: &MappedId) -> DistanceRecord {
    let mut extra = backend_extra(hit.extra);
    for (field, value) in [
        ("strain", &mapped.strain),
        ("scientific_name", &mapped.scientific_name),
    ] {
        if let Some(value) = value {
            let present = extra.get(field).is_some_and(|v| !v.is_null());
            if !present {
                extra.insert(field.to_string(), Value::String(value.clone()));
            }
        }
    }
    DistanceRecord {
        kbase_id: Some(mapped.kbase_id.clone()),
        sourceid: hit.sourceid,
        namespaceid: hit.namespaceid,
        dist: hit.dist,
        unresolved: false,
        extra,
    }
}
