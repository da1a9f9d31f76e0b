//! The `get_homologs` pipeline.
//!
//! Received -> Authorizing -> Resolving -> (cache hit) | Sketching ->
//! Searching -> Translating -> Responding. Each stage either advances or
//! returns a typed error; nothing is retried.

use crate::about;
use crate::auth::{AuthClient, HttpAuthClient};
use crate::cache::{CacheKey, SearchCache};
use crate::config::ServiceConfig;
use crate::error::{HomologyError, Result};
use crate::homology::{HomologySearch, HttpHomologyClient};
use crate::reference::ObjectReference;
use crate::resolver::ReferenceResolver;
use crate::sketch::{MashSketcher, SketchInput, Sketcher};
use crate::translate::{CatalogIdRegistry, HttpIdRegistry, IdRegistry, IdentifierTranslator};
use crate::workspace::{HttpWorkspaceClient, WorkspaceClient};
use homology_protocol::{GetHomologsParams, HomologsResult};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// The outbound services the pipeline talks to.
pub struct Collaborators {
    pub workspace: Arc<dyn WorkspaceClient>,
    pub auth: Arc<dyn AuthClient>,
    pub sketcher: Arc<dyn Sketcher>,
    pub search: Arc<dyn HomologySearch>,
    pub registry: Arc<dyn IdRegistry>,
}

impl Collaborators {
    /// HTTP-backed collaborators sharing one pooled client.
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let client = config.http_client()?;
        let registry: Arc<dyn IdRegistry> = match (&config.id_mapping_path, &config.id_registry_url) {
            (Some(path), _) => {
                let catalog = CatalogIdRegistry::from_csv_path(path).map_err(HomologyError::Internal)?;
                info!(entries = catalog.len(), path = %path.display(), "loaded id catalog");
                Arc::new(catalog)
            }
            (None, Some(url)) => Arc::new(HttpIdRegistry::new(
                client.clone(),
                url,
                config.service_token.clone(),
            )),
            (None, None) => {
                return Err(HomologyError::Internal(
                    "No identifier registry configured".to_string(),
                ));
            }
        };
        Ok(Self {
            workspace: Arc::new(HttpWorkspaceClient::new(
                client.clone(),
                &config.workspace_url,
                &config.blobstore_url,
            )),
            auth: Arc::new(HttpAuthClient::new(client.clone(), &config.auth_url)),
            sketcher: Arc::new(MashSketcher::new(
                config.mash_bin.clone(),
                config.sketch,
                config.scratch(),
            )?),
            search: Arc::new(HttpHomologyClient::new(client, &config.homology_url)),
            registry,
        })
    }
}

pub struct HomologyService {
    config: Arc<ServiceConfig>,
    auth: Arc<dyn AuthClient>,
    resolver: ReferenceResolver,
    sketcher: Arc<dyn Sketcher>,
    search: Arc<dyn HomologySearch>,
    translator: IdentifierTranslator,
    cache: SearchCache,
    started_at: Instant,
}

impl HomologyService {
    pub fn new(config: Arc<ServiceConfig>, collaborators: Collaborators) -> Self {
        Self {
            auth: collaborators.auth,
            resolver: ReferenceResolver::new(collaborators.workspace, config.scratch()),
            sketcher: collaborators.sketcher,
            search: collaborators.search,
            translator: IdentifierTranslator::new(collaborators.registry, config.unmapped_policy),
            cache: SearchCache::new(config.cache_max_entries, config.cache_ttl),
            started_at: Instant::now(),
            config,
        }
    }

    pub fn from_config(config: Arc<ServiceConfig>) -> Result<Self> {
        let collaborators = Collaborators::from_config(&config)?;
        Ok(Self::new(config, collaborators))
    }

    fn effective_max_results(&self, requested: Option<i64>) -> Result<u32> {
        match requested {
            None => Ok(self.config.default_max_results),
            Some(n) if n >= 1 => Ok(u32::try_from(n).unwrap_or(u32::MAX)),
            Some(n) => Err(HomologyError::InvalidParams(format!(
                "n_max_results must be a positive integer, got {n}"
            ))),
        }
    }

    pub async fn get_homologs(
        &self,
        params: GetHomologsParams,
        token: Option<&str>,
    ) -> Result<HomologsResult> {
        let max_results = self.effective_max_results(params.n_max_results)?;
        let reference = ObjectReference::parse(&params.ws_ref)?;

        if let Some(token) = token {
            let user = self.auth.validate_token(token).await?;
            debug!(user = %user.user, "caller authenticated");
        }

        let info = self.resolver.locate(&reference, token).await?;
        let key = CacheKey::new(info.reference(), max_results);

        if !params.bypass_caching {
            if let Some(hit) = self.cache.lookup(&key) {
                info!(ws_ref = %key.object, cached = true, hits = hit.distances.len(), "served from cache");
                return Ok(HomologsResult {
                    cached: true,
                    ..(*hit).clone()
                });
            }
        }

        let _gate = self.cache.gate(&key).await;
        if !params.bypass_caching {
            if let Some(hit) = self.cache.lookup(&key) {
                info!(ws_ref = %key.object, cached = true, hits = hit.distances.len(), "served from coalesced search");
                return Ok(HomologsResult {
                    cached: true,
                    ..(*hit).clone()
                });
            }
        }

        let sequence = self.resolver.load(&info, token).await?;
        let label = key.object.to_string();
        let files = sequence.paths();
        let sketch = self
            .sketcher
            .sketch(&SketchInput {
                label: &label,
                files: &files,
                reads: sequence.kind.is_reads(),
            })
            .await?;
        let stats = sequence.stats();
        debug!(
            ws_ref = %key.object,
            kind = sequence.kind.as_str(),
            records = stats.records,
            bases = stats.bases,
            sketch_bytes = sketch.byte_len(),
            digest = sketch.digest(),
            "sketch built"
        );
        drop(sequence);

        let outcome = self
            .search
            .search(sketch, &self.config.namespace, max_results)
            .await?;
        let mut distances = self
            .translator
            .translate(&self.config.namespace, outcome.response.distances)
            .await?;
        distances.truncate(max_results as usize);

        let result = HomologsResult {
            distances,
            namespaces: outcome.response.namespaces,
            cached: false,
        };
        self.cache.store(key.clone(), Arc::new(result.clone()));
        info!(
            ws_ref = %key.object,
            cached = false,
            hits = result.distances.len(),
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "search complete"
        );
        Ok(result)
    }

    pub fn status(&self) -> Value {
        json!({
            "state": "OK",
            "service": about::SERVICE_NAME,
            "version": about::HOMOLOGY_DISPLAY_VERSION,
            "build": about::HOMOLOGY_BUILD_N,
            "namespace": self.config.namespace,
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "cache_entries": self.cache.len(),
        })
    }
}
