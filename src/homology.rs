//! Client for the remote sketch search index.

use crate::error::{HomologyError, Result};
use crate::sketch::SketchArtifact;
use async_trait::async_trait;
use homology_protocol::SearchResponse;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const SERVICE: &str = "homology";

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub response: SearchResponse,
    pub elapsed: Duration,
}

#[async_trait]
pub trait HomologySearch: Send + Sync {
    /// Submits the sketch once. The artifact is consumed and released when
    /// the call returns, whatever the outcome.
    async fn search(
        &self,
        sketch: SketchArtifact,
        namespace: &str,
        max_results: u32,
    ) -> Result<SearchOutcome>;
}

pub struct HttpHomologyClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpHomologyClient {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn search_url(&self, namespace: &str) -> String {
        format!("{}/namespace/{namespace}/search", self.base_url)
    }
}

impl fmt::Debug for HttpHomologyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpHomologyClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[async_trait]
impl HomologySearch for HttpHomologyClient {
    async fn search(
        &self,
        sketch: SketchArtifact,
        namespace: &str,
        max_results: u32,
    ) -> Result<SearchOutcome> {
        let body = sketch.to_body().await.map_err(|e| {
            HomologyError::SketchBuild(format!("Could not open sketch for upload: {e}"))
        })?;
        info!(
            namespace,
            sketch_digest = sketch.digest(),
            sketch_bytes = sketch.byte_len(),
            "starting search request"
        );
        let start = Instant::now();
        let response = self
            .client
            .post(self.search_url(namespace))
            .query(&[("max", max_results)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| HomologyError::from_transport(SERVICE, "Search request failed", e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(
                namespace,
                status = status.as_u16(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "search failed"
            );
            return Err(HomologyError::backend(
                SERVICE,
                format!("Error performing search: {text}"),
            ));
        }
        let parsed: SearchResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                HomologyError::from_transport(SERVICE, "Search response timed out", e)
            } else {
                HomologyError::backend(SERVICE, format!("Could not parse search response: {e}"))
            }
        })?;
        let elapsed = start.elapsed();
        info!(
            namespace,
            hits = parsed.distances.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "search done"
        );
        Ok(SearchOutcome {
            response: parsed,
            elapsed,
        })
    }
}
