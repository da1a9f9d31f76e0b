//! Process configuration, read once at startup and shared by `Arc`.
//!
//! Nothing below the binaries looks at the environment; everything the
//! pipeline needs arrives through [`ServiceConfig`].

use crate::error::HomologyError;
use crate::sketch::{DEFAULT_MASH_BIN, MASH_BIN_ENV, ScratchSpace, SketchParams};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:5000";
pub const DEFAULT_HOMOLOGY_URL: &str = "https://homology.kbase.us";
pub const DEFAULT_KBASE_ENDPOINT: &str = "https://kbase.us/services";
pub const DEFAULT_NAMESPACE: &str = "NCBI_Refseq";
pub const DEFAULT_MAX_RESULTS: u32 = 10;

/// What the identifier translator does with hits the registry cannot map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnmappedPolicy {
    /// Keep the hit with `kbase_id: null` and `unresolved: true`.
    #[default]
    Passthrough,
    Drop,
}

impl FromStr for UnmappedPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "passthrough" | "pass" | "keep" => Ok(UnmappedPolicy::Passthrough),
            "drop" | "skip" => Ok(UnmappedPolicy::Drop),
            other => Err(format!(
                "Unknown unmapped-id policy '{other}' (expected passthrough|drop)"
            )),
        }
    }
}

#[derive(Clone)]
pub struct ServiceConfig {
    pub bind_addr: String,
    pub homology_url: String,
    pub namespace: String,
    pub workspace_url: String,
    pub blobstore_url: String,
    pub auth_url: String,
    pub service_token: Option<String>,
    pub id_registry_url: Option<String>,
    pub id_mapping_path: Option<PathBuf>,
    pub unmapped_policy: UnmappedPolicy,
    pub cache_max_entries: usize,
    pub cache_ttl: Duration,
    pub default_max_results: u32,
    pub sketch: SketchParams,
    pub mash_bin: String,
    /// Scratch directory for downloaded sequences and sketches.
    pub sketch_dir: Option<PathBuf>,
    pub sketch_in_memory: bool,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub log_json: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            homology_url: DEFAULT_HOMOLOGY_URL.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            workspace_url: format!("{DEFAULT_KBASE_ENDPOINT}/ws"),
            blobstore_url: format!("{DEFAULT_KBASE_ENDPOINT}/shock-api"),
            auth_url: format!("{DEFAULT_KBASE_ENDPOINT}/auth"),
            service_token: None,
            id_registry_url: None,
            id_mapping_path: None,
            unmapped_policy: UnmappedPolicy::default(),
            cache_max_entries: 512,
            cache_ttl: Duration::from_secs(3600),
            default_max_results: DEFAULT_MAX_RESULTS,
            sketch: SketchParams::default(),
            mash_bin: DEFAULT_MASH_BIN.to_string(),
            sketch_dir: None,
            sketch_in_memory: false,
            request_timeout: Duration::from_millis(60_000),
            connect_timeout: Duration::from_millis(5_000),
            log_json: true,
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("bind_addr", &self.bind_addr)
            .field("homology_url", &self.homology_url)
            .field("namespace", &self.namespace)
            .field("workspace_url", &self.workspace_url)
            .field("blobstore_url", &self.blobstore_url)
            .field("auth_url", &self.auth_url)
            .field("has_service_token", &self.service_token.is_some())
            .field("id_registry_url", &self.id_registry_url)
            .field("id_mapping_path", &self.id_mapping_path)
            .field("unmapped_policy", &self.unmapped_policy)
            .field("cache_max_entries", &self.cache_max_entries)
            .field("cache_ttl", &self.cache_ttl)
            .field("default_max_results", &self.default_max_results)
            .field("sketch", &self.sketch)
            .field("mash_bin", &self.mash_bin)
            .field("sketch_dir", &self.sketch_dir)
            .field("sketch_in_memory", &self.sketch_in_memory)
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("log_json", &self.log_json)
            .finish()
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn trim_url(raw: String) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any key lookup. Unset keys keep their
    /// defaults; keys that are set but unparsable are rejected.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| non_empty(lookup(name));
        let get_u64 = |name: &str, default: u64| -> Result<u64, String> {
            match get(name) {
                Some(raw) => raw
                    .parse::<u64>()
                    .map_err(|e| format!("Invalid value for {name} '{raw}': {e}")),
                None => Ok(default),
            }
        };
        let get_bool = |name: &str, default: bool| -> Result<bool, String> {
            match get(name) {
                Some(raw) => parse_bool(&raw)
                    .ok_or_else(|| format!("Invalid boolean for {name}: '{raw}'")),
                None => Ok(default),
            }
        };

        let defaults = Self::default();
        let endpoint = get("KBASE_ENDPOINT")
            .map(trim_url)
            .unwrap_or_else(|| DEFAULT_KBASE_ENDPOINT.to_string());
        let sketch = SketchParams {
            k: get_u64("HOMOLOGY_SKETCH_K", defaults.sketch.k as u64)? as usize,
            sketch_size: get_u64("HOMOLOGY_SKETCH_SIZE", defaults.sketch.sketch_size as u64)?
                as usize,
            reads_min_copies: get_u64(
                "HOMOLOGY_SKETCH_READS_MIN_COPIES",
                defaults.sketch.reads_min_copies as u64,
            )? as u32,
        };
        let unmapped_policy = match get("HOMOLOGY_UNMAPPED_POLICY") {
            Some(raw) => raw.parse::<UnmappedPolicy>()?,
            None => UnmappedPolicy::default(),
        };

        let config = Self {
            bind_addr: get("HOMOLOGY_BIND").unwrap_or(defaults.bind_addr),
            homology_url: get("KBASE_HOMOLOGY_URL")
                .map(trim_url)
                .unwrap_or(defaults.homology_url),
            namespace: get("HOMOLOGY_NAMESPACE").unwrap_or(defaults.namespace),
            workspace_url: get("KBASE_WORKSPACE_URL")
                .map(trim_url)
                .unwrap_or_else(|| format!("{endpoint}/ws")),
            blobstore_url: get("KBASE_BLOBSTORE_URL")
                .map(trim_url)
                .unwrap_or_else(|| format!("{endpoint}/shock-api")),
            auth_url: get("KBASE_AUTH_URL")
                .map(trim_url)
                .unwrap_or_else(|| format!("{endpoint}/auth")),
            service_token: get("KBASE_SECURE_CONFIG_PARAM_service_token"),
            id_registry_url: get("HOMOLOGY_ID_REGISTRY_URL").map(trim_url),
            id_mapping_path: get("HOMOLOGY_ID_MAPPING_PATH").map(PathBuf::from),
            unmapped_policy,
            cache_max_entries: get_u64(
                "HOMOLOGY_CACHE_MAX_ENTRIES",
                defaults.cache_max_entries as u64,
            )? as usize,
            cache_ttl: Duration::from_secs(get_u64(
                "HOMOLOGY_CACHE_TTL_SECS",
                defaults.cache_ttl.as_secs(),
            )?),
            default_max_results: get_u64(
                "HOMOLOGY_DEFAULT_MAX_RESULTS",
                defaults.default_max_results as u64,
            )? as u32,
            sketch,
            mash_bin: get(MASH_BIN_ENV).unwrap_or(defaults.mash_bin),
            sketch_dir: get("HOMOLOGY_SKETCH_DIR").map(PathBuf::from),
            sketch_in_memory: get_bool("HOMOLOGY_SKETCH_IN_MEMORY", defaults.sketch_in_memory)?,
            request_timeout: Duration::from_millis(get_u64(
                "HOMOLOGY_REQUEST_TIMEOUT_MS",
                defaults.request_timeout.as_millis() as u64,
            )?),
            connect_timeout: Duration::from_millis(get_u64(
                "HOMOLOGY_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout.as_millis() as u64,
            )?),
            log_json: get_bool("HOMOLOGY_LOG_JSON", defaults.log_json)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.sketch.validate()?;
        if self.default_max_results == 0 {
            return Err("HOMOLOGY_DEFAULT_MAX_RESULTS must be at least 1".to_string());
        }
        if self.cache_max_entries == 0 {
            return Err("HOMOLOGY_CACHE_MAX_ENTRIES must be at least 1".to_string());
        }
        if self.namespace.contains('/') {
            return Err(format!(
                "HOMOLOGY_NAMESPACE '{}' must not contain '/'",
                self.namespace
            ));
        }
        if self.id_registry_url.is_none() && self.id_mapping_path.is_none() {
            return Err(
                "Configure HOMOLOGY_ID_REGISTRY_URL or HOMOLOGY_ID_MAPPING_PATH to translate result ids"
                    .to_string(),
            );
        }
        Ok(())
    }

    pub fn scratch(&self) -> ScratchSpace {
        ScratchSpace {
            dir: self.sketch_dir.clone(),
            sketch_in_memory: self.sketch_in_memory,
        }
    }

    /// Shared outbound client; timeouts here are the only timeouts the
    /// pipeline has.
    pub fn http_client(&self) -> Result<reqwest::Client, HomologyError> {
        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| HomologyError::Internal(format!("Could not create HTTP client: {e}")))
    }
}
