//! In-memory collaborators and fixtures for unit tests.

use crate::auth::{AuthClient, TokenInfo};
use crate::config::ServiceConfig;
use crate::error::{HomologyError, Result};
use crate::homology::{HomologySearch, SearchOutcome};
use crate::orchestrator::{Collaborators, HomologyService};
use crate::reference::ObjectReference;
use crate::sketch::{ScratchSpace, SketchArtifact, SketchInput, SketchParams, Sketcher};
use crate::translate::{IdRegistry, MappedId};
use crate::workspace::{ObjectInfo, WorkspaceClient, WorkspaceObject};
use async_trait::async_trait;
use axum::Router;
use flate2::Compression;
use flate2::write::GzEncoder;
use homology_protocol::{HomologyHit, SearchResponse};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const GOOD_TOKEN: &str = "good-token";

/// Serves `router` on an ephemeral local port and returns its base URL.
pub async fn spawn_upstream(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("mock upstream address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).expect("gzip write");
    encoder.finish().expect("gzip finish")
}

/// Deterministic pseudo-random nucleotides.
pub fn synthetic_dna(seed: u64, len: usize) -> String {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            b"ACGT"[(state >> 62) as usize] as char
        })
        .collect()
}

fn fasta(records: &[(&str, &str)]) -> Vec<u8> {
    records
        .iter()
        .map(|(id, seq)| format!(">{id}\n{seq}\n"))
        .collect::<String>()
        .into_bytes()
}

fn fastq_windows(genome: &str, read_len: usize, step: usize, prefix: &str) -> Vec<u8> {
    let mut out = String::new();
    let mut start = 0;
    while start + read_len <= genome.len() {
        let read = &genome[start..start + read_len];
        out.push_str(&format!("@{prefix}_{start}\n{read}\n+\n{}\n", "I".repeat(read_len)));
        start += step;
    }
    out.into_bytes()
}

/// A disk-backed artifact holding `bytes`, standing in for a mash sketch.
pub fn sketch_fixture(scratch: &ScratchSpace, bytes: &[u8]) -> SketchArtifact {
    let workdir = scratch.dir("sketch-").expect("sketch workdir");
    let path = workdir.path().join("sketch.msh");
    std::fs::write(&path, bytes).expect("write sketch fixture");
    SketchArtifact::from_workdir(workdir, path, scratch.sketch_in_memory).expect("sketch fixture")
}

struct StoredObject {
    info: ObjectInfo,
    data: Value,
}

pub struct FakeWorkspace {
    objects: HashMap<(u64, u64), StoredObject>,
    public_workspaces: HashSet<u64>,
    blobs: HashMap<String, Vec<u8>>,
    info_calls: AtomicUsize,
    data_calls: AtomicUsize,
    blob_calls: AtomicUsize,
}

impl FakeWorkspace {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            public_workspaces: HashSet::new(),
            blobs: HashMap::new(),
            info_calls: AtomicUsize::new(0),
            data_calls: AtomicUsize::new(0),
            blob_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_object(mut self, ws: u64, obj: u64, version: u64, type_name: &str, data: Value) -> Self {
        self.objects.insert(
            (ws, obj),
            StoredObject {
                info: ObjectInfo {
                    workspace_id: ws,
                    object_id: obj,
                    version,
                    name: format!("object_{obj}"),
                    type_name: type_name.to_string(),
                },
                data,
            },
        );
        self
    }

    pub fn with_public_workspace(mut self, ws: u64) -> Self {
        self.public_workspaces.insert(ws);
        self
    }

    pub fn with_blob(mut self, node: &str, bytes: Vec<u8>) -> Self {
        self.blobs.insert(node.to_string(), bytes);
        self
    }

    /// Reads, assemblies, contig sets and genomes across two private
    /// workspaces (15, 34819) and one public workspace (15792).
    pub fn standard() -> Self {
        let genome = synthetic_dna(7, 2000);
        let contig_a = synthetic_dna(11, 900);
        let contig_b = synthetic_dna(13, 700);
        let (first_half, second_half) = genome.split_at(1000);
        Self::new()
            .with_public_workspace(15792)
            .with_object(
                15,
                45,
                1,
                "KBaseFile.PairedEndLibrary-2.1",
                json!({
                    "lib1": { "file": { "id": "reads-fwd" } },
                    "lib2": { "file": { "id": "reads-rev" } },
                    "interleaved": 0
                }),
            )
            .with_object(
                15,
                43,
                1,
                "KBaseFile.SingleEndLibrary-2.2",
                json!({ "lib": { "file": { "id": "reads-single" } } }),
            )
            .with_object(
                34819,
                10,
                1,
                "KBaseGenomeAnnotations.Assembly-6.0",
                json!({ "fasta_handle_info": { "shock_id": "asm-fasta" } }),
            )
            .with_object(
                34819,
                11,
                1,
                "KBaseGenomes.ContigSet-3.0",
                json!({ "contigs": [
                    { "id": "c1", "sequence": contig_a },
                    { "id": "c2", "sequence": contig_b }
                ] }),
            )
            .with_object(
                34819,
                14,
                1,
                "KBaseGenomes.Genome-17.0",
                json!({
                    "scientific_name": "Escherichia coli str. K-12 substr. MG1655",
                    "taxonomy": "Bacteria; Proteobacteria; Gammaproteobacteria",
                    "assembly_ref": "34819/10/1"
                }),
            )
            .with_object(
                34819,
                15,
                1,
                "KBaseGenomes.Genome-8.2",
                json!({ "scientific_name": "Legacy genome", "contigset_ref": "34819/11/1" }),
            )
            .with_object(
                34819,
                16,
                1,
                "KBaseGenomes.Genome-17.0",
                json!({ "scientific_name": "Orphan genome" }),
            )
            .with_object(34819, 20, 1, "KBaseNarrative.Narrative-4.0", json!({}))
            .with_object(
                15792,
                227059,
                1,
                "KBaseGenomes.Genome-17.0",
                json!({ "assembly_ref": "15792/227058/1" }),
            )
            .with_object(
                15792,
                227058,
                1,
                "KBaseGenomeAnnotations.Assembly-6.0",
                json!({ "fasta_handle_info": { "shock_id": "public-fasta" } }),
            )
            .with_blob(
                "asm-fasta",
                fasta(&[("chr", &genome[..1500]), ("plasmid", &genome[1500..])]),
            )
            .with_blob("public-fasta", gzip(&fasta(&[("chr", &genome)])))
            .with_blob("reads-fwd", fastq_windows(first_half, 100, 25, "fwd"))
            .with_blob("reads-rev", gzip(&fastq_windows(second_half, 100, 25, "rev")))
            .with_blob("reads-single", fastq_windows(&genome, 100, 50, "se"))
    }

    pub fn info_calls(&self) -> usize {
        self.info_calls.load(Ordering::SeqCst)
    }

    pub fn data_calls(&self) -> usize {
        self.data_calls.load(Ordering::SeqCst)
    }

    pub fn blob_calls(&self) -> usize {
        self.blob_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.info_calls() + self.data_calls() + self.blob_calls()
    }

    /// Follows a `a;b;c` path: access is decided by the first object, the
    /// last one is returned.
    fn find(&self, ref_path: &str, token: Option<&str>) -> Result<&StoredObject> {
        let mut stored = None;
        for (position, part) in ref_path.split(';').enumerate() {
            let reference = ObjectReference::parse(part)?;
            let ws: u64 = reference.workspace.parse().map_err(|_| {
                HomologyError::invalid_reference(part, "fake workspace only knows numeric ids")
            })?;
            let obj: u64 = reference.object.parse().map_err(|_| {
                HomologyError::invalid_reference(part, "fake workspace only knows numeric ids")
            })?;
            if position == 0 && !self.public_workspaces.contains(&ws) && token != Some(GOOD_TOKEN) {
                return Err(HomologyError::Unauthorized(format!(
                    "Object {obj} cannot be accessed: Anonymous users may not read workspace {ws}"
                )));
            }
            let object = self.objects.get(&(ws, obj)).ok_or_else(|| {
                HomologyError::invalid_reference(part, format!("No object with id {obj} exists in workspace {ws}"))
            })?;
            if let Some(version) = reference.version {
                if version != object.info.version {
                    return Err(HomologyError::invalid_reference(
                        part,
                        format!("No object with id {obj} (version {version}) exists in workspace {ws}"),
                    ));
                }
            }
            stored = Some(object);
        }
        stored.ok_or_else(|| HomologyError::invalid_reference(ref_path, "empty reference path"))
    }
}

#[async_trait]
impl WorkspaceClient for FakeWorkspace {
    async fn get_object_info(&self, ref_path: &str, token: Option<&str>) -> Result<ObjectInfo> {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.find(ref_path, token)?.info.clone())
    }

    async fn get_object(&self, ref_path: &str, token: Option<&str>) -> Result<WorkspaceObject> {
        self.data_calls.fetch_add(1, Ordering::SeqCst);
        let stored = self.find(ref_path, token)?;
        Ok(WorkspaceObject {
            info: stored.info.clone(),
            data: stored.data.clone(),
        })
    }

    async fn download_blob(&self, node_id: &str, _token: Option<&str>, dest: &Path) -> Result<u64> {
        self.blob_calls.fetch_add(1, Ordering::SeqCst);
        let bytes = self
            .blobs
            .get(node_id)
            .ok_or_else(|| HomologyError::backend("blobstore", format!("Node {node_id} not found")))?;
        tokio::fs::write(dest, bytes).await?;
        Ok(bytes.len() as u64)
    }
}

#[derive(Default)]
pub struct FakeAuth {
    calls: AtomicUsize,
}

impl FakeAuth {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthClient for FakeAuth {
    async fn validate_token(&self, token: &str) -> Result<TokenInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if token == GOOD_TOKEN {
            Ok(TokenInfo {
                user: "alice".to_string(),
            })
        } else {
            Err(HomologyError::Unauthorized("10020 Invalid token".to_string()))
        }
    }
}

fn hit(sourceid: &str, dist: f64, strain: Option<&str>) -> HomologyHit {
    let mut extra = Map::new();
    if let Some(strain) = strain {
        extra.insert("strain".to_string(), json!(strain));
    }
    HomologyHit {
        sourceid: sourceid.to_string(),
        namespaceid: Some("NCBI_Refseq".to_string()),
        dist,
        extra,
    }
}

/// Backend hits in relevance order; the third id has no registry mapping.
pub fn standard_hits() -> Vec<HomologyHit> {
    vec![
        hit("GCF_000005845.2", 0.0, Some("K-12 substr. MG1655")),
        hit("GCF_000007445.1", 0.012, None),
        hit("GCF_999999999.1", 0.05, None),
        hit("GCF_000008865.2", 0.1, Some("Sakai")),
    ]
}

#[derive(Debug, Clone)]
pub enum SearchFailure {
    Backend(String),
    Timeout,
}

/// Writes `FAKE-MSH` plus the label, read flag and input sizes instead of
/// running mash.
pub struct FakeSketcher {
    scratch: ScratchSpace,
    calls: AtomicUsize,
}

impl FakeSketcher {
    pub fn new(scratch: ScratchSpace) -> Self {
        Self {
            scratch,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sketcher for FakeSketcher {
    async fn sketch(&self, input: &SketchInput<'_>) -> Result<SketchArtifact> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut body = format!("FAKE-MSH {} reads={}", input.label, input.reads);
        for path in input.files {
            let len = tokio::fs::metadata(path).await?.len();
            assert!(len > 0, "sketch input {} is empty", path.display());
            body.push_str(&format!(" {len}"));
        }
        Ok(sketch_fixture(&self.scratch, body.as_bytes()))
    }
}

pub struct FakeSearch {
    hits: Vec<HomologyHit>,
    delay: Duration,
    failure: Option<SearchFailure>,
    calls: AtomicUsize,
    seen_paths: Mutex<Vec<PathBuf>>,
    seen_bodies: Mutex<Vec<String>>,
}

impl FakeSearch {
    pub fn new(hits: Vec<HomologyHit>) -> Self {
        Self {
            hits,
            delay: Duration::ZERO,
            failure: None,
            calls: AtomicUsize::new(0),
            seen_paths: Mutex::new(Vec::new()),
            seen_bodies: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_paths(&self) -> Vec<PathBuf> {
        self.seen_paths.lock().expect("seen paths lock").clone()
    }

    pub fn seen_bodies(&self) -> Vec<String> {
        self.seen_bodies.lock().expect("seen bodies lock").clone()
    }
}

#[async_trait]
impl HomologySearch for FakeSearch {
    async fn search(&self, sketch: SketchArtifact, namespace: &str, _max_results: u32) -> Result<SearchOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let bytes = sketch.read_bytes()?;
        assert!(bytes.starts_with(b"FAKE-MSH "));
        self.seen_bodies
            .lock()
            .expect("seen bodies lock")
            .push(String::from_utf8_lossy(&bytes).into_owned());
        if let Some(path) = sketch.path() {
            assert!(path.exists());
            self.seen_paths.lock().expect("seen paths lock").push(path.to_path_buf());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.failure {
            Some(SearchFailure::Backend(message)) => {
                return Err(HomologyError::backend(
                    "homology",
                    format!("Error performing search: {message}"),
                ));
            }
            Some(SearchFailure::Timeout) => {
                return Err(HomologyError::Timeout {
                    service: "homology",
                    message: "Search request failed: operation timed out".to_string(),
                });
            }
            None => {}
        }
        Ok(SearchOutcome {
            response: SearchResponse {
                distances: self.hits.clone(),
                namespaces: vec![json!({ "id": namespace })],
                warnings: Vec::new(),
            },
            elapsed: Duration::from_millis(1),
        })
    }
}

pub struct FakeRegistry {
    mappings: HashMap<String, MappedId>,
    fail: bool,
    calls: AtomicUsize,
    requested: Mutex<Vec<String>>,
}

impl FakeRegistry {
    pub fn new(mappings: HashMap<String, MappedId>) -> Self {
        Self {
            mappings,
            fail: false,
            calls: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn standard() -> Self {
        let mapped = |kbase_id: &str, strain: Option<&str>, name: Option<&str>| MappedId {
            kbase_id: kbase_id.to_string(),
            strain: strain.map(str::to_string),
            scientific_name: name.map(str::to_string),
        };
        Self::new(HashMap::from([
            (
                "GCF_000005845.2".to_string(),
                mapped("15792/1/1", Some("registry strain"), Some("Escherichia coli")),
            ),
            (
                "GCF_000007445.1".to_string(),
                mapped("15792/2/1", Some("CFT073"), Some("Escherichia coli CFT073")),
            ),
            ("GCF_000008865.2".to_string(), mapped("15792/3/1", None, None)),
        ]))
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(HashMap::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().expect("requested lock").clone()
    }
}

#[async_trait]
impl IdRegistry for FakeRegistry {
    async fn map_ids(&self, _namespace: &str, ids: &[String]) -> Result<HashMap<String, MappedId>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().expect("requested lock").extend(ids.iter().cloned());
        if self.fail {
            return Err(HomologyError::TranslationPartialFailure(
                "Id registry returned HTTP 503 Service Unavailable".to_string(),
            ));
        }
        Ok(ids
            .iter()
            .filter_map(|id| self.mappings.get(id).map(|m| (id.clone(), m.clone())))
            .collect())
    }
}

pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        id_registry_url: Some("http://registry.invalid/map".to_string()),
        sketch: SketchParams {
            k: 15,
            sketch_size: 200,
            ..SketchParams::default()
        },
        mash_bin: "/nonexistent/mash".to_string(),
        sketch_in_memory: true,
        ..ServiceConfig::default()
    }
}

pub struct Fakes {
    pub workspace: Arc<FakeWorkspace>,
    pub auth: Arc<FakeAuth>,
    pub search: Arc<FakeSearch>,
    pub registry: Arc<FakeRegistry>,
    sketchers: Mutex<Vec<Arc<FakeSketcher>>>,
}

impl Fakes {
    pub fn standard() -> Self {
        Self {
            workspace: Arc::new(FakeWorkspace::standard()),
            auth: Arc::new(FakeAuth::default()),
            search: Arc::new(FakeSearch::new(standard_hits())),
            registry: Arc::new(FakeRegistry::standard()),
            sketchers: Mutex::new(Vec::new()),
        }
    }

    /// Sketch calls across every service built from these fakes.
    pub fn sketch_calls(&self) -> usize {
        self.sketchers
            .lock()
            .expect("sketchers lock")
            .iter()
            .map(|s| s.calls())
            .sum()
    }

    pub fn with_search_delay(self, delay: Duration) -> Self {
        let mut search = FakeSearch::new(standard_hits());
        search.delay = delay;
        Self {
            search: Arc::new(search),
            ..self
        }
    }

    pub fn with_search_failure(self, failure: SearchFailure) -> Self {
        let mut search = FakeSearch::new(standard_hits());
        search.failure = Some(failure);
        Self {
            search: Arc::new(search),
            ..self
        }
    }

    /// The sketcher shares the config's scratch space, like the mash one.
    pub fn service(&self, config: ServiceConfig) -> HomologyService {
        let sketcher = Arc::new(FakeSketcher::new(config.scratch()));
        self.sketchers
            .lock()
            .expect("sketchers lock")
            .push(sketcher.clone());
        HomologyService::new(
            Arc::new(config),
            Collaborators {
                workspace: self.workspace.clone(),
                auth: self.auth.clone(),
                sketcher,
                search: self.search.clone(),
                registry: self.registry.clone(),
            },
        )
    }
}
