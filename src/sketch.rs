//! Mash sketches of resolved sequences.
//!
//! The remote index only loads Mash `.msh` files, so the sketch itself is
//! built by the `mash` executable. This module prepares its input, runs it
//! and keeps the output alive until the search call consumes it.

use crate::error::{HomologyError, Result};
use crate::resolver::open_plain;
use async_trait::async_trait;
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::{NamedTempFile, TempDir};
use tokio::process::Command;
use tracing::debug;

pub const DEFAULT_MASH_BIN: &str = "mash";
pub const MASH_BIN_ENV: &str = "HOMOLOGY_MASH_BIN";
const SKETCH_FILE: &str = "sketch.msh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SketchParams {
    pub k: usize,
    pub sketch_size: usize,
    pub reads_min_copies: u32,
}

impl Default for SketchParams {
    fn default() -> Self {
        Self {
            k: 21,
            sketch_size: 1000,
            reads_min_copies: 2,
        }
    }
}

impl SketchParams {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.k == 0 || self.k > 32 {
            return Err(format!("Sketch k must be within 1..=32, got {}", self.k));
        }
        if self.sketch_size == 0 {
            return Err("Sketch size must be at least 1".to_string());
        }
        if self.reads_min_copies == 0 {
            return Err("Minimum k-mer copies for reads must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Where downloads and sketches are written, and whether a finished sketch
/// is pulled into memory before upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScratchSpace {
    pub dir: Option<PathBuf>,
    pub sketch_in_memory: bool,
}

impl ScratchSpace {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            sketch_in_memory: false,
        }
    }

    pub fn file(&self, prefix: &str, suffix: &str) -> std::io::Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix).suffix(suffix);
        match &self.dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
    }

    pub fn dir(&self, prefix: &str) -> std::io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix);
        match &self.dir {
            Some(dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        }
    }
}

#[derive(Debug)]
enum SketchStorage {
    Memory(Vec<u8>),
    Disk { _workdir: TempDir, path: PathBuf },
}

/// A single-use `.msh` sketch. A disk-backed artifact deletes its working
/// directory when dropped.
#[derive(Debug)]
pub struct SketchArtifact {
    storage: SketchStorage,
    digest: String,
    byte_len: u64,
}

impl SketchArtifact {
    /// Takes ownership of `workdir` holding a finished sketch at `path`.
    pub fn from_workdir(workdir: TempDir, path: PathBuf, in_memory: bool) -> Result<Self> {
        let mut hasher = Sha1::new();
        let byte_len = File::open(&path)
            .and_then(|mut file| std::io::copy(&mut file, &mut hasher))
            .map_err(|e| {
                HomologyError::SketchBuild(format!("Could not read sketch '{}': {e}", path.display()))
            })?;
        if byte_len == 0 {
            return Err(HomologyError::SketchBuild(format!(
                "sketch '{}' is empty",
                path.display()
            )));
        }
        let digest = format!("{:x}", hasher.finalize());
        let storage = if in_memory {
            let bytes = std::fs::read(&path).map_err(|e| {
                HomologyError::SketchBuild(format!("Could not read sketch '{}': {e}", path.display()))
            })?;
            SketchStorage::Memory(bytes)
        } else {
            SketchStorage::Disk {
                _workdir: workdir,
                path,
            }
        };
        Ok(Self {
            storage,
            digest,
            byte_len,
        })
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn byte_len(&self) -> u64 {
        self.byte_len
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.storage {
            SketchStorage::Memory(_) => None,
            SketchStorage::Disk { path, .. } => Some(path),
        }
    }

    pub fn read_bytes(&self) -> std::io::Result<Vec<u8>> {
        match &self.storage {
            SketchStorage::Memory(bytes) => Ok(bytes.clone()),
            SketchStorage::Disk { path, .. } => std::fs::read(path),
        }
    }

    /// Request body for the search call. Disk-backed sketches are streamed
    /// from the file rather than read into memory first.
    pub async fn to_body(&self) -> std::io::Result<reqwest::Body> {
        match &self.storage {
            SketchStorage::Memory(bytes) => Ok(reqwest::Body::from(bytes.clone())),
            SketchStorage::Disk { path, .. } => {
                let handle = tokio::fs::File::open(path).await?;
                Ok(reqwest::Body::from(handle))
            }
        }
    }
}

/// One sketch request: every file is folded into a single sketch named
/// after `label`.
#[derive(Debug, Clone)]
pub struct SketchInput<'a> {
    pub label: &'a str,
    pub files: &'a [PathBuf],
    pub reads: bool,
}

#[async_trait]
pub trait Sketcher: Send + Sync {
    async fn sketch(&self, input: &SketchInput<'_>) -> Result<SketchArtifact>;
}

/// Mash stores the input name inside the sketch; keep it stable and plain.
pub fn sketch_label(raw: &str) -> String {
    let label: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let label = label.trim_start_matches('.');
    if label.is_empty() {
        "sequence".to_string()
    } else {
        label.to_string()
    }
}

pub fn mash_args(params: &SketchParams, reads: bool, input: &str, output: &Path) -> Vec<String> {
    let mut args = vec![
        "sketch".to_string(),
        "-k".to_string(),
        params.k.to_string(),
        "-s".to_string(),
        params.sketch_size.to_string(),
    ];
    if reads {
        args.extend([
            "-r".to_string(),
            "-m".to_string(),
            params.reads_min_copies.to_string(),
        ]);
    }
    args.extend([
        "-o".to_string(),
        output.display().to_string(),
        input.to_string(),
    ]);
    args
}

/// Streams every input into `dest` as plain text, inflating gzip members
/// and keeping records of adjacent files on separate lines.
pub fn concatenate_plain<W: Write>(inputs: &[PathBuf], dest: &mut W) -> std::io::Result<u64> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    let mut last = b'\n';
    for path in inputs {
        if last != b'\n' {
            dest.write_all(b"\n")?;
            total += 1;
            last = b'\n';
        }
        let mut reader = open_plain(path)?;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            dest.write_all(&buf[..n])?;
            total += n as u64;
            last = buf[n - 1];
        }
    }
    dest.flush()?;
    Ok(total)
}

/// Places the input in `workdir` under `label`. A single file is linked
/// (or copied across filesystems); several are concatenated.
fn stage_input(workdir: &Path, label: &str, files: &[PathBuf]) -> std::io::Result<()> {
    let staged = workdir.join(label);
    match files {
        [single] => {
            if std::fs::hard_link(single, &staged).is_err() {
                std::fs::copy(single, &staged)?;
            }
            Ok(())
        }
        many => {
            let mut out = std::io::BufWriter::new(File::create(&staged)?);
            concatenate_plain(many, &mut out)?;
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
pub struct MashSketcher {
    executable: String,
    params: SketchParams,
    scratch: ScratchSpace,
}

impl MashSketcher {
    pub fn new(executable: impl Into<String>, params: SketchParams, scratch: ScratchSpace) -> Result<Self> {
        params.validate().map_err(HomologyError::SketchBuild)?;
        let executable = executable.into().trim().to_string();
        Ok(Self {
            executable: if executable.is_empty() {
                DEFAULT_MASH_BIN.to_string()
            } else {
                executable
            },
            params,
            scratch,
        })
    }

    pub fn params(&self) -> &SketchParams {
        &self.params
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    async fn run_mash(&self, workdir: &Path, args: &[String]) -> Result<()> {
        let output = Command::new(&self.executable)
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == ErrorKind::NotFound {
                    HomologyError::SketchBuild(format!(
                        "Could not find mash executable '{}'. Install mash or set {MASH_BIN_ENV}",
                        self.executable
                    ))
                } else {
                    HomologyError::SketchBuild(format!(
                        "Could not run mash executable '{}' with args [{}]: {e}",
                        self.executable,
                        args.join(" ")
                    ))
                }
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HomologyError::SketchBuild(format!(
                "mash command failed: {} {} (status={:?}, stderr='{}')",
                self.executable,
                args.join(" "),
                output.status.code(),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Sketcher for MashSketcher {
    async fn sketch(&self, input: &SketchInput<'_>) -> Result<SketchArtifact> {
        if input.files.is_empty() {
            return Err(HomologyError::SketchBuild(
                "no sequence files to sketch".to_string(),
            ));
        }
        let workdir = self.scratch.dir("sketch-").map_err(|e| {
            HomologyError::SketchBuild(format!("Could not create sketch directory: {e}"))
        })?;
        let label = sketch_label(input.label);
        let staging_dir = workdir.path().to_path_buf();
        let files = input.files.to_vec();
        let staged_label = label.clone();
        tokio::task::spawn_blocking(move || stage_input(&staging_dir, &staged_label, &files))
            .await
            .map_err(|e| HomologyError::Internal(format!("Sketch staging task failed: {e}")))?
            .map_err(|e| HomologyError::SketchBuild(format!("Could not stage sketch input: {e}")))?;

        let output = workdir.path().join(SKETCH_FILE);
        let args = mash_args(&self.params, input.reads, &label, &output);
        self.run_mash(workdir.path(), &args).await?;
        // the staged copy is no longer needed once mash has read it
        let _ = tokio::fs::remove_file(workdir.path().join(&label)).await;

        if !output.exists() {
            return Err(HomologyError::SketchBuild(format!(
                "mash reported success but did not write '{}'",
                output.display()
            )));
        }
        let in_memory = self.scratch.sketch_in_memory;
        let artifact = tokio::task::spawn_blocking(move || {
            SketchArtifact::from_workdir(workdir, output, in_memory)
        })
        .await
        .map_err(|e| HomologyError::Internal(format!("Sketch digest task failed: {e}")))??;
        debug!(
            label = %label,
            reads = input.reads,
            files = input.files.len(),
            bytes = artifact.byte_len(),
            digest = artifact.digest(),
            "mash sketch written"
        );
        Ok(artifact)
    }
}
