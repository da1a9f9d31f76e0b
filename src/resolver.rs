//! Turns a workspace reference into sequence files ready for sketching.

use crate::error::{HomologyError, Result};
use crate::reference::ObjectReference;
use crate::sketch::ScratchSpace;
use crate::workspace::{ObjectInfo, WorkspaceClient, WorkspaceObject};
use bio::io::{fasta, fastq};
use flate2::read::MultiGzDecoder;
use serde_json::Value;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::debug;

pub const PAIRED_END_LIBRARY: &str = "KBaseFile.PairedEndLibrary";
pub const SINGLE_END_LIBRARY: &str = "KBaseFile.SingleEndLibrary";
pub const ASSEMBLY: &str = "KBaseGenomeAnnotations.Assembly";
pub const CONTIG_SET: &str = "KBaseGenomes.ContigSet";
pub const GENOME: &str = "KBaseGenomes.Genome";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceKind {
    PairedEndReads,
    SingleEndReads,
    GenomeAssembly,
    GenomeContigSet,
    Assembly,
}

impl SequenceKind {
    pub fn is_reads(&self) -> bool {
        matches!(self, SequenceKind::PairedEndReads | SequenceKind::SingleEndReads)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SequenceKind::PairedEndReads => "paired_end_reads",
            SequenceKind::SingleEndReads => "single_end_reads",
            SequenceKind::GenomeAssembly => "genome_assembly",
            SequenceKind::GenomeContigSet => "genome_contigset",
            SequenceKind::Assembly => "assembly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceFormat {
    Fasta,
    Fastq,
}

impl SequenceFormat {
    fn label(&self) -> &'static str {
        match self {
            SequenceFormat::Fasta => "FASTA",
            SequenceFormat::Fastq => "FASTQ",
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            SequenceFormat::Fasta => ".fa",
            SequenceFormat::Fastq => ".fq",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceStats {
    pub records: usize,
    pub bases: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceMetadata {
    pub scientific_name: Option<String>,
    pub taxonomy: Option<String>,
}

/// A downloaded (or written) sequence file, deleted on drop.
#[derive(Debug)]
pub struct SequenceFile {
    file: NamedTempFile,
    pub format: SequenceFormat,
    pub stats: SequenceStats,
}

impl SequenceFile {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

#[derive(Debug)]
pub struct ResolvedSequence {
    /// Always carries the resolved version.
    pub reference: ObjectReference,
    pub kind: SequenceKind,
    pub files: Vec<SequenceFile>,
    pub metadata: SequenceMetadata,
}

impl ResolvedSequence {
    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| f.path().to_path_buf()).collect()
    }

    pub fn stats(&self) -> SequenceStats {
        self.files.iter().fold(SequenceStats::default(), |acc, f| SequenceStats {
            records: acc.records + f.stats.records,
            bases: acc.bases + f.stats.bases,
        })
    }
}

/// Opens `path` for reading, inflating it when it starts with the gzip
/// magic (multi-member files included).
pub fn open_plain(path: &Path) -> std::io::Result<Box<dyn Read + Send>> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let mut filled = 0;
    while filled < magic.len() {
        let n = file.read(&mut magic[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    file.rewind()?;
    if filled == magic.len() && magic == GZIP_MAGIC {
        Ok(Box::new(MultiGzDecoder::new(BufReader::new(file))))
    } else {
        Ok(Box::new(file))
    }
}

fn parse_failure(format: SequenceFormat, e: impl std::fmt::Display) -> HomologyError {
    HomologyError::SketchBuild(format!("Could not parse {}: {e}", format.label()))
}

/// Streams through a FASTA/FASTQ file (optionally gzipped), validating each
/// record and counting records and bases.
pub fn inspect_sequences(path: &Path, format: SequenceFormat) -> Result<SequenceStats> {
    let reader = open_plain(path).map_err(|e| {
        HomologyError::SketchBuild(format!("Could not open sequence file '{}': {e}", path.display()))
    })?;
    let mut stats = SequenceStats::default();
    match format {
        SequenceFormat::Fasta => {
            for record in fasta::Reader::new(reader).records() {
                let record = record.map_err(|e| parse_failure(format, e))?;
                record.check().map_err(|e| {
                    HomologyError::SketchBuild(format!("Invalid FASTA record '{}': {e}", record.id()))
                })?;
                stats.records += 1;
                stats.bases += record.seq().len() as u64;
            }
        }
        SequenceFormat::Fastq => {
            for record in fastq::Reader::new(reader).records() {
                let record = record.map_err(|e| parse_failure(format, e))?;
                record.check().map_err(|e| {
                    HomologyError::SketchBuild(format!("Invalid FASTQ record '{}': {e}", record.id()))
                })?;
                stats.records += 1;
                stats.bases += record.seq().len() as u64;
            }
        }
    }
    if stats.records == 0 || stats.bases == 0 {
        return Err(HomologyError::SketchBuild(format!(
            "{} payload contains no sequence data",
            format.label()
        )));
    }
    Ok(stats)
}

fn write_contigs(dest: &Path, contigs: &[(String, String)]) -> std::io::Result<()> {
    let mut out = BufWriter::new(File::create(dest)?);
    for (id, seq) in contigs {
        writeln!(out, ">{id}")?;
        writeln!(out, "{seq}")?;
    }
    out.flush()
}

fn string_at<'a>(data: &'a Value, pointer: &str) -> Option<&'a str> {
    data.pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn scratch_failure(e: std::io::Error) -> HomologyError {
    HomologyError::Internal(format!("Could not create scratch file: {e}"))
}

pub struct ReferenceResolver {
    workspace: Arc<dyn WorkspaceClient>,
    scratch: ScratchSpace,
}

impl ReferenceResolver {
    pub fn new(workspace: Arc<dyn WorkspaceClient>, scratch: ScratchSpace) -> Self {
        Self { workspace, scratch }
    }

    /// Access-checked lookup of the object's resolved version and type.
    pub async fn locate(&self, reference: &ObjectReference, token: Option<&str>) -> Result<ObjectInfo> {
        self.workspace
            .get_object_info(&reference.to_string(), token)
            .await
    }

    pub async fn resolve(&self, reference: &ObjectReference, token: Option<&str>) -> Result<ResolvedSequence> {
        let info = self.locate(reference, token).await?;
        self.load(&info, token).await
    }

    /// Fetches the sequence payload of an already located object into
    /// scratch files.
    pub async fn load(&self, info: &ObjectInfo, token: Option<&str>) -> Result<ResolvedSequence> {
        let pinned = info.reference();
        let kind = match info.base_type() {
            PAIRED_END_LIBRARY => SequenceKind::PairedEndReads,
            SINGLE_END_LIBRARY => SequenceKind::SingleEndReads,
            ASSEMBLY | CONTIG_SET => SequenceKind::Assembly,
            GENOME => return self.load_genome(&pinned, token).await,
            other => {
                return Err(HomologyError::invalid_reference(
                    &pinned.to_string(),
                    format!("unsupported object type '{other}'"),
                ));
            }
        };
        let object = self.workspace.get_object(&pinned.to_string(), token).await?;
        let files = match kind {
            SequenceKind::PairedEndReads => self.paired_end_reads(&object, token).await?,
            SequenceKind::SingleEndReads => vec![self.single_end_reads(&object, token).await?],
            _ => vec![self.assembly_file(&object, token).await?],
        };
        let resolved = ResolvedSequence {
            reference: pinned,
            kind,
            files,
            metadata: SequenceMetadata::default(),
        };
        let stats = resolved.stats();
        debug!(
            ws_ref = %resolved.reference,
            kind = kind.as_str(),
            files = resolved.files.len(),
            records = stats.records,
            bases = stats.bases,
            "resolved sequence"
        );
        Ok(resolved)
    }

    async fn load_genome(&self, pinned: &ObjectReference, token: Option<&str>) -> Result<ResolvedSequence> {
        let genome = self.workspace.get_object(&pinned.to_string(), token).await?;
        let metadata = SequenceMetadata {
            scientific_name: string_at(&genome.data, "/scientific_name").map(str::to_string),
            taxonomy: string_at(&genome.data, "/taxonomy").map(str::to_string),
        };
        let (kind, link) = if let Some(link) = string_at(&genome.data, "/assembly_ref") {
            (SequenceKind::GenomeAssembly, link)
        } else if let Some(link) = string_at(&genome.data, "/contigset_ref") {
            (SequenceKind::GenomeContigSet, link)
        } else {
            return Err(HomologyError::MissingAssemblyReference {
                reference: pinned.to_string(),
            });
        };
        let linked = ObjectReference::parse(link)?;
        let linked_object = self
            .workspace
            .get_object(&pinned.path_to(&linked), token)
            .await?;
        match linked_object.info.base_type() {
            ASSEMBLY | CONTIG_SET => {}
            other => {
                return Err(HomologyError::invalid_reference(
                    &pinned.to_string(),
                    format!("genome links to '{link}' of unsupported type '{other}'"),
                ));
            }
        }
        let file = self.assembly_file(&linked_object, token).await?;
        debug!(
            ws_ref = %pinned,
            linked = %linked,
            kind = kind.as_str(),
            records = file.stats.records,
            bases = file.stats.bases,
            scientific_name = metadata.scientific_name.as_deref().unwrap_or(""),
            taxonomy = metadata.taxonomy.as_deref().unwrap_or(""),
            "resolved genome"
        );
        Ok(ResolvedSequence {
            reference: pinned.clone(),
            kind,
            files: vec![file],
            metadata,
        })
    }

    async fn assembly_file(&self, object: &WorkspaceObject, token: Option<&str>) -> Result<SequenceFile> {
        if object.info.base_type() == CONTIG_SET {
            let contigs: Vec<(String, String)> = object
                .data
                .get("contigs")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default()
                .iter()
                .enumerate()
                .filter_map(|(idx, contig)| {
                    let seq = contig.get("sequence").and_then(Value::as_str)?;
                    let id = contig
                        .get("id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("contig_{}", idx + 1));
                    Some((id, seq.to_string()))
                })
                .collect();
            return self.write_file(contigs).await;
        }
        let node = string_at(&object.data, "/fasta_handle_info/shock_id").ok_or_else(|| {
            HomologyError::invalid_reference(
                &object.info.reference().to_string(),
                "assembly has no FASTA blob",
            )
        })?;
        self.fetch_file(node, SequenceFormat::Fasta, token).await
    }

    async fn paired_end_reads(&self, object: &WorkspaceObject, token: Option<&str>) -> Result<Vec<SequenceFile>> {
        let first = string_at(&object.data, "/lib1/file/id").ok_or_else(|| {
            HomologyError::invalid_reference(
                &object.info.reference().to_string(),
                "paired-end library has no lib1 file",
            )
        })?;
        let mut files = vec![self.fetch_file(first, SequenceFormat::Fastq, token).await?];
        if let Some(second) = string_at(&object.data, "/lib2/file/id") {
            files.push(self.fetch_file(second, SequenceFormat::Fastq, token).await?);
        }
        Ok(files)
    }

    async fn single_end_reads(&self, object: &WorkspaceObject, token: Option<&str>) -> Result<SequenceFile> {
        let node = string_at(&object.data, "/lib/file/id").ok_or_else(|| {
            HomologyError::invalid_reference(
                &object.info.reference().to_string(),
                "single-end library has no lib file",
            )
        })?;
        self.fetch_file(node, SequenceFormat::Fastq, token).await
    }

    async fn fetch_file(&self, node: &str, format: SequenceFormat, token: Option<&str>) -> Result<SequenceFile> {
        let file = self.scratch.file("seq-", format.suffix()).map_err(scratch_failure)?;
        let bytes = self.workspace.download_blob(node, token, file.path()).await?;
        let stats = self.inspect(file.path(), format).await?;
        debug!(node, bytes, records = stats.records, "downloaded sequence file");
        Ok(SequenceFile { file, format, stats })
    }

    async fn write_file(&self, contigs: Vec<(String, String)>) -> Result<SequenceFile> {
        let file = self.scratch.file("seq-", SequenceFormat::Fasta.suffix()).map_err(scratch_failure)?;
        let dest = file.path().to_path_buf();
        tokio::task::spawn_blocking(move || write_contigs(&dest, &contigs))
            .await
            .map_err(|e| HomologyError::Internal(format!("Contig writing task failed: {e}")))?
            .map_err(|e| HomologyError::Internal(format!("Could not write contigs: {e}")))?;
        let stats = self.inspect(file.path(), SequenceFormat::Fasta).await?;
        Ok(SequenceFile {
            file,
            format: SequenceFormat::Fasta,
            stats,
        })
    }

    async fn inspect(&self, path: &Path, format: SequenceFormat) -> Result<SequenceStats> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || inspect_sequences(&path, format))
            .await
            .map_err(|e| HomologyError::Internal(format!("Sequence inspection task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeWorkspace, GOOD_TOKEN, gzip};
    use tempfile::tempdir;

    fn resolver(ws: FakeWorkspace, scratch: &Path) -> ReferenceResolver {
        ReferenceResolver::new(Arc::new(ws), ScratchSpace::in_dir(scratch))
    }

    async fn resolve(scratch: &Path, raw: &str, token: Option<&str>) -> Result<ResolvedSequence> {
        resolver(FakeWorkspace::standard(), scratch)
            .resolve(&ObjectReference::parse(raw).unwrap(), token)
            .await
    }

    fn write(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn inspects_plain_and_gzipped_fasta() {
        let dir = tempdir().unwrap();
        let fasta = b">a desc\nACGT\nACGT\n>b\nGGCC\n";
        let plain = inspect_sequences(&write(dir.path(), "a.fa", fasta), SequenceFormat::Fasta).unwrap();
        assert_eq!(plain, SequenceStats { records: 2, bases: 12 });
        let zipped =
            inspect_sequences(&write(dir.path(), "a.fa.gz", &gzip(fasta)), SequenceFormat::Fasta).unwrap();
        assert_eq!(plain, zipped);
    }

    #[test]
    fn open_plain_reads_concatenated_gzip_members() {
        let dir = tempdir().unwrap();
        let mut bytes = gzip(b"@r1\nACGT\n+\nIIII\n");
        bytes.extend(gzip(b"@r2\nGG\n+\nII\n"));
        let path = write(dir.path(), "multi.fq.gz", &bytes);
        let stats = inspect_sequences(&path, SequenceFormat::Fastq).unwrap();
        assert_eq!(stats, SequenceStats { records: 2, bases: 6 });
    }

    #[test]
    fn malformed_payloads_are_sketch_errors() {
        let dir = tempdir().unwrap();
        let cases: [(&str, &[u8], SequenceFormat); 4] = [
            ("bad.fa", b"not a fasta file", SequenceFormat::Fasta),
            ("empty.fq", b"", SequenceFormat::Fastq),
            ("broken.gz", &[0x1f, 0x8b, 0, 1], SequenceFormat::Fasta),
            ("short.fq", b"@r1\nACGT\n+\nII\n", SequenceFormat::Fastq),
        ];
        for (name, bytes, format) in cases {
            let err = inspect_sequences(&write(dir.path(), name, bytes), format).unwrap_err();
            assert_eq!(err.kind(), "SketchBuildError", "{name}");
        }
    }

    #[tokio::test]
    async fn paired_end_reads_include_both_files() {
        let dir = tempdir().unwrap();
        let seq = resolve(dir.path(), "15/45/1", Some(GOOD_TOKEN)).await.unwrap();
        assert_eq!(seq.kind, SequenceKind::PairedEndReads);
        assert_eq!(seq.reference.to_string(), "15/45/1");
        assert_eq!(seq.files.len(), 2);
        assert!(seq.files.iter().all(|f| f.format == SequenceFormat::Fastq));
        let single_file = resolve(dir.path(), "15/43/1", Some(GOOD_TOKEN)).await.unwrap();
        assert_eq!(single_file.kind, SequenceKind::SingleEndReads);
        assert_eq!(single_file.files.len(), 1);
        assert!(seq.stats().records > single_file.stats().records);
    }

    #[tokio::test]
    async fn genomes_follow_assembly_then_contigset_links() {
        let dir = tempdir().unwrap();
        let with_assembly = resolve(dir.path(), "34819/14", Some(GOOD_TOKEN)).await.unwrap();
        assert_eq!(with_assembly.kind, SequenceKind::GenomeAssembly);
        assert_eq!(with_assembly.reference.to_string(), "34819/14/1");
        assert_eq!(
            with_assembly.metadata.scientific_name.as_deref(),
            Some("Escherichia coli str. K-12 substr. MG1655")
        );
        assert_eq!(with_assembly.stats(), SequenceStats { records: 2, bases: 2000 });

        let with_contigs = resolve(dir.path(), "34819/15/1", Some(GOOD_TOKEN)).await.unwrap();
        assert_eq!(with_contigs.kind, SequenceKind::GenomeContigSet);
        assert_eq!(with_contigs.stats(), SequenceStats { records: 2, bases: 1600 });
        let written = std::fs::read_to_string(with_contigs.files[0].path()).unwrap();
        assert!(written.starts_with(">c1\n"));
    }

    #[tokio::test]
    async fn scratch_files_are_removed_with_the_sequence() {
        let dir = tempdir().unwrap();
        let seq = resolve(dir.path(), "15/45/1", Some(GOOD_TOKEN)).await.unwrap();
        let paths = seq.paths();
        assert!(paths.iter().all(|p| p.starts_with(dir.path()) && p.exists()));
        drop(seq);
        assert!(paths.iter().all(|p| !p.exists()));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn genome_without_links_is_missing_assembly() {
        let dir = tempdir().unwrap();
        let err = resolve(dir.path(), "34819/16/1", Some(GOOD_TOKEN)).await.unwrap_err();
        assert_eq!(err.kind(), "MissingAssemblyReference");
        assert!(err.to_string().contains("no assembly or contigset references"));
    }

    #[tokio::test]
    async fn private_objects_need_a_token_and_public_ones_do_not() {
        let dir = tempdir().unwrap();
        let err = resolve(dir.path(), "34819/10/1", None).await.unwrap_err();
        assert_eq!(err.kind(), "Unauthorized");
        assert!(!err.to_string().is_empty());

        let public = resolve(dir.path(), "15792/227059/1", None).await.unwrap();
        assert_eq!(public.kind, SequenceKind::GenomeAssembly);
    }

    #[tokio::test]
    async fn unsupported_types_are_invalid_references() {
        let dir = tempdir().unwrap();
        let err = resolve(dir.path(), "34819/20/1", Some(GOOD_TOKEN)).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidReference");
        assert!(err.to_string().contains("KBaseNarrative.Narrative"));
    }

    #[tokio::test]
    async fn locate_does_not_fetch_data() {
        let dir = tempdir().unwrap();
        let ws = Arc::new(FakeWorkspace::standard());
        let resolver = ReferenceResolver::new(ws.clone(), ScratchSpace::in_dir(dir.path()));
        let info = resolver
            .locate(&ObjectReference::parse("34819/10").unwrap(), Some(GOOD_TOKEN))
            .await
            .unwrap();
        assert_eq!(info.version, 1);
        assert_eq!(ws.data_calls(), 0);
        assert_eq!(ws.blob_calls(), 0);
    }
}
