//! Sketches a local FASTA/FASTQ file with mash, the same way the server does.

use anyhow::{Context, Result, anyhow};
use assembly_homology::{
    about,
    resolver::{SequenceFormat, inspect_sequences},
    sketch::{
        DEFAULT_MASH_BIN, MASH_BIN_ENV, MashSketcher, ScratchSpace, SketchInput, SketchParams,
        Sketcher,
    },
};
use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};

#[derive(Serialize)]
struct SketchSummary {
    path: String,
    format: &'static str,
    records: usize,
    bases: u64,
    k: usize,
    sketch_size: usize,
    min_copies: u32,
    mash: String,
    bytes: u64,
    sha1: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
}

struct Options {
    params: SketchParams,
    fastq: bool,
    mash: String,
    output: Option<String>,
    input: String,
}

fn usage() {
    eprintln!(
        "Usage:\n  \
  homology_sketch --version\n  \
  homology_sketch [--k N] [--size N] [--min-copies N] [--fastq] [--mash BIN] [--out PATH] INPUT\n\n  \
  INPUT may be gzip-compressed. Files ending in .fq/.fastq (optionally .gz)\n  \
  are sketched as reads; everything else as FASTA contigs.\n  \
  The mash executable defaults to ${MASH_BIN_ENV} or '{DEFAULT_MASH_BIN}'.\n  \
  Prints a JSON summary; --out also keeps the .msh sketch."
    );
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: Option<&String>) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    let value = value.ok_or_else(|| format!("Missing value after {flag}"))?;
    value
        .parse::<T>()
        .map_err(|e| format!("Invalid value for {flag} '{value}': {e}"))
}

fn parse_path(flag: &str, value: Option<&String>) -> Result<String, String> {
    value
        .cloned()
        .ok_or_else(|| format!("Missing value after {flag}"))
}

fn looks_like_fastq(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    let stem = lower.strip_suffix(".gz").unwrap_or(&lower);
    stem.ends_with(".fq") || stem.ends_with(".fastq")
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut params = SketchParams::default();
    let mut fastq = false;
    let mut mash = env::var(MASH_BIN_ENV)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_MASH_BIN.to_string());
    let mut output = None;
    let mut input = None;
    let mut idx = 1usize;
    while idx < args.len() {
        let arg = args[idx].as_str();
        match arg {
            "--k" => {
                params.k = parse_number(arg, args.get(idx + 1))?;
                idx += 2;
            }
            "--size" => {
                params.sketch_size = parse_number(arg, args.get(idx + 1))?;
                idx += 2;
            }
            "--min-copies" => {
                params.reads_min_copies = parse_number(arg, args.get(idx + 1))?;
                idx += 2;
            }
            "--mash" => {
                mash = parse_path(arg, args.get(idx + 1))?;
                idx += 2;
            }
            "--out" => {
                output = Some(parse_path(arg, args.get(idx + 1))?);
                idx += 2;
            }
            "--fastq" => {
                fastq = true;
                idx += 1;
            }
            other if other.starts_with("--") => {
                return Err(format!("Unknown argument '{other}'. Use --help for usage."));
            }
            other => {
                if input.is_some() {
                    return Err(format!("Unexpected extra input '{other}'"));
                }
                input = Some(other.to_string());
                idx += 1;
            }
        }
    }
    let input = input.ok_or_else(|| "Missing INPUT path".to_string())?;
    let fastq = fastq || looks_like_fastq(&input);
    Ok(Options {
        params,
        fastq,
        mash,
        output,
        input,
    })
}

fn file_label(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

async fn sketch(options: &Options) -> Result<SketchSummary> {
    let format = if options.fastq {
        SequenceFormat::Fastq
    } else {
        SequenceFormat::Fasta
    };
    let input = PathBuf::from(&options.input);
    let stats = inspect_sequences(&input, format)?;
    let sketcher = MashSketcher::new(&options.mash, options.params, ScratchSpace::default())?;
    let label = file_label(&options.input);
    let artifact = sketcher
        .sketch(&SketchInput {
            label: &label,
            files: std::slice::from_ref(&input),
            reads: options.fastq,
        })
        .await?;

    if let Some(out) = &options.output {
        let path = artifact
            .path()
            .ok_or_else(|| anyhow!("Sketch was not kept on disk"))?;
        std::fs::copy(path, out).with_context(|| format!("Could not write sketch to '{out}'"))?;
    }
    Ok(SketchSummary {
        path: options.input.clone(),
        format: if options.fastq { "fastq" } else { "fasta" },
        records: stats.records,
        bases: stats.bases,
        k: options.params.k,
        sketch_size: options.params.sketch_size,
        min_copies: if options.fastq {
            options.params.reads_min_copies
        } else {
            1
        },
        mash: sketcher.executable().to_string(),
        bytes: artifact.byte_len(),
        sha1: artifact.digest().to_string(),
        output: options.output.clone(),
    })
}

fn run() -> Result<()> {
    let args = env::args().collect::<Vec<_>>();
    if args.len() < 2 || args.iter().any(|a| a == "--help" || a == "-h") {
        usage();
        return Ok(());
    }
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("{}", about::version_cli_text());
        return Ok(());
    }
    let options = parse_args(&args).map_err(|e| anyhow!(e))?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Could not start async runtime")?;
    let summary = runtime.block_on(sketch(&options))?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}
