//! JSON-RPC homology search server.

use anyhow::{Context, Result, anyhow};
use assembly_homology::{HomologyService, about, config::ServiceConfig, server};
use std::env;
use std::sync::Arc;
use tracing::info;

fn usage() {
    println!(
        "Usage:\n  \
homology_server [--bind ADDR] [--help|-h] [--version|-V]\n\n  \
Serves get_homologs and status over JSON-RPC 1.1 on POST / and /rpc,\n  \
plus GET /health. Everything else is read from the environment\n  \
(KBASE_ENDPOINT, KBASE_HOMOLOGY_URL, HOMOLOGY_ID_REGISTRY_URL, ...).\n\n  \
Default bind address: {default_bind}\n",
        default_bind = assembly_homology::config::DEFAULT_BIND_ADDR
    );
}

fn parse_bind(args: &[String]) -> Result<Option<String>, String> {
    let mut bind = None;
    let mut idx = 1usize;
    while idx < args.len() {
        match args[idx].as_str() {
            "--bind" => {
                if idx + 1 >= args.len() {
                    return Err("Missing ADDR after --bind".to_string());
                }
                bind = Some(args[idx + 1].clone());
                idx += 2;
            }
            other => {
                return Err(format!("Unknown argument '{other}'. Use --help for usage."));
            }
        }
    }
    Ok(bind)
}

fn run() -> Result<()> {
    let args = env::args().collect::<Vec<_>>();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        usage();
        return Ok(());
    }
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("{}", about::version_cli_text());
        return Ok(());
    }
    let bind = parse_bind(&args).map_err(|e| anyhow!(e))?;
    let mut config = ServiceConfig::from_env().map_err(|e| anyhow!("Invalid configuration: {e}"))?;
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    server::init_tracing(config.log_json);
    info!(version = about::HOMOLOGY_DISPLAY_VERSION, config = ?config, "starting homology server");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Could not start async runtime")?;
    runtime.block_on(async move {
        let bind_addr = config.bind_addr.clone();
        let service = HomologyService::from_config(Arc::new(config))
            .context("Could not initialise homology service")?;
        server::serve(Arc::new(service), &bind_addr)
            .await
            .with_context(|| format!("Server on {bind_addr} failed"))
    })
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}
