//! compendium-sync: Dev server and pack build for compendium sources.
//!
//! `serve` keeps a directory of JSON files in step with the compendiums of a
//! running application; `build` compiles that directory into packs.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use compendium_sync_core::config::{ModuleManifest, SyncOptions};
use compendium_sync_core::transform::{Identity, Transformer};
use compendium_sync_server::compile::{compile_packs, CommandCompiler, DEFAULT_COMPILER};
use compendium_sync_server::dev_server::DevServer;
use compendium_sync_server::server::WebSocketServer;
use compendium_sync_server::transform::CommandTransformer;

#[derive(Parser, Debug)]
#[command(name = "compendium-sync")]
#[command(about = "Sync compendium packs with a directory of JSON files")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the dev server
    Serve(ServeArgs),
    /// Compile the data directory into packs
    Build(BuildArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Path to the package manifest
    #[arg(long, default_value = "module.json")]
    module: PathBuf,

    /// Project root; data directory is relative to it
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Address to listen on for the running application
    #[arg(short, long, default_value = "127.0.0.1:5173")]
    listen: String,

    #[arg(long, default_value = "data")]
    data_directory: String,

    /// Command each record is piped through before it is written
    #[arg(long)]
    transformer: Option<String>,

    /// Do not sync Adventure documents
    #[arg(long)]
    ignore_adventure_hmr: bool,
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Path to the package manifest
    #[arg(long, default_value = "module.json")]
    module: PathBuf,

    /// Project root; data and output directories are relative to it
    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[arg(long, default_value = "data")]
    data_directory: String,

    #[arg(long, default_value = "packs")]
    output_directory: String,

    /// Command template run per pack ({name}, {src}, {dest}, {out})
    #[arg(long, default_value = DEFAULT_COMPILER)]
    compiler: String,
}

async fn load_manifest(path: &Path) -> Result<ModuleManifest> {
    let content = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&content).with_context(|| format!("Invalid manifest {}", path.display()))
}

async fn serve(args: ServeArgs) -> Result<()> {
    let manifest = load_manifest(&args.module).await?;
    info!("Starting compendium sync for {}", manifest.id);
    info!("Project root: {:?}", args.root);

    let options = SyncOptions {
        data_directory: args.data_directory,
        ignore_adventure_hmr: args.ignore_adventure_hmr,
        ..SyncOptions::default()
    };

    let transformer: Arc<dyn Transformer> = match args.transformer {
        Some(command_line) => {
            info!("Transformer: {}", command_line);
            Arc::new(CommandTransformer::new(command_line))
        }
        None => Arc::new(Identity),
    };

    let dev_server = DevServer::new(args.root, options, transformer);
    dev_server.prepare().await?;

    let listener = WebSocketServer::bind(&args.listen).await?;
    let watcher = dev_server.watch()?;
    info!("Watching {}", dev_server.options().data_root());

    info!("Dev server running. Press Ctrl+C to stop.");
    dev_server
        .run(listener, watcher, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("Shutting down");
    Ok(())
}

async fn build(args: BuildArgs) -> Result<()> {
    let manifest = load_manifest(&args.module).await?;
    info!("Compiling packs for {}", manifest.id);

    let options = SyncOptions {
        data_directory: args.data_directory,
        output_directory: args.output_directory,
        ..SyncOptions::default()
    };
    let compiler = CommandCompiler::new(args.compiler);
    let count = compile_packs(&args.root, &options, &compiler).await?;

    info!("Compiled {} pack(s) into {}", count, options.output_root());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if cli.verbose {
        "debug,compendium_sync_server=debug,compendium_sync_core=debug"
    } else {
        "info,compendium_sync_server=info,compendium_sync_core=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Build(args) => build(args).await,
    }
}
