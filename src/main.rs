use std::sync::Arc;

use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use symstore::config::{ServerConfig, StorageConfig};
use symstore::server::{self, AppState};
use symstore::{StorageError, SymbolIndexingResult};

#[derive(Parser)]
#[command(name = "symstored")]
#[command(about = "Symbol package ingestion and PDB store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(long, help = "Config file path")]
    config: Option<String>,

    #[arg(long, help = "Listen address (overrides config)")]
    listen: Option<String>,

    #[arg(long, help = "Filesystem symbol store path (overrides config)")]
    storage_path: Option<String>,

    #[arg(long, help = "Output as JSON")]
    json: bool,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Serve the upload and download endpoints (default)
    Serve,
    /// Index a local symbol package once
    Index { archive: String },
    /// Copy a stored object out by key
    Fetch { key: String, output: String },
    GenerateConfig {
        #[arg(long, default_value = "symstore.toml", help = "Config file path")]
        output: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("symstore=info,symstored=info")),
        )
        .init();

    let cli = Cli::parse();

    if let Some(Commands::GenerateConfig { output }) = &cli.command {
        ServerConfig::default().save(output)?;
        if cli.json {
            println!("{}", serde_json::json!({"success": true, "path": output}));
        } else {
            println!("✅ Wrote default config to {}", output);
        }
        return Ok(());
    }

    let mut config = ServerConfig::load_or_create(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen_address = listen;
    }
    if let Some(path) = cli.storage_path {
        config.storage = StorageConfig::Filesystem { path: path.into() };
    }

    if let Err(e) = config.ensure_directories() {
        if cli.json {
            let message = format!("Failed to create directories: {}", e);
            println!("{}", serde_json::json!({ "error": message }));
        } else {
            eprintln!("❌ Failed to create directories: {}", e);
        }
        return Err(e);
    }

    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState::from_config(&config, shutdown.clone()).await?);

    match cli.command {
        None | Some(Commands::Serve) => {
            let ctrl_c = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for shutdown signal: {}", e);
                    return;
                }
                info!("Shutdown requested");
                ctrl_c.cancel();
            });
            server::run_on(&config.listen_address, state).await
        }
        Some(Commands::Index { archive }) => {
            let mut file = tokio::fs::File::open(&archive).await?;
            let result = state.indexer.index(&mut file, &shutdown).await;

            if cli.json {
                println!("{}", serde_json::json!({"archive": archive, "result": result}));
            } else if result == SymbolIndexingResult::Success {
                println!("✅ Indexed {}", archive);
            } else {
                println!("❌ Indexing {} failed: {:?}", archive, result);
            }
            if result != SymbolIndexingResult::Success {
                anyhow::bail!("indexing finished with {:?}", result);
            }
            Ok(())
        }
        Some(Commands::Fetch { key, output }) => {
            let mut stream = match state.storage.load(&key).await {
                Ok(s) => s,
                Err(StorageError::NotFound(_)) => {
                    if cli.json {
                        println!("{}", serde_json::json!({"error": "not found", "key": key}));
                    } else {
                        println!("❌ No object stored at {}", key);
                    }
                    anyhow::bail!("no object stored at {}", key);
                }
                Err(e) => return Err(e.into()),
            };

            let mut out = tokio::fs::File::create(&output).await?;
            let bytes = tokio::io::copy(&mut stream, &mut out).await?;
            out.flush().await?;

            if cli.json {
                println!("{}", serde_json::json!({"key": key, "output": output, "bytes": bytes}));
            } else {
                println!("✅ Wrote {} bytes to {}", bytes, output);
            }
            Ok(())
        }
        Some(Commands::GenerateConfig { .. }) => Ok(()),
    }
}
