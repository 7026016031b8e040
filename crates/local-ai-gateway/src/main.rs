// local-ai-gateway/crates/local-ai-gateway/src/main.rs

#[cfg(feature = "cli")]
use clap::Parser;
#[cfg(feature = "cli")]
use local_ai_gateway::{config::Config, run_server};

#[cfg(feature = "cli")]
#[derive(Debug, Parser)]
#[command(name = "local-ai-gateway", version, about = "Local-first AI service gateway")]
struct Cli {
    /// Listen host, overrides API_HOST
    #[arg(long)]
    host: Option<String>,

    /// Listen port, overrides API_PORT
    #[arg(long, short)]
    port: Option<u16>,

    /// Directory of <flavor>.yaml definitions, overrides FLAVOR_DIR
    #[arg(long)]
    flavor_dir: Option<std::path::PathBuf>,

    /// JSON service/provider catalog, overrides PROVIDERS_FILE
    #[arg(long)]
    providers: Option<std::path::PathBuf>,

    /// Ollama base URL, overrides OLLAMA_HOST
    #[arg(long)]
    ollama_host: Option<String>,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = Config::from_env()?;

    if let Some(host) = cli.host {
        cfg.api_host = host;
    }
    if let Some(port) = cli.port {
        cfg.api_port = port;
    }
    if cli.flavor_dir.is_some() {
        cfg.flavor_dir = cli.flavor_dir;
    }
    if cli.providers.is_some() {
        cfg.providers_file = cli.providers;
    }
    if let Some(host) = cli.ollama_host {
        cfg.ollama_host = host;
    }

    println!("🚀 Starting local AI gateway on {}:{}", cfg.api_host, cfg.api_port);
    run_server(cfg).await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
