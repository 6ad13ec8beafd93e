use clap::Parser;
use dialect_proxy::config::config_search_paths;
use dialect_proxy::{build_router, AppState, HttpProvider, ProxyConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "dialect-proxy",
    about = "Serve the Anthropic and Ollama chat APIs on top of OpenAI-compatible, OpenWebUI or Ollama backends",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Backend preset name (overrides config)
    #[arg(long)]
    backend: Option<String>,

    /// Backend base URL (overrides config and preset)
    #[arg(long)]
    base_url: Option<String>,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dialect_proxy=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = ProxyConfig::find_and_load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(backend) = cli.backend {
        config.backend.name = backend;
        config.backend.kind = None;
    }
    if let Some(base_url) = cli.base_url {
        config.backend.base_url = Some(base_url);
    }

    // Validate config eagerly
    let dialect = config.dialect()?;
    let base_url = config.effective_base_url()?;

    info!("dialect-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("  Backend:   {} ({})", config.backend.name, dialect);
    info!("  Base URL:  {}", base_url);
    info!("  API key:   {}", if config.resolve_api_key().is_some() { "configured" } else { "none" });
    info!("  Port:      {}", config.port);
    if !config.models.normal.is_empty() {
        info!("  Normal:    {}", config.models.normal);
    }
    if !config.models.small.is_empty() {
        info!("  Small:     {}", config.models.small);
    }
    info!("  Mapped:    {} models", config.models.map.len());

    let client = reqwest::Client::builder()
        .connect_timeout(config.timeouts.connect())
        .build()?;
    let provider = HttpProvider::from_config(client, &config)?;

    let port = config.port;
    let state = Arc::new(AppState::new(config, Arc::new(provider)));

    let app = build_router(state);
    let bind_addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    info!("  Anthropic clients: ANTHROPIC_BASE_URL=http://localhost:{}", port);
    info!("  Ollama clients:    OLLAMA_HOST=http://localhost:{}", port);

    axum::serve(listener, app).await?;

    Ok(())
}
