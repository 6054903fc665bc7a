use chat_bridge::config::config_search_paths;
use chat_bridge::logging::{DiagnosticEntry, DiagnosticKind};
use chat_bridge::{build_router, AppState, BridgeConfig, DiagnosticsLog, HttpGateway};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "chat-bridge",
    about = "Serve typed-block chat clients from flat-message chat upstreams",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Upstream alias used by routes without one (overrides config)
    #[arg(long)]
    upstream: Option<String>,

    /// Diagnostics journal path (JSONL)
    #[arg(long, default_value = "chat-bridge.diagnostics.jsonl")]
    log_file: PathBuf,

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
                .unwrap_or_else(|_| "chat_bridge=info,tower_http=info".into()),
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

    let mut config = BridgeConfig::find_and_load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(upstream) = cli.upstream {
        config.default_upstream = Some(upstream);
        config.validate()?;
    }

    let diagnostics = DiagnosticsLog::open(&cli.log_file)?;

    info!("chat-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("  Port:      {}", config.port);
    for (alias, upstream) in &config.upstreams {
        let marker = if config.default_upstream.as_deref() == Some(alias.as_str()) {
            " (default)"
        } else {
            ""
        };
        info!(
            "  Upstream:  {}{} -> {} model={} key={}",
            alias,
            marker,
            upstream.base_url,
            if upstream.default_model.is_empty() { "<none>" } else { upstream.default_model.as_str() },
            if upstream.resolve_api_key().is_some() { "configured" } else { "passthrough" },
        );
    }
    info!("  Journal:   {}", cli.log_file.display());

    diagnostics.record(
        DiagnosticEntry::new(
            DiagnosticKind::Startup,
            format!("Starting chat-bridge on port {}", config.port),
        )
        .with_context(serde_json::json!({
            "upstreams": config.upstreams.keys().collect::<Vec<_>>(),
        })),
    );

    let port = config.port;
    let config = Arc::new(config);
    let gateway = HttpGateway::new(config.clone())?;
    let state = Arc::new(AppState::new(config, gateway, diagnostics));

    let app = build_router(state);
    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    info!("  Typed-block clients: POST http://localhost:{}/v1/messages", port);

    axum::serve(listener, app).await?;

    Ok(())
}
