//! Start a chat-bridge server programmatically, with one upstream defined in code.
//!
//! Usage:
//!   export OPENAI_API_KEY=sk-your-key
//!   cargo run --example basic_proxy

use chat_bridge::{build_router, AppState, BridgeConfig, DiagnosticsLog, HttpGateway, UpstreamConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut upstream = UpstreamConfig::new("https://api.openai.com/v1");
    upstream.api_key_env = Some("OPENAI_API_KEY".to_string());
    upstream.default_model = "gpt-4o-mini".to_string();

    let mut config = BridgeConfig::default();
    config.upstreams.insert("openai".to_string(), upstream);
    config.default_upstream = Some("openai".to_string());
    config.validate()?;

    for (alias, upstream) in &config.upstreams {
        println!("Upstream: {} ({})", alias, upstream.base_url);
    }

    let port = config.port;
    let config = Arc::new(config);
    let gateway = HttpGateway::new(config.clone())?;
    let state = Arc::new(AppState::new(config, gateway, DiagnosticsLog::in_memory()));

    let app = build_router(state);
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("Listening on http://{}", addr);
    println!();
    println!("  ANTHROPIC_BASE_URL=http://localhost:{} <your client>", port);

    axum::serve(listener, app).await?;
    Ok(())
}
