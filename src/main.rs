mod callback;
mod config;
mod detector;
mod extract;
mod guardrails;
mod intel;
mod llm;
mod responder;
mod safety;
mod server;
mod session;
mod templates;
mod types;


use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::llm::{LanguageModel, OpenAiCompatibleClient};
use crate::safety::SafetyFabric;
use crate::server::AppState;
use crate::session::SessionManager;

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    // LOG_LEVEL is the documented knob; an explicit RUST_LOG still wins for
    // fine-grained per-module filters.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| std::env::var("LOG_LEVEL").map(EnvFilter::new))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = AppConfig::load(Path::new("config.toml"))?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(config))
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let fabric = Arc::new(SafetyFabric::new(config.llm.max_concurrency));

    let llm: Option<Arc<dyn LanguageModel>> = if config.llm_effectively_enabled() {
        let client = OpenAiCompatibleClient::new(
            &config.llm.base_url,
            config.llm.api_key.as_deref().unwrap_or_default(),
            &config.llm.model,
        )?;
        info!(model = %config.llm.model, "llm naturalization enabled");
        Some(Arc::new(client))
    } else {
        info!("llm disabled, running template-only");
        None
    };

    let dispatcher = Arc::new(crate::callback::CallbackDispatcher::new(
        config.callback_url.clone(),
        config.retry_queue_path.clone(),
    )?);
    dispatcher.spawn_recovery();
    if config.callback_url.is_none() {
        info!("no CALLBACK_URL configured; finalization reports go to the retry queue only");
    }

    let manager = Arc::new(SessionManager::new(fabric, llm, dispatcher));
    manager.spawn_idle_reaper();

    let state = AppState {
        manager,
        api_key: Arc::from(config.api_key.as_str()),
        started_at: Instant::now(),
    };
    let app = server::build_router(state);

    let addr: std::net::SocketAddr = config.bind.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("honeypot listening on {addr}");
    axum::serve(listener, app).await?;

    Ok(())
}
