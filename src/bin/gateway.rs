//! Agentflow Gateway - WebSocket 网关服务器
//!
//! 运行方式：
//! ```bash
//! cargo run --bin agentflow-gateway --features gateway
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use agentflow::config::load_config;
use agentflow::fsm::{create_stores, load_definitions, TracingSideEffects, TransitionEngine};
use agentflow::gateway::Hub;
use agentflow::observability;
use agentflow::orchestration::{rule_based_actors, OrchestrationRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("failed to load configuration")?;

    let (sessions, definitions) = create_stores(cfg.storage.db_path.as_deref()).await;
    if let Some(path) = &cfg.engine.definitions_file {
        let loaded = load_definitions(definitions.as_ref(), path)
            .await
            .with_context(|| format!("failed to load definitions from {}", path.display()))?;
        tracing::info!("Loaded {} state machine definitions", loaded);
    }
    let engine = Arc::new(TransitionEngine::new(
        sessions,
        definitions,
        Arc::new(TracingSideEffects),
    ));

    let registry = Arc::new(OrchestrationRegistry::from_config(
        rule_based_actors(),
        &cfg.orchestration,
    ));

    let hub = Arc::new(Hub::new(
        cfg.gateway.clone(),
        cfg.orchestration.agent_name.clone(),
        Arc::clone(&registry),
        engine,
    ));
    let listener = hub.bind().await?;

    let sweeper = Arc::clone(&registry).spawn_sweeper(
        Duration::from_secs(cfg.orchestration.cleanup_interval_secs.max(1)),
        hub.shutdown_token(),
    );
    let server = tokio::spawn(Arc::clone(&hub).serve(listener));

    tracing::info!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down gateway...");
    hub.stop();
    let _ = server.await;
    let _ = sweeper.await;

    Ok(())
}
