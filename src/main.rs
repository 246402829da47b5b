use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use doppel::config::PersonaConfig;
use doppel::engine::PersonaEngine;
use doppel::generator::OllamaGenerator;
use doppel::telegram::{TelegramTransport, TRANSPORT_NAME};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,doppel=debug")),
        )
        .init();

    let config = PersonaConfig::load();
    tracing::info!(
        "Doppel starting (model: {}, base probability: {})",
        config.generator.model,
        config.response_probability
    );

    let generator = Arc::new(OllamaGenerator::new(config.generator.clone()));
    let engine = PersonaEngine::new(config).await;
    engine.bind_generator(generator).await;

    if engine.config().telegram.token.is_some() {
        let sink = engine.event_sink(TRANSPORT_NAME);
        let transport = TelegramTransport::new(&engine.config().telegram, sink)?;
        engine.register_transport(Arc::new(transport)).await;
    } else {
        tracing::warn!("No telegram token configured; engine runs without transports");
    }

    engine.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    engine.stop().await;
    Ok(())
}
