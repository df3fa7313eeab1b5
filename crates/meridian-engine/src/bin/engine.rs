//! Ops entrypoint: loads configuration, connects the pipeline, and
//! runs the outbox publisher until interrupted.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 unrecoverable
//! runtime error.

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use meridian_engine::{EngineConfig, EngineError, InMemoryPublisher, PricingEngine};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match EngineConfig::load() {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "Invalid configuration");
            return ExitCode::from(1);
        }
    };

    let engine = match PricingEngine::connect(&config).await {
        Ok(engine) => engine,
        Err(EngineError::Config(message)) => {
            error!(%message, "Invalid configuration");
            return ExitCode::from(1);
        }
        Err(error) => {
            error!(%error, "Failed to start pricing engine");
            return ExitCode::from(2);
        }
    };

    // The broker client is an external collaborator; the recording
    // publisher keeps the loop honest until one is wired in.
    let broker = Arc::new(InMemoryPublisher::new());
    let (publisher, handle) = engine.outbox_publisher(broker);
    let publisher_task = tokio::spawn(publisher.run());

    info!("Meridian pricing engine running; Ctrl-C to stop");

    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "Failed to listen for shutdown signal");
        return ExitCode::from(2);
    }

    engine.shutdown();
    handle.shutdown().await;
    if publisher_task.await.is_err() {
        error!("Outbox publisher terminated abnormally");
        return ExitCode::from(2);
    }

    info!("Clean shutdown");
    ExitCode::SUCCESS
}
