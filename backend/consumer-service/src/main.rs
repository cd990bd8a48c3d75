use anyhow::Context;
use kafka_consumer_group::{
    init_logging, start_consumer_group_as_service, Config, NopErrorHandler, PrintProcessor,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!(error = ?err, "Consumer service failed");
            eprintln!("consumer-service: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns `true` when the service stopped because it was asked to.
async fn run() -> anyhow::Result<bool> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("Failed to load configuration")?;
    init_logging(config.env);

    info!(
        env = %config.env,
        group_id = %config.group_id,
        topics = ?config.topics,
        port = config.server_port,
        "Starting consumer service"
    );

    let trigger = start_consumer_group_as_service(
        config,
        Arc::new(PrintProcessor),
        Arc::new(NopErrorHandler),
    )
    .await
    .context("Consumer group shutdown failed")?;

    if trigger.is_signal() {
        info!("Consumer service stopped");
        Ok(true)
    } else {
        error!(trigger = %trigger, "Consumer service stopped after a failure");
        Ok(false)
    }
}
