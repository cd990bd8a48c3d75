//! Host entry point wiring the consumer group, the HTTP service and the
//! shutdown sequence together.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{ConsumerError, ConsumerResult};
use crate::group::ConsumerGroup;
use crate::metrics::Telemetry;
use crate::processor::{ErrorHandler, Processor};
use crate::server::{start_server, HealthState, ServiceHandle};
use crate::session::GroupRuntime;
use crate::shutdown::{shutdown_signal, ShutdownOrchestrator, ShutdownTrigger};

/// Run a Kafka consumer group next to its `/status` + `/metrics` service until
/// a signal or a failure shuts both down.
///
/// Returns the trigger that ended the run. `Err` means setup or teardown
/// failed.
pub async fn start_consumer_group_as_service(
    cfg: Config,
    processor: Arc<dyn Processor>,
    error_handler: Arc<dyn ErrorHandler>,
) -> ConsumerResult<ShutdownTrigger> {
    let telemetry = Telemetry::new(cfg.metrics_namespace())?;
    let cancel = CancellationToken::new();

    let health = HealthState::new(
        cfg.deployment_name.clone(),
        cfg.healthcheck_timeout(),
        cancel.clone(),
    );
    let service = start_server(cfg.server_port, health, telemetry.clone())?;

    let group = match ConsumerGroup::from_config(&cfg, processor, error_handler, &telemetry) {
        Ok(group) => Arc::new(group),
        Err(err) => {
            error!(error = %err, "Failed to create consumer group");
            if let Err(close_err) = service.0.close().await {
                error!(error = %close_err, "Failed to close HTTP service");
            }
            return Err(err);
        }
    };

    run_until_shutdown(group, Some(service), cancel, shutdown_signal()).await
}

/// Drive `group` until the first shutdown trigger, then drain and close.
///
/// `cancel` is shared with the consumer loop and any health state the service
/// reads.
pub async fn run_until_shutdown<R, S>(
    group: Arc<ConsumerGroup<R>>,
    service: Option<(ServiceHandle, mpsc::Receiver<ConsumerError>)>,
    cancel: CancellationToken,
    signal: S,
) -> ConsumerResult<ShutdownTrigger>
where
    R: GroupRuntime + 'static,
    S: Future<Output = ()>,
{
    let tracker = TaskTracker::new();
    let orchestrator = ShutdownOrchestrator::new(cancel.clone(), tracker.clone());
    let (errors_tx, mut consumer_errors) = mpsc::channel(1);

    {
        let group = group.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move { group.start(cancel, errors_tx).await });
    }
    info!(topics = ?group.topics(), "Consumer group started");

    let (handle, mut service_errors) = match service {
        Some((handle, errors)) => (Some(handle), Some(errors)),
        None => (None, None),
    };

    let trigger = orchestrator
        .wait_for_trigger(&mut consumer_errors, service_errors.as_mut(), signal)
        .await?;

    orchestrator.close(group.as_ref(), handle).await?;
    info!(trigger = %trigger, "Consumer group shut down");

    Ok(trigger)
}
