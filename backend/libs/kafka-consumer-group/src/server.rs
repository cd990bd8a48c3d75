//! HTTP service co-hosted with the consumer: `/status` and `/metrics`.

use actix_web::{dev::ServerHandle, web, App, HttpResponse, HttpServer};
use chrono::Utc;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{ConsumerError, ConsumerResult};
use crate::metrics::Telemetry;

/// Liveness probe run on every `/status` request.
pub type HealthCheck = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// State behind the `/status` endpoint.
#[derive(Clone)]
pub struct HealthState {
    name: String,
    timeout: Duration,
    shutdown: CancellationToken,
    check: Option<HealthCheck>,
}

impl HealthState {
    /// `shutdown` is the token the orchestrator cancels when draining starts;
    /// from then on the service reports itself unavailable.
    pub fn new(name: impl Into<String>, timeout: Duration, shutdown: CancellationToken) -> Self {
        Self {
            name: name.into(),
            timeout,
            shutdown,
            check: None,
        }
    }

    pub fn with_check(mut self, check: HealthCheck) -> Self {
        self.check = Some(check);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> Result<(), String> {
        if self.shutdown.is_cancelled() {
            return Err("shutting down".to_string());
        }
        let Some(check) = &self.check else {
            return Ok(());
        };
        match tokio::time::timeout(self.timeout, check()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!("health check timed out after {:?}", self.timeout)),
        }
    }
}

async fn status(state: web::Data<HealthState>) -> HttpResponse {
    let timestamp = Utc::now().to_rfc3339();
    match state.probe().await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({
            "name": state.name(),
            "status": "OK",
            "timestamp": timestamp,
        })),
        Err(reason) => HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "name": state.name(),
            "status": "Unavailable",
            "error": reason,
            "timestamp": timestamp,
        })),
    }
}

async fn serve_metrics(telemetry: web::Data<Telemetry>) -> HttpResponse {
    match telemetry.encode() {
        Ok((content_type, buffer)) => HttpResponse::Ok().content_type(content_type).body(buffer),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

/// Register the service routes on an actix `ServiceConfig`.
pub fn configure(
    health: HealthState,
    telemetry: Telemetry,
) -> impl Fn(&mut web::ServiceConfig) + Clone + Send + 'static {
    move |cfg: &mut web::ServiceConfig| {
        cfg.app_data(web::Data::new(health.clone()))
            .app_data(web::Data::new(telemetry.clone()))
            .route("/status", web::get().to(status))
            .route("/metrics", web::get().to(serve_metrics));
    }
}

/// Running HTTP service.
pub struct ServiceHandle {
    handle: ServerHandle,
    task: JoinHandle<()>,
    stopping: CancellationToken,
}

impl ServiceHandle {
    /// Stop accepting connections, drain in-flight requests and join the
    /// server task.
    pub async fn close(self) -> ConsumerResult<()> {
        info!("Stopping HTTP service...");
        self.stopping.cancel();
        self.handle.stop(true).await;
        self.task
            .await
            .map_err(|err| ConsumerError::ServiceClose(err.to_string()))
    }
}

/// Bind `0.0.0.0:port` and serve in the background.
///
/// Signal handling is left to the caller. The returned receiver gets the
/// server's error if it stops without [`ServiceHandle::close`] being called.
pub fn start_server(
    port: u16,
    health: HealthState,
    telemetry: Telemetry,
) -> ConsumerResult<(ServiceHandle, mpsc::Receiver<ConsumerError>)> {
    let name = health.name().to_string();
    let routes = configure(health, telemetry);

    let server = HttpServer::new(move || App::new().configure(routes.clone()))
        .workers(1)
        .disable_signals()
        .bind(("0.0.0.0", port))?
        .run();

    let handle = server.handle();
    let (tx, rx) = mpsc::channel(1);
    let stopping = CancellationToken::new();
    let guard = stopping.clone();

    info!(name = %name, port, "HTTP service is running");
    let task = tokio::spawn(async move {
        let err = match server.await {
            Ok(()) if guard.is_cancelled() => return,
            Ok(()) => ConsumerError::ServiceStopped,
            Err(err) => {
                error!(error = %err, "HTTP service failed");
                ConsumerError::Io(err)
            }
        };
        let _ = tx.try_send(err);
    });

    Ok((
        ServiceHandle {
            handle,
            task,
            stopping,
        },
        rx,
    ))
}
