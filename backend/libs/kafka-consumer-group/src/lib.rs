//! # Kafka Consumer Group
//!
//! Managed consumer-group runtime: joins a Kafka consumer group, drains every
//! assigned partition through a pluggable [`Processor`], commits progress and
//! shuts everything down in a coordinated way when a signal or a failure
//! arrives.
//!
//! ## Commit policy
//!
//! Offsets are marked and committed after every message **whether or not
//! processing succeeded**. A failed message is handed to the injected
//! [`ErrorHandler`] (dead-lettering, alerting) and is never redelivered by
//! Kafka. Recovery from processing failures is the error handler's job.
//!
//! ## Lifecycle
//!
//! 1. [`ConsumerGroup::start`] loops over consumer group generations until a
//!    fatal error or cancellation, reporting exactly one error on its channel.
//! 2. For every partition of a generation the runtime calls back into
//!    [`MessagePipeline`], which runs [`claim::consume_claim`].
//! 3. [`ShutdownOrchestrator`] waits for the first of {consumer error, OS
//!    signal, service error}, cancels the shared token, waits for the consumer
//!    task and then closes the group and the HTTP service.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use kafka_consumer_group::{
//!     init_logging, start_consumer_group_as_service, Config, NopErrorHandler, PrintProcessor,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = Config::from_env()?;
//! init_logging(cfg.env);
//!
//! let trigger = start_consumer_group_as_service(
//!     cfg,
//!     Arc::new(PrintProcessor),
//!     Arc::new(NopErrorHandler),
//! )
//! .await?;
//! println!("stopped by {trigger}");
//! # Ok(())
//! # }
//! ```

pub mod claim;
pub mod config;
mod error;
pub mod group;
pub mod kafka;
pub mod logging;
mod message;
pub mod metrics;
mod processor;
pub mod server;
pub mod service;
pub mod session;
pub mod shutdown;

pub use config::{Config, OffsetReset, SaslMechanism, SecurityProtocol};
pub use error::{ConsumerError, ConsumerResult};
pub use group::{ConsumerGroup, MessagePipeline};
pub use kafka::KafkaGroupRuntime;
pub use logging::{init_logging, Environment};
pub use message::RawMessage;
pub use metrics::{ConsumerMetrics, Telemetry};
pub use processor::{ErrorHandler, NopErrorHandler, PrintProcessor, Processor};
pub use server::{start_server, HealthState, ServiceHandle};
pub use service::{run_until_shutdown, start_consumer_group_as_service};
pub use session::{GroupHandler, GroupRuntime, GroupSession, PartitionClaim};
pub use shutdown::{shutdown_signal, ShutdownOrchestrator, ShutdownState, ShutdownTrigger};
