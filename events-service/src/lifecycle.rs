//! Startup and shutdown ordering for the pools and the HTTP listener

use shared::messaging::{InMemoryBroker, KafkaBroker, MessageBroker, MessageError};
use shared::observability::{metric_names, MetricsCollector};
use std::future::Future;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{BrokerBackend, Config};
use crate::consumer_pool::ConsumerPool;
use crate::producer_pool::ProducerPool;
use crate::registry::TopicRegistry;
use crate::routes::create_router;
use crate::server::serve_http;
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Draining => "draining",
            LifecycleState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Broker setup failed: {0}")]
    Broker(#[from] MessageError),

    #[error("HTTP listener failed: {0}")]
    Listener(#[from] io::Error),

    #[error("HTTP listener task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("HTTP listener stopped before shutdown was requested")]
    UnexpectedStop,
}

/// Broker selected by configuration.
///
/// The in-memory backend gets every configured topic created up front, so it
/// behaves like a cluster without auto-creation.
pub fn build_broker(config: &Config) -> Arc<dyn MessageBroker> {
    match config.kafka.backend {
        BrokerBackend::Kafka => Arc::new(KafkaBroker::new(config.kafka_config())),
        BrokerBackend::Memory => Arc::new(
            InMemoryBroker::new().with_topics(config.topics.entries().map(|(_, topic)| topic)),
        ),
    }
}

/// Handles built while `Starting`, waiting for a listener
pub struct Components {
    registry: Arc<TopicRegistry>,
    producers: Arc<ProducerPool>,
    consumers: ConsumerPool,
}

pub struct Coordinator {
    config: Config,
    broker: Arc<dyn MessageBroker>,
    metrics: Arc<MetricsCollector>,
    state: watch::Sender<LifecycleState>,
}

impl Coordinator {
    pub fn new(
        config: Config,
        broker: Arc<dyn MessageBroker>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let (state, _) = watch::channel(LifecycleState::Starting);
        Self {
            config,
            broker,
            metrics,
            state,
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    fn transition(&self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        self.metrics.increment_labeled(metric_names::LIFECYCLE_TRANSITIONS_TOTAL, next.as_str());
        info!(from = ?previous, to = ?next, "Lifecycle transition");
    }

    /// Build the registry and every producer and consumer.
    ///
    /// Any failure is fatal: handles created so far are released and the
    /// coordinator moves straight to `Stopped`.
    pub async fn start(&self) -> Result<Components, LifecycleError> {
        let registry = Arc::new(TopicRegistry::from_config(&self.config.topics));
        info!(event_types = registry.len(), "Topic registry built");

        let connected =
            ProducerPool::connect(registry.clone(), self.broker.as_ref(), self.metrics.clone())
                .await;
        let producers = match connected {
            Ok(pool) => Arc::new(pool),
            Err(e) => {
                error!(error = %e, "Failed to create producers");
                self.transition(LifecycleState::Stopped);
                return Err(e.into());
            }
        };

        let consumers = match ConsumerPool::connect(
            registry.clone(),
            self.broker.as_ref(),
            &self.config.kafka.consumer_group,
            self.metrics.clone(),
        )
        .await
        {
            Ok(pool) => pool,
            Err(e) => {
                error!(error = %e, "Failed to create consumers");
                producers.close_all(self.config.shutdown_grace()).await;
                self.transition(LifecycleState::Stopped);
                return Err(e.into());
            }
        };

        Ok(Components {
            registry,
            producers,
            consumers,
        })
    }

    /// Serve HTTP until `shutdown` resolves, then drain.
    ///
    /// The listener cuts off clients that stall while sending headers. See
    /// `supervise` for the drain order.
    pub async fn serve<F>(
        &self,
        components: Components,
        listener: TcpListener,
        shutdown: F,
    ) -> Result<(), LifecycleError>
    where
        F: Future<Output = ()> + Send,
    {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            registry: components.registry.clone(),
            producers: components.producers.clone(),
            metrics: self.metrics.clone(),
        });
        let router = create_router(state);

        let draining = CancellationToken::new();
        let header_timeout = self.config.header_read_timeout();
        let server = serve_http(listener, router, header_timeout, draining.clone());
        self.supervise(components, server, draining, shutdown).await
    }

    /// Run `server` next to the consumer loops until `shutdown` resolves.
    ///
    /// On shutdown `draining` is cancelled and the server gets the grace
    /// period to finish in-flight requests. A server still running after that
    /// is aborted together with every connection task it owns. Consumers are
    /// cancelled next and producers are flushed last. A server that exits on
    /// its own is reported as an error and skips `Draining`.
    async fn supervise<S, F>(
        &self,
        components: Components,
        server: S,
        draining: CancellationToken,
        shutdown: F,
    ) -> Result<(), LifecycleError>
    where
        S: Future<Output = io::Result<()>> + Send + 'static,
        F: Future<Output = ()> + Send,
    {
        let Components {
            producers,
            mut consumers,
            ..
        } = components;
        let grace = self.config.shutdown_grace();

        let consumer_cancel = CancellationToken::new();
        consumers.start(consumer_cancel.child_token());

        let mut server = tokio::spawn(server);
        info!(consumer_loops = consumers.running(), "Accepting requests");
        self.transition(LifecycleState::Running);

        let outcome = tokio::select! {
            result = &mut server => {
                let err = match result {
                    Ok(Ok(())) => LifecycleError::UnexpectedStop,
                    Ok(Err(e)) => LifecycleError::Listener(e),
                    Err(e) => LifecycleError::Join(e),
                };
                error!(error = %err, "HTTP listener exited unexpectedly");
                Err(err)
            }
            _ = shutdown => {
                self.transition(LifecycleState::Draining);
                draining.cancel();

                match tokio::time::timeout(grace, &mut server).await {
                    Ok(Ok(Ok(()))) => info!("HTTP listener drained"),
                    Ok(Ok(Err(e))) => warn!(error = %e, "HTTP listener failed while draining"),
                    Ok(Err(e)) => warn!(error = %e, "HTTP listener task failed while draining"),
                    Err(_) => {
                        warn!(
                            grace_secs = grace.as_secs(),
                            "In-flight requests outlived the grace period, aborting listener"
                        );
                        server.abort();
                        // Dropping the accept loop aborts its connection tasks
                        let _ = (&mut server).await;
                    }
                }
                Ok(())
            }
        };

        consumer_cancel.cancel();
        consumers.shutdown(grace).await;
        producers.close_all(grace).await;

        self.transition(LifecycleState::Stopped);
        outcome
    }

    /// Release handles from `start` that will never be served
    pub async fn abandon(&self, components: Components) {
        let Components {
            producers,
            mut consumers,
            ..
        } = components;
        let grace = self.config.shutdown_grace();
        consumers.shutdown(grace).await;
        producers.close_all(grace).await;
        self.transition(LifecycleState::Stopped);
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
