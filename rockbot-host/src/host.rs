//! Agent host construction and lifecycle.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rockbot_bus::{MessageBus, Subscription};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::HostError;
use crate::pipeline::{DispatchPipeline, PipelineHandler, TypedHandler};

/// A long-running background component owned by the host.
///
/// Services run for the life of the host; the token trips on shutdown.
/// A service returning early (even with an error) never takes the host
/// down with it.
#[async_trait]
pub trait HostedService: Send + Sync {
    fn service_name(&self) -> &str;

    async fn run(self: Arc<Self>, token: CancellationToken) -> Result<(), HostError>;
}

/// Declarative construction of an agent host.
///
/// Builder operations are idempotent and order-independent: identity and
/// bus are required, everything else accumulates.
pub struct AgentHostBuilder {
    identity: Option<String>,
    bus: Option<Arc<dyn MessageBus>>,
    registrations: Vec<Box<dyn FnOnce(&mut DispatchPipeline) + Send>>,
    topics: Vec<String>,
    services: Vec<Arc<dyn HostedService>>,
}

impl AgentHostBuilder {
    pub fn new() -> Self {
        Self {
            identity: None,
            bus: None,
            registrations: Vec::new(),
            topics: Vec::new(),
            services: Vec::new(),
        }
    }

    /// Process-wide agent identity.
    pub fn identity(mut self, name: impl Into<String>) -> Self {
        self.identity = Some(name.into());
        self
    }

    pub fn bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Register a typed handler on the dispatch pipeline.
    pub fn handle<H: TypedHandler>(mut self, handler: Arc<H>) -> Self {
        self.registrations
            .push(Box::new(move |pipeline| pipeline.register(handler)));
        self
    }

    /// Open a subscription on this topic at startup, routed through the
    /// pipeline.
    pub fn subscribe_to(mut self, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        if !self.topics.contains(&topic) {
            self.topics.push(topic);
        }
        self
    }

    pub fn hosted_service(mut self, service: Arc<dyn HostedService>) -> Self {
        self.services.push(service);
        self
    }

    pub fn build(self) -> Result<AgentHost, HostError> {
        let identity = self.identity.ok_or(HostError::MissingIdentity)?;
        let bus = self.bus.ok_or(HostError::MissingBus)?;
        let mut pipeline = DispatchPipeline::new(identity.clone());
        for register in self.registrations {
            register(&mut pipeline);
        }
        Ok(AgentHost {
            identity,
            bus,
            pipeline: Arc::new(pipeline),
            topics: self.topics,
            services: self.services,
            shutdown: CancellationToken::new(),
            running: Mutex::new(RunState::default()),
        })
    }
}

impl Default for AgentHostBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct RunState {
    subscriptions: Vec<Subscription>,
    service_tasks: Vec<JoinHandle<()>>,
}

/// A running agent process: pipeline, subscriptions, hosted services.
pub struct AgentHost {
    identity: String,
    bus: Arc<dyn MessageBus>,
    pipeline: Arc<DispatchPipeline>,
    topics: Vec<String>,
    services: Vec<Arc<dyn HostedService>>,
    shutdown: CancellationToken,
    running: Mutex<RunState>,
}

impl AgentHost {
    pub fn builder() -> AgentHostBuilder {
        AgentHostBuilder::new()
    }

    pub fn agent_name(&self) -> &str {
        &self.identity
    }

    pub fn bus(&self) -> Arc<dyn MessageBus> {
        self.bus.clone()
    }

    pub fn pipeline(&self) -> Arc<DispatchPipeline> {
        self.pipeline.clone()
    }

    /// Token that trips when the host shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run every hosted service and open every registered subscription.
    pub async fn start(&self) -> Result<(), HostError> {
        let mut service_tasks = Vec::with_capacity(self.services.len());
        for service in &self.services {
            let name = service.service_name().to_string();
            let token = self.shutdown.child_token();
            let service = service.clone();
            tracing::info!(agent = %self.identity, service = %name, "starting hosted service");
            service_tasks.push(tokio::spawn(async move {
                if let Err(err) = service.run(token).await {
                    tracing::error!(service = %name, error = %err, "hosted service exited with error");
                }
            }));
        }

        let mut subscriptions = Vec::with_capacity(self.topics.len());
        for topic in &self.topics {
            let subscription_name = format!("{}.{}", self.identity, topic);
            let handler = Arc::new(PipelineHandler(self.pipeline.clone()));
            let subscription = self.bus.subscribe(topic, &subscription_name, handler).await?;
            tracing::info!(agent = %self.identity, %topic, "subscription open");
            subscriptions.push(subscription);
        }

        let mut running = self.running.lock();
        running.service_tasks = service_tasks;
        running.subscriptions = subscriptions;
        Ok(())
    }

    /// Dispose subscriptions in reverse order, then stop hosted services.
    pub async fn shutdown(&self) {
        let (subscriptions, service_tasks) = {
            let mut running = self.running.lock();
            (
                std::mem::take(&mut running.subscriptions),
                std::mem::take(&mut running.service_tasks),
            )
        };

        for subscription in subscriptions.into_iter().rev() {
            tracing::debug!(agent = %self.identity, topic = %subscription.topic(), "disposing subscription");
            subscription.dispose().await;
        }

        self.shutdown.cancel();
        for task in service_tasks {
            let _ = task.await;
        }
        tracing::info!(agent = %self.identity, "host shut down");
    }

    /// Block until the process receives ctrl-c, then shut down.
    pub async fn run_until_shutdown(&self) -> Result<(), HostError> {
        self.start().await?;
        let _ = tokio::signal::ctrl_c().await;
        self.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::pipeline::HandlerContext;
    use rockbot_bus::{BusMessage, Envelope, InMemoryBus};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize)]
    struct Tick {
        n: u32,
    }

    impl BusMessage for Tick {
        const MESSAGE_TYPE: &'static str = "tick";
    }

    struct TickHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl TypedHandler for TickHandler {
        type Message = Tick;

        async fn handle(&self, _message: Tick, _ctx: &HandlerContext) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct IdleService(Arc<AtomicBool>);

    #[async_trait]
    impl HostedService for IdleService {
        fn service_name(&self) -> &str {
            "idle"
        }

        async fn run(self: Arc<Self>, token: CancellationToken) -> Result<(), HostError> {
            self.0.store(true, Ordering::SeqCst);
            token.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_host_routes_bus_deliveries_through_pipeline() {
        let bus = Arc::new(InMemoryBus::new("test"));
        let count = Arc::new(AtomicUsize::new(0));
        let host = AgentHost::builder()
            .identity("scout")
            .bus(bus.clone())
            .handle(Arc::new(TickHandler(count.clone())))
            .subscribe_to("clock.tick")
            .build()
            .unwrap();

        host.start().await.unwrap();
        bus.publish(
            "clock.tick",
            Envelope::new("tick", br#"{"n":1}"#.to_vec(), "clock"),
        )
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while count.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("delivery never reached the handler");

        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_hosted_service_starts_and_stops() {
        let bus = Arc::new(InMemoryBus::new("test"));
        let started = Arc::new(AtomicBool::new(false));
        let host = AgentHost::builder()
            .identity("scout")
            .bus(bus)
            .hosted_service(Arc::new(IdleService(started.clone())))
            .build()
            .unwrap();

        host.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(started.load(Ordering::SeqCst));
        host.shutdown().await;
    }

    #[test]
    fn test_build_requires_identity_and_bus() {
        assert!(matches!(
            AgentHostBuilder::new().build(),
            Err(HostError::MissingIdentity)
        ));
        assert!(matches!(
            AgentHostBuilder::new().identity("a").build(),
            Err(HostError::MissingBus)
        ));
    }
}
