//! Service state management and component initialization

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{BusBackend, ServiceConfig, StorageBackend};
use energy_monitor::{
    BucketStore, ChatRelay, HourlyAggregator, MeasurementListener, MemoryBucketStore, MonitorMetrics,
    NotificationRelay, PgBucketStore, RealtimeHub, ThresholdNotifier,
};
use fact_replication::{
    DeviceEventMessage, DeviceRecord, FactConsumer, LinkStore, MemoryLinkStore, MemoryReplicaStore,
    OwnershipLinks, PgFactStore, RemotePropagator, ReplicaStore, UserEventMessage, UserRecord,
};
use fleet_bus::topology::{
    declare_fleet_topology, declare_ingest_queues, declare_service_queues, device_queue, ingest_queue,
    user_queue,
};
use fleet_bus::{EventBus, InMemoryBus, RedisBus, SubscriptionHandle};
use replica_balancer::{
    discovery_from_config, BalancerMetrics, HttpProxy, QueueRouter, ReplicaDiscovery, StaticDiscovery,
    WeightedSelector,
};

/// Address the balancer uses for replicas hosted in its own process
const LOCAL_REPLICA_HOST: &str = "127.0.0.1";

/// Which parts of the fleet this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ServiceRole {
    /// HTTP proxy plus the measurement queue router
    LoadBalancer,
    /// Fact replicas, measurement listener and reporting REST
    Monitoring,
    /// Overconsumption and chat relays
    Relay,
    All,
}

impl ServiceRole {
    pub fn runs_balancer(&self) -> bool {
        matches!(self, ServiceRole::LoadBalancer | ServiceRole::All)
    }

    pub fn runs_monitoring(&self) -> bool {
        matches!(self, ServiceRole::Monitoring | ServiceRole::All)
    }

    pub fn runs_relay(&self) -> bool {
        matches!(self, ServiceRole::Relay | ServiceRole::All)
    }
}

/// Addresses the HTTP servers actually bound
#[derive(Debug, Clone, Default)]
pub struct BoundAddresses {
    pub balancer: Option<SocketAddr>,
    pub monitor: Option<SocketAddr>,
}

/// Service state containing all initialized components
pub struct ServiceState {
    /// Service configuration
    pub config: ServiceConfig,

    pub role: ServiceRole,

    /// Event bus shared with the rest of the fleet
    pub bus: Arc<dyn EventBus>,

    /// Real-time topics shared by the aggregator and the relays
    pub hub: Arc<RealtimeHub>,

    pub users: Arc<dyn ReplicaStore<UserRecord>>,
    pub devices: Arc<dyn ReplicaStore<DeviceRecord>>,
    pub links: Arc<dyn LinkStore>,
    pub buckets: Arc<dyn BucketStore>,

    /// Device-owner links pushed by peer services
    pub ownership: Arc<OwnershipLinks>,

    pub aggregator: Arc<HourlyAggregator>,

    pub discovery: Arc<dyn ReplicaDiscovery>,
    pub selector: Arc<WeightedSelector>,

    pub balancer_metrics: Arc<BalancerMetrics>,
    pub monitor_metrics: Arc<MonitorMetrics>,

    /// Running bus consumers
    subscriptions: Mutex<Vec<SubscriptionHandle>>,

    /// Flips to `true` when HTTP servers and the reporter must stop
    shutdown_tx: watch::Sender<bool>,

    /// Service running state
    pub is_running: Arc<RwLock<bool>>,

    pub started_at: DateTime<Utc>,
}

impl ServiceState {
    /// Create a new service state, connecting the bus named in the configuration.
    ///
    /// The in-process bus cannot carry messages to other processes, so it is only
    /// accepted for [`ServiceRole::All`].
    pub async fn new(config: ServiceConfig, role: ServiceRole) -> Result<Self> {
        let bus: Arc<dyn EventBus> = match config.bus.backend {
            BusBackend::Memory => {
                if role != ServiceRole::All {
                    anyhow::bail!(
                        "Role {:?} needs a bus shared with the other roles; set bus.backend = \"redis\"",
                        role
                    );
                }
                Arc::new(InMemoryBus::new())
            }
            BusBackend::Redis => {
                info!("Connecting FleetBus to Redis...");
                let bus = RedisBus::connect_with_prefix(&config.bus.redis_url, &config.bus.key_prefix)
                    .await
                    .context("Failed to connect to the Redis bus")?;
                Arc::new(bus)
            }
        };
        Self::with_bus(config, role, bus).await
    }

    /// Create a new service state on a bus supplied by the caller
    pub async fn with_bus(config: ServiceConfig, role: ServiceRole, bus: Arc<dyn EventBus>) -> Result<Self> {
        info!("Initializing service components for role {:?}...", role);

        // Bus topology first; every consumer binds to it
        declare_fleet_topology(bus.as_ref()).await.context("Failed to declare bus topology")?;
        declare_ingest_queues(bus.as_ref(), config.balancer.weights.len())
            .await
            .context("Failed to declare ingest queues")?;
        bus.declare_queue(&ingest_queue(config.monitor.replica_id), true)
            .await
            .context("Failed to declare this replica's ingest queue")?;
        declare_service_queues(bus.as_ref(), &config.replication.service_name)
            .await
            .context("Failed to declare replication queues")?;

        info!("Initializing {:?} storage...", config.storage.backend);
        let (users, devices, links, buckets) = Self::open_storage(&config).await?;

        let mut ownership = OwnershipLinks::new(users.clone(), devices.clone(), links.clone());
        if let Some(peer) = RemotePropagator::from_config(&config.replication.propagation)
            .context("Failed to create RemotePropagator")?
        {
            ownership = ownership.with_peer(peer);
        }

        let hub = Arc::new(RealtimeHub::new(config.monitor.realtime_capacity));
        let monitor_metrics = Arc::new(MonitorMetrics::new());
        let balancer_metrics = Arc::new(BalancerMetrics::new());

        info!("Initializing HourlyAggregator with threshold {}...", config.monitor.threshold);
        let notifier = Arc::new(ThresholdNotifier::new(
            config.monitor.threshold,
            devices.clone(),
            bus.clone(),
            hub.clone(),
            monitor_metrics.clone(),
        ));
        let aggregator = Arc::new(HourlyAggregator::new(
            buckets.clone(),
            hub.clone(),
            notifier,
            monitor_metrics.clone(),
        ));

        let discovery: Arc<dyn ReplicaDiscovery> = if Self::hosts_every_replica(&config, role) {
            info!("Balancing across {} in-process replicas", config.balancer.weights.len());
            Arc::new(StaticDiscovery::new(vec![
                LOCAL_REPLICA_HOST.to_string();
                config.balancer.weights.len()
            ]))
        } else {
            discovery_from_config(&config.balancer)
        };
        let selector = Arc::new(WeightedSelector::new(config.balancer.weights.clone()));

        let (shutdown_tx, _) = watch::channel(false);

        info!("Service components initialized successfully");
        Ok(Self {
            config,
            role,
            bus,
            hub,
            users,
            devices,
            links,
            buckets,
            ownership: Arc::new(ownership),
            aggregator,
            discovery,
            selector,
            balancer_metrics,
            monitor_metrics,
            subscriptions: Mutex::new(Vec::new()),
            shutdown_tx,
            is_running: Arc::new(RwLock::new(false)),
            started_at: Utc::now(),
        })
    }

    /// A single process on the in-process bus stands in for the whole replica set
    fn hosts_every_replica(config: &ServiceConfig, role: ServiceRole) -> bool {
        role == ServiceRole::All && config.bus.backend == BusBackend::Memory
    }

    /// Ingest queues this process's MeasurementListener consumes
    pub fn ingest_ordinals(&self) -> Vec<usize> {
        let replica_id = self.config.monitor.replica_id;
        if !Self::hosts_every_replica(&self.config, self.role) {
            return vec![replica_id];
        }
        let replicas = self.config.balancer.weights.len();
        let mut ordinals: Vec<usize> = (1..=replicas).collect();
        if replica_id > replicas {
            ordinals.push(replica_id);
        }
        ordinals
    }

    #[allow(clippy::type_complexity)]
    async fn open_storage(
        config: &ServiceConfig,
    ) -> Result<(
        Arc<dyn ReplicaStore<UserRecord>>,
        Arc<dyn ReplicaStore<DeviceRecord>>,
        Arc<dyn LinkStore>,
        Arc<dyn BucketStore>,
    )> {
        match config.storage.backend {
            StorageBackend::Memory => {
                let users: Arc<dyn ReplicaStore<UserRecord>> = Arc::new(MemoryReplicaStore::new());
                let devices: Arc<dyn ReplicaStore<DeviceRecord>> = Arc::new(MemoryReplicaStore::new());
                let links: Arc<dyn LinkStore> = Arc::new(MemoryLinkStore::new());
                let buckets: Arc<dyn BucketStore> = Arc::new(MemoryBucketStore::new());
                Ok((users, devices, links, buckets))
            }
            StorageBackend::Postgres => {
                let url = config
                    .storage
                    .database_url
                    .as_deref()
                    .context("Postgres storage requires a database url")?;
                let facts = Arc::new(
                    PgFactStore::connect(url, config.storage.max_connections)
                        .await
                        .context("Failed to connect replica store")?,
                );
                let buckets = PgBucketStore::connect(url, config.storage.max_connections)
                    .await
                    .context("Failed to connect bucket store")?;

                let users: Arc<dyn ReplicaStore<UserRecord>> = facts.clone();
                let devices: Arc<dyn ReplicaStore<DeviceRecord>> = facts.clone();
                let links: Arc<dyn LinkStore> = facts;
                let buckets: Arc<dyn BucketStore> = Arc::new(buckets);
                Ok((users, devices, links, buckets))
            }
        }
    }

    /// Subscribe every consumer this role runs
    pub async fn start_consumers(&self) -> Result<()> {
        let mut handles = Vec::new();

        if self.role.runs_balancer() {
            info!("Starting QueueRouter...");
            let router = Arc::new(QueueRouter::new(
                self.bus.clone(),
                self.discovery.clone(),
                self.selector.clone(),
                self.balancer_metrics.clone(),
            ));
            handles.push(router.start().await.context("Failed to start QueueRouter")?);
        }

        if self.role.runs_monitoring() {
            handles.extend(self.start_replication().await?);

            let listener = Arc::new(MeasurementListener::new(
                self.aggregator.clone(),
                self.devices.clone(),
                self.monitor_metrics.clone(),
            ));
            for ordinal in self.ingest_ordinals() {
                info!("Starting MeasurementListener on {}...", ingest_queue(ordinal));
                handles.push(
                    listener
                        .clone()
                        .start(self.bus.as_ref(), ordinal)
                        .await
                        .context("Failed to start MeasurementListener")?,
                );
            }
        }

        if self.role.runs_relay() {
            info!("Starting notification and chat relays...");
            let notifications = Arc::new(NotificationRelay::new(self.hub.clone(), self.monitor_metrics.clone()));
            handles.push(notifications.start(self.bus.as_ref()).await.context("Failed to start NotificationRelay")?);

            let chat = Arc::new(ChatRelay::new(self.hub.clone(), self.monitor_metrics.clone()));
            handles.push(chat.start(self.bus.as_ref()).await.context("Failed to start ChatRelay")?);
        }

        info!("Started {} bus consumers", handles.len());
        self.subscriptions.lock().await.extend(handles);
        *self.is_running.write().await = true;
        Ok(())
    }

    async fn start_replication(&self) -> Result<Vec<SubscriptionHandle>> {
        let replication = &self.config.replication;
        info!("Starting fact replication for service {}...", replication.service_name);

        let mut users = FactConsumer::<UserEventMessage>::new(self.users.clone(), replication.user_policy)
            .with_links(self.links.clone());
        if let Some(propagator) = RemotePropagator::from_config(&replication.propagation)
            .context("Failed to create RemotePropagator")?
        {
            info!("Propagating replicated users to {}", propagator.base_url());
            users = users.with_hook(Arc::new(propagator));
        }
        let devices =
            FactConsumer::<DeviceEventMessage>::new(self.devices.clone(), replication.device_policy)
                .with_links(self.links.clone());

        let user_handle = Arc::new(users)
            .bind(self.bus.as_ref(), &user_queue(&replication.service_name))
            .await
            .context("Failed to bind user replication consumer")?;
        let device_handle = Arc::new(devices)
            .bind(self.bus.as_ref(), &device_queue(&replication.service_name))
            .await
            .context("Failed to bind device replication consumer")?;

        Ok(vec![user_handle, device_handle])
    }

    /// Bind the HTTP servers this role runs. Each server task ends on shutdown.
    pub async fn start_http_servers(&self) -> Result<(BoundAddresses, Vec<JoinHandle<()>>)> {
        let mut bound = BoundAddresses::default();
        let mut tasks = Vec::new();

        if self.role.runs_monitoring() {
            let routes = energy_monitor::rest_api::create_routes(
                self.aggregator.clone(),
                self.devices.clone(),
                self.ownership.clone(),
            );
            let addr = self.config.monitor.rest_listen_addr().context("Invalid monitor listen address")?;
            let (addr, server) = warp::serve(routes)
                .try_bind_with_graceful_shutdown(addr, self.shutdown_signal())
                .context("Failed to bind monitoring REST API")?;
            info!("Monitoring REST API listening on http://{}", addr);
            bound.monitor = Some(addr);
            tasks.push(tokio::spawn(server));
        }

        if self.role.runs_balancer() {
            let mut balancer = self.config.balancer.clone();
            // In-process replicas answer on whatever port the REST API bound
            if let Some(monitor) = bound.monitor.filter(|_| Self::hosts_every_replica(&self.config, self.role)) {
                balancer.replica_port = monitor.port();
            }
            let proxy = Arc::new(
                HttpProxy::new(
                    &balancer,
                    self.discovery.clone(),
                    self.selector.clone(),
                    self.balancer_metrics.clone(),
                )
                .context("Failed to create HttpProxy")?,
            );
            let addr = balancer.listen_addr().context("Invalid balancer listen address")?;
            let (addr, server) = warp::serve(replica_balancer::create_routes(proxy))
                .try_bind_with_graceful_shutdown(addr, self.shutdown_signal())
                .context("Failed to bind load balancer")?;
            info!("Load balancer listening on http://{}", addr);
            bound.balancer = Some(addr);
            tasks.push(tokio::spawn(server));
        }

        Ok((bound, tasks))
    }

    fn shutdown_signal(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown_tx.subscribe();
        async move {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    /// Log component counters until shutdown
    pub async fn run_metrics_reporter(&self) {
        if !self.config.metrics.enabled {
            return;
        }

        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.metrics.interval_ms));
        ticker.tick().await;
        let stop = self.shutdown_signal();
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.log_metrics(),
                _ = &mut stop => break,
            }
        }
    }

    /// Drop real-time topics nobody listens to any more, until shutdown
    pub async fn run_housekeeping(&self) {
        let interval = Duration::from_millis(self.config.service.housekeeping_interval_ms);
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        let stop = self.shutdown_signal();
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pruned = self.hub.prune();
                    if pruned > 0 {
                        debug!("Pruned {} idle real-time topics", pruned);
                    }
                }
                _ = &mut stop => break,
            }
        }
    }

    pub fn log_metrics(&self) {
        let bus = self.bus.metrics();
        info!(
            "FleetBus metrics: published={} delivered={} unroutable={} handler_failures={} consumers={}",
            bus.published_total.get(),
            bus.delivered_total.get(),
            bus.unroutable_total.get(),
            bus.handler_failures_total.get(),
            bus.active_consumers.get()
        );
        if self.role.runs_balancer() {
            info!("ReplicaBalancer metrics: {}", self.balancer_metrics.summary());
        }
        if self.role.runs_monitoring() || self.role.runs_relay() {
            info!("EnergyMonitor metrics: {}", self.monitor_metrics.summary());
        }
    }

    /// Check if the service is running
    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    /// Get service health status
    pub async fn health_check(&self) -> ServiceHealth {
        if !self.is_running().await {
            return ServiceHealth::Unhealthy;
        }

        let subscriptions = self.subscriptions.lock().await;
        if subscriptions.iter().any(|s| s.is_finished()) {
            ServiceHealth::Degraded
        } else {
            ServiceHealth::Healthy
        }
    }

    /// Stop consumers and signal servers to drain
    pub async fn shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown...");
        *self.is_running.write().await = false;

        if self.shutdown_tx.send(true).is_err() {
            warn!("No server was waiting for the shutdown signal");
        }

        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().await);
        for subscription in &subscriptions {
            info!("Stopping consumer on {}", subscription.queue());
            subscription.abort();
        }

        let uptime = Utc::now() - self.started_at;
        info!("Service stopped after {}s", uptime.num_seconds());
        self.log_metrics();
        Ok(())
    }
}

/// Service health status
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceHealth {
    Healthy,
    Unhealthy,
    Degraded,
}

impl ServiceHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ServiceHealth::Healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_bus::topology::{DEVICE_MEASUREMENT_QUEUE, WEBSOCKET_CHAT_QUEUE, WEBSOCKET_OVERCONSUMPTION_QUEUE};

    fn create_test_config() -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.balancer.listen_addr = "127.0.0.1:0".to_string();
        config.balancer.static_replicas = Some(vec!["127.0.0.1".to_string()]);
        config.monitor.rest_listen_addr = "127.0.0.1:0".to_string();
        config.metrics.enabled = false;
        config
    }

    async fn create_test_state(config: ServiceConfig, role: ServiceRole) -> (ServiceState, Arc<InMemoryBus>) {
        let bus = Arc::new(InMemoryBus::new());
        let state = ServiceState::with_bus(config, role, bus.clone()).await.unwrap();
        (state, bus)
    }

    #[test]
    fn test_role_components() {
        assert!(ServiceRole::All.runs_balancer());
        assert!(ServiceRole::All.runs_monitoring());
        assert!(ServiceRole::All.runs_relay());
        assert!(!ServiceRole::Relay.runs_monitoring());
        assert!(!ServiceRole::LoadBalancer.runs_relay());
        assert!(ServiceRole::Monitoring.runs_monitoring());
    }

    #[tokio::test]
    async fn test_split_role_rejects_in_process_bus() {
        for role in [ServiceRole::LoadBalancer, ServiceRole::Monitoring, ServiceRole::Relay] {
            let result = ServiceState::new(create_test_config(), role).await;
            let err = result.err().expect("split role on the in-process bus must fail");
            assert!(err.to_string().contains("redis"), "unexpected error: {}", err);
        }
        assert!(ServiceState::new(create_test_config(), ServiceRole::All).await.is_ok());
    }

    #[tokio::test]
    async fn test_relay_role_consumes_only_websocket_queues() {
        let (state, bus) = create_test_state(create_test_config(), ServiceRole::Relay).await;
        assert_eq!(state.health_check().await, ServiceHealth::Unhealthy);

        state.start_consumers().await.unwrap();

        assert!(bus.has_consumer(WEBSOCKET_OVERCONSUMPTION_QUEUE));
        assert!(bus.has_consumer(WEBSOCKET_CHAT_QUEUE));
        assert!(!bus.has_consumer(DEVICE_MEASUREMENT_QUEUE));
        assert!(state.health_check().await.is_healthy());

        state.shutdown().await.unwrap();
        assert!(!state.is_running().await);
    }

    #[tokio::test]
    async fn test_ingest_queues_follow_weight_table() {
        let mut config = create_test_config();
        config.balancer.weights = vec![60, 40];
        let (_state, bus) = create_test_state(config, ServiceRole::Monitoring).await;

        assert_eq!(bus.queue_depth("ingest.queue.1"), Some(0));
        assert_eq!(bus.queue_depth("ingest.queue.2"), Some(0));
        assert_eq!(bus.queue_depth("ingest.queue.3"), None);
    }

    #[tokio::test]
    async fn test_replica_beyond_weight_table_still_starts() {
        let mut config = create_test_config();
        config.monitor.replica_id = 4;
        let (state, bus) = create_test_state(config, ServiceRole::Monitoring).await;

        state.start_consumers().await.unwrap();

        assert_eq!(state.ingest_ordinals(), vec![4]);
        assert!(bus.has_consumer("ingest.queue.4"));
        assert!(!bus.has_consumer("ingest.queue.1"));
        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_single_process_consumes_every_ingest_queue() {
        let (state, bus) = create_test_state(create_test_config(), ServiceRole::All).await;

        state.start_consumers().await.unwrap();

        assert_eq!(state.discovery.discover().await.len(), 3);
        for ordinal in 1..=3 {
            assert!(bus.has_consumer(&ingest_queue(ordinal)), "ingest.queue.{} has no consumer", ordinal);
        }
        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_http_servers_stop_on_shutdown() {
        let (state, _bus) = create_test_state(create_test_config(), ServiceRole::All).await;
        let (bound, tasks) = state.start_http_servers().await.unwrap();
        assert!(bound.balancer.is_some());
        assert!(bound.monitor.is_some());

        state.shutdown().await.unwrap();
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_housekeeping_prunes_idle_topics_until_shutdown() {
        let mut config = create_test_config();
        config.service.housekeeping_interval_ms = 10;
        let (state, _bus) = create_test_state(config, ServiceRole::All).await;
        let state = Arc::new(state);

        let live = state.hub.subscribe("device.live");
        drop(state.hub.subscribe("device.gone"));
        assert_eq!(state.hub.topic_count(), 2);

        let task = {
            let state = state.clone();
            tokio::spawn(async move { state.run_housekeeping().await })
        };
        tokio::time::timeout(Duration::from_secs(3), async {
            while state.hub.topic_count() > 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        state.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(3), task).await.unwrap().unwrap();
        drop(live);
    }
}
