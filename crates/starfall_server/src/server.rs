//! Core game server implementation.
//!
//! [`GameServer`] wires the durable store, authenticator, shared state fabric
//! and cluster services together, then runs the accept loop, the world loop
//! and the periodic tasks until shutdown.

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::runtime::{spawn_periodic_tasks, spawn_world, RuntimeServices, WorldHandle};
use crate::transport::handle_connection;
use starfall_cluster::{ClusterCoordinator, Fabric, PlayerDirectory};
use starfall_core::{
    Authenticator, DevTokenAuthenticator, DurableStore, JsonFileStore, MemoryStore, ShutdownState,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// The game server: one instance of the cluster.
pub struct GameServer {
    config: ServerConfig,
    services: RuntimeServices,
}

impl GameServer {
    /// Builds every service from `config`.
    ///
    /// Uses the JSON file store when a data directory is configured and
    /// Redis for the fabric when a URL is configured; otherwise both are
    /// in-process.
    pub async fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn DurableStore> = match &config.persistence.data_dir {
            Some(dir) => {
                info!("💾 Using file store at {}", dir.display());
                Arc::new(JsonFileStore::open(dir).await?)
            }
            None => {
                info!("💾 Using in-memory store (state is lost on exit)");
                Arc::new(MemoryStore::new())
            }
        };

        let fabric = match &config.cluster.redis_url {
            Some(url) => Fabric::connect_redis(url, config.cluster.fabric.clone()).await?,
            None => {
                info!("🏠 No Redis configured, running as a single instance");
                Fabric::local(config.cluster.fabric.clone())
            }
        };

        Ok(Self::with_services(
            config.clone(),
            build_services(&config, store, Arc::new(DevTokenAuthenticator::new()), fabric),
        ))
    }

    pub fn with_services(config: ServerConfig, services: RuntimeServices) -> Self {
        Self { config, services }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn services(&self) -> &RuntimeServices {
        &self.services
    }

    /// Binds the configured address and serves until `shutdown_state` is
    /// initiated.
    pub async fn start_with_shutdown_state(&self, shutdown_state: ShutdownState) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_address)
            .await
            .map_err(|e| ServerError::Network(format!("Failed to bind {}: {e}", self.config.bind_address)))?;
        self.serve(listener, shutdown_state).await
    }

    /// Serves on an already bound listener.
    pub async fn serve(&self, listener: TcpListener, shutdown_state: ShutdownState) -> Result<(), ServerError> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Network(e.to_string()))?;
        info!("🚀 Starting game server on {}", local_addr);
        info!("🌍 Instance ID: {}", self.config.instance_id());

        let (world, world_task) = spawn_world(&self.config, self.services.clone());
        let listener_task = self.services.coordinator.start(shutdown_state.clone()).await;
        let coordinator_config = self.services.coordinator.config();
        let periodic = spawn_periodic_tasks(
            &world,
            &self.config.tasks,
            coordinator_config.heartbeat_interval,
            coordinator_config.election_interval,
            &shutdown_state,
        );
        info!("🕒 Started {} periodic tasks", periodic.len());

        accept_loop(&listener, &world, &shutdown_state).await;

        info!("🧹 Performing server cleanup...");
        drop(listener);
        for task in periodic {
            if let Err(e) = task.await {
                warn!("⚠️ Periodic task ended abnormally: {}", e);
            }
        }
        match world.shutdown().await {
            Ok(report) if !report.is_clean() => {
                warn!("⚠️ {} store errors during final flush", report.errors.len());
            }
            Ok(_) => {}
            Err(e) => error!("❌ World loop did not flush: {}", e),
        }
        if let Err(e) = world_task.await {
            error!("❌ World loop panicked: {}", e);
        }
        self.services.coordinator.deregister().await;
        let _ = listener_task.await;

        shutdown_state.complete_shutdown();
        info!("✅ Server stopped");
        Ok(())
    }
}

/// Builds the runtime services around an existing store, authenticator and
/// fabric.
pub fn build_services(
    config: &ServerConfig,
    store: Arc<dyn DurableStore>,
    authenticator: Arc<dyn Authenticator>,
    fabric: Fabric,
) -> RuntimeServices {
    let coordinator_config = config.cluster.coordinator.clone();
    let directory = PlayerDirectory::new(
        fabric.clone(),
        coordinator_config.instance_id.clone(),
        coordinator_config.address.clone(),
        coordinator_config.record_ttl,
    );
    RuntimeServices {
        store,
        authenticator,
        coordinator: Arc::new(ClusterCoordinator::new(fabric, coordinator_config)),
        directory,
    }
}

async fn accept_loop(listener: &TcpListener, world: &WorldHandle, shutdown: &ShutdownState) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => spawn_connection(stream, addr, world, shutdown),
                Err(e) => error!("Failed to accept connection: {}", e),
            },
            _ = shutdown.wait() => {
                info!("🛑 Accept loop stopping - shutdown initiated");
                break;
            }
        }
    }
}

fn spawn_connection(stream: tokio::net::TcpStream, addr: SocketAddr, world: &WorldHandle, shutdown: &ShutdownState) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
    }
    let world = world.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, addr, world, shutdown).await {
            debug!("Connection error from {}: {}", addr, e);
        }
    });
}
