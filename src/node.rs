use crate::config::{AppConfig, ConfigError};
use crate::core::domain::{BatchOutcome, DeviceId, FileId};
use crate::core::events::{CoreEvent, EventBus, LoggingEventHandler};
use crate::crypto;
use crate::discovery::{BeaconError, BeaconHandle, BeaconService, DeviceRegistry};
use crate::identity::{Identity, IdentityError};
use crate::transfer::{IncomingBatchRequest, TransferCoordinator, TransferError, TransferListener};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

/// Startup failures. All of these are fatal: a node that cannot prove its
/// identity or bind its sockets must not come up half-alive.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Beacon(#[from] BeaconError),

    #[error("failed to set up node: {0}")]
    Io(#[from] std::io::Error),
}

/// A running lanbeam node: beacon loops, transfer endpoint, coordinator.
///
/// Every service is an explicit object built here once and shared by `Arc`;
/// there is no global state. Dropping the node aborts its background tasks.
pub struct Node {
    config: AppConfig,
    device_id: DeviceId,
    registry: Arc<DeviceRegistry>,
    events: Arc<EventBus>,
    coordinator: TransferCoordinator,
    approvals: Option<mpsc::Receiver<IncomingBatchRequest>>,
    beacon: BeaconHandle,
    listener_task: JoinHandle<()>,
    beacon_port: u16,
    transfer_port: u16,
}

impl Node {
    /// Validate the config, load or create the identity, bind both sockets,
    /// and spawn the background loops.
    pub async fn start(config: AppConfig) -> Result<Self, NodeError> {
        Self::start_with_announce(config, None).await
    }

    /// Like `start`, but with the announce target overridden. Loopback
    /// tests point two nodes at each other's beacon ports this way.
    pub async fn start_with_announce(
        config: AppConfig,
        announce_target: Option<SocketAddr>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        config.ensure_directories()?;

        let identity = Identity::load_or_generate(&config.identity_path())?;
        let device_id = DeviceId::new(crypto::device_id_digest(
            &identity.public_key_hex(),
            &config.device_name,
        ));

        let registry = Arc::new(DeviceRegistry::new(config.beacon.device_ttl()));
        let events = Arc::new(EventBus::new());
        events.register_handler(Arc::new(LoggingEventHandler)).await;

        let mut beacon_service = BeaconService::bind(
            &identity,
            &config.device_name,
            registry.clone(),
            events.clone(),
            config.beacon.clone(),
        )
        .await?;
        if let Some(target) = announce_target {
            beacon_service.announce_to(target);
        }
        let beacon_port = beacon_service.local_port()?;

        let (listener, approvals) = TransferListener::bind(
            &config.transfer,
            registry.clone(),
            events.clone(),
            config.download_dir_path(),
        )
        .await?;
        let transfer_port = listener.local_port()?;

        let coordinator =
            TransferCoordinator::new(registry.clone(), events.clone(), config.transfer.clone());

        let beacon = beacon_service.spawn();
        let listener_task = listener.spawn();

        info!(
            "node '{}' up (id {}, beacon :{}, transfer :{})",
            config.device_name, device_id, beacon_port, transfer_port
        );

        Ok(Self {
            config,
            device_id,
            registry,
            events,
            coordinator,
            approvals: Some(approvals),
            beacon,
            listener_task,
            beacon_port,
            transfer_port,
        })
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn device_name(&self) -> &str {
        &self.config.device_name
    }

    pub fn download_dir(&self) -> PathBuf {
        self.config.download_dir_path()
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Channel of every core event published after this call.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CoreEvent> {
        self.events.subscribe()
    }

    /// The incoming-transfer approval channel. There is exactly one; the
    /// second call returns `None`.
    pub fn take_approvals(&mut self) -> Option<mpsc::Receiver<IncomingBatchRequest>> {
        self.approvals.take()
    }

    /// Send files to a discovered device. See `TransferCoordinator::send_batch`.
    pub async fn send_batch(
        &self,
        target: &DeviceId,
        paths: &[PathBuf],
    ) -> Result<BatchOutcome, TransferError> {
        self.coordinator.send_batch(target, paths).await
    }

    /// Abort an in-flight outbound file.
    pub fn cancel_file(&self, file_id: &FileId) -> bool {
        self.coordinator.cancel_file(file_id)
    }

    pub fn local_beacon_port(&self) -> u16 {
        self.beacon_port
    }

    pub fn local_transfer_port(&self) -> u16 {
        self.transfer_port
    }

    /// Stop the background loops. In-flight sessions on other tasks finish
    /// or fail on their own; no new connections are accepted.
    pub fn shutdown(&self) {
        self.beacon.shutdown();
        self.listener_task.abort();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}
