pub mod beacon;
pub mod registry;

pub use beacon::Beacon;
pub use registry::{DeviceRegistry, Registration};

use crate::config::BeaconConfig;
use crate::core::domain::DeviceId;
use crate::core::events::{CoreEvent, EventBus};
use crate::crypto::CryptoError;
use crate::identity::Identity;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Beacon datagrams are small JSON objects; anything near this size is noise.
const MAX_DATAGRAM: usize = 2048;

/// Discovery setup errors
#[derive(Error, Debug)]
pub enum BeaconError {
    #[error("failed to bind beacon socket on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("invalid announce address {0}")]
    BadAddress(String),

    #[error("failed to encode beacon: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// What the listener did with one inbound datagram.
///
/// Exposed so tests can drive `handle_datagram` directly without sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeaconDisposition {
    /// Verified and handed to the registry
    Registered { id: DeviceId, newly_seen: bool },
    /// Our own broadcast, filtered by public key comparison
    OwnBeacon,
    /// Parsed but the signature does not match the embedded key
    BadSignature,
    /// Not a beacon at all
    Malformed,
}

/// Symmetric gossip endpoint: announces this device and listens for peers.
///
/// One UDP socket serves both loops. The beacon datagram is built and signed
/// once at construction; identity and device name never change while the
/// process runs. There is no request/response: convergence with a peer is
/// bounded by the slower of the two announce periods once both are online.
pub struct BeaconService {
    socket: UdpSocket,
    datagram: Vec<u8>,
    local_public_key: String,
    announce_target: SocketAddr,
    registry: Arc<DeviceRegistry>,
    events: Arc<EventBus>,
    config: BeaconConfig,
}

/// Handles to the two running loops; aborting them is the shutdown path.
pub struct BeaconHandle {
    announce: JoinHandle<()>,
    listen: JoinHandle<()>,
}

impl BeaconHandle {
    pub fn shutdown(&self) {
        self.announce.abort();
        self.listen.abort();
    }
}

impl Drop for BeaconHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl BeaconService {
    /// Bind the shared socket and pre-sign the announcement.
    pub async fn bind(
        identity: &Identity,
        device_name: &str,
        registry: Arc<DeviceRegistry>,
        events: Arc<EventBus>,
        config: BeaconConfig,
    ) -> Result<Self, BeaconError> {
        let bind_addr = format!("{}:{}", config.bind_address, config.port);
        let socket = UdpSocket::bind(&bind_addr)
            .await
            .map_err(|source| BeaconError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        socket
            .set_broadcast(true)
            .map_err(|source| BeaconError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        // Broadcast self-delivery still happens on most stacks; the
        // public-key filter absorbs it.
        if let Err(e) = socket.set_multicast_loop_v4(false) {
            debug!("could not disable multicast loopback: {}", e);
        }

        let beacon = Beacon::signed(identity, device_name)?;
        let datagram = serde_json::to_vec(&beacon)?;

        let announce_target: SocketAddr = format!("{}:{}", config.broadcast_address, config.port)
            .parse()
            .map_err(|_| BeaconError::BadAddress(config.broadcast_address.clone()))?;

        info!(
            "beacon socket bound on {}, announcing to {}",
            bind_addr, announce_target
        );

        Ok(Self {
            socket,
            datagram,
            local_public_key: identity.public_key_hex(),
            announce_target,
            registry,
            events,
            config,
        })
    }

    /// Port the socket actually bound (meaningful when configured as 0).
    pub fn local_port(&self) -> std::io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Redirect announcements, e.g. at a peer's loopback port in tests.
    pub fn announce_to(&mut self, target: SocketAddr) {
        self.announce_target = target;
    }

    /// Spawn the announce and listen loops. The service itself moves into the
    /// tasks; the returned handle is the only way to stop them.
    pub fn spawn(self) -> BeaconHandle {
        let service = Arc::new(self);
        let announcer = service.clone();
        let announce = tokio::spawn(async move { announcer.announce_loop().await });
        let listen = tokio::spawn(async move { service.listen_loop().await });
        BeaconHandle { announce, listen }
    }

    /// Broadcast the pre-signed datagram every announce period, piggybacking
    /// the registry's expiry sweep on the same tick. Send failures are logged
    /// and not retried; the next tick resends anyway.
    async fn announce_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.announce_period());
        loop {
            ticker.tick().await;
            if let Err(e) = self
                .socket
                .send_to(&self.datagram, self.announce_target)
                .await
            {
                warn!("beacon send to {} failed: {}", self.announce_target, e);
            }
            self.registry.purge_expired();
        }
    }

    /// Receive datagrams forever. Nothing a peer sends can end this loop.
    async fn listen_loop(&self) {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => {
                    self.handle_datagram(&buf[..len], src).await;
                }
                Err(e) => {
                    warn!("beacon recv failed: {}", e);
                }
            }
        }
    }

    /// Classify and act on one inbound datagram.
    ///
    /// Forged or corrupt beacons are dropped with a log line and never
    /// propagate. Our own broadcasts are recognized by public key, never by
    /// source address, so IP reassignment cannot confuse the filter.
    pub async fn handle_datagram(&self, buf: &[u8], src: SocketAddr) -> BeaconDisposition {
        let beacon: Beacon = match serde_json::from_slice(buf) {
            Ok(beacon) => beacon,
            Err(e) => {
                debug!("ignoring non-beacon datagram from {}: {}", src, e);
                return BeaconDisposition::Malformed;
            }
        };

        if !beacon.verify() {
            warn!(
                "dropping beacon from {} claiming '{}': bad signature",
                src, beacon.device_name
            );
            return BeaconDisposition::BadSignature;
        }

        if beacon.public_key == self.local_public_key {
            return BeaconDisposition::OwnBeacon;
        }

        let id = beacon.device_id();
        let registration =
            self.registry
                .register(id.clone(), &beacon.device_name, &beacon.os, src.ip());
        let newly_seen = registration == Registration::New;
        if newly_seen {
            if let Some(device) = self.registry.peek(&id) {
                self.events
                    .publish(CoreEvent::DeviceDiscovered { device })
                    .await;
            }
        }
        BeaconDisposition::Registered { id, newly_seen }
    }
}
