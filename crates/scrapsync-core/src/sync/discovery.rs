//! UDP broadcast presence announcements and the registry of same-tenant peers.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::wait_for_shutdown;
use crate::db::{LocalStore, SyncCursors};
use crate::models::{DeviceDescriptor, TenantId};

const PRESENCE_KIND: &str = "presence";
const MAX_DATAGRAM: usize = 2_048;

/// Datagram broadcast by every device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceAnnouncement {
    pub kind: String,
    pub tenant_id: TenantId,
    pub transfer_port: u16,
    pub device_name: String,
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl PresenceAnnouncement {
    pub fn new(
        tenant_id: TenantId,
        transfer_port: u16,
        device_name: impl Into<String>,
        last_sync_time: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            kind: PRESENCE_KIND.to_string(),
            tenant_id,
            transfer_port,
            device_name: device_name.into(),
            last_sync_time,
        }
    }
}

/// Live set of peers, keyed by descriptor id
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    devices: Arc<RwLock<HashMap<String, DeviceDescriptor>>>,
}

impl PeerRegistry {
    pub fn upsert(&self, device: DeviceDescriptor) {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.id.clone(), device);
    }

    pub fn clear(&self) {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Drop devices not heard from within `max_age`
    pub fn prune(&self, max_age: Duration) {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return;
        };
        let cutoff = Utc::now() - max_age;
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, device| device.last_seen >= cutoff);
    }

    /// Devices sorted by most recently seen
    pub fn snapshot(&self) -> Vec<DeviceDescriptor> {
        let mut devices: Vec<_> = self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        devices.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.id.cmp(&b.id)));
        devices
    }

    pub fn len(&self) -> usize {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Interpret one received datagram.
///
/// Returns `None` for unparseable payloads, other kinds, other tenants, and
/// this device's own announcements.
pub fn handle_datagram(
    payload: &[u8],
    sender: SocketAddr,
    tenant: TenantId,
    own_name: &str,
    own_transfer_port: u16,
) -> Option<DeviceDescriptor> {
    let announcement = match serde_json::from_slice::<PresenceAnnouncement>(payload) {
        Ok(announcement) => announcement,
        Err(error) => {
            tracing::debug!(%sender, %error, "Dropping unparseable discovery datagram");
            return None;
        }
    };

    if announcement.kind != PRESENCE_KIND || announcement.tenant_id != tenant {
        return None;
    }
    if announcement.device_name == own_name && announcement.transfer_port == own_transfer_port {
        return None;
    }

    Some(DeviceDescriptor::new(
        SocketAddr::new(sender.ip(), announcement.transfer_port),
        announcement.device_name,
        announcement.tenant_id,
        announcement.last_sync_time,
    ))
}

/// Announces this device and listens for peers on the discovery port
#[derive(Debug, Clone)]
pub struct PeerDiscovery {
    tenant: TenantId,
    device_name: String,
    port: u16,
    target: SocketAddr,
    announce_interval: Duration,
    registry: PeerRegistry,
}

impl PeerDiscovery {
    pub fn new(
        tenant: TenantId,
        device_name: impl Into<String>,
        port: u16,
        announce_interval: Duration,
    ) -> Self {
        Self {
            tenant,
            device_name: device_name.into(),
            port,
            target: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port)),
            announce_interval,
            registry: PeerRegistry::default(),
        }
    }

    /// Send announcements somewhere other than the limited broadcast address
    #[must_use]
    pub const fn with_target(mut self, target: SocketAddr) -> Self {
        self.target = target;
        self
    }

    pub fn registry(&self) -> PeerRegistry {
        self.registry.clone()
    }

    /// Bind the discovery socket with address reuse and broadcast enabled
    pub fn bind(&self) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        let address = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port));
        socket.bind(&address.into())?;
        UdpSocket::from_std(socket.into())
    }

    /// Run the announce/listen loop until `shutdown` flips to `true`.
    ///
    /// Without a transfer port the loop only listens; there is nothing for
    /// peers to connect to.
    pub fn spawn(
        &self,
        socket: UdpSocket,
        store: Arc<dyn LocalStore>,
        transfer_port: Option<u16>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let discovery = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(discovery.announce_interval);
            let mut buffer = vec![0_u8; MAX_DATAGRAM];
            tracing::info!(port = discovery.port, "Peer discovery started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(transfer_port) = transfer_port {
                            discovery.announce(&socket, store.as_ref(), transfer_port).await;
                        }
                        discovery.registry.prune(discovery.announce_interval * 3);
                    }
                    received = socket.recv_from(&mut buffer) => match received {
                        Ok((len, sender)) => {
                            if let Some(device) = handle_datagram(
                                &buffer[..len],
                                sender,
                                discovery.tenant,
                                &discovery.device_name,
                                transfer_port.unwrap_or_default(),
                            ) {
                                discovery.registry.upsert(device);
                            }
                        }
                        Err(error) => tracing::debug!(%error, "Discovery receive failed"),
                    },
                    () = wait_for_shutdown(&mut shutdown) => break,
                }
            }

            tracing::info!("Peer discovery stopped");
        })
    }

    async fn announce(&self, socket: &UdpSocket, store: &dyn LocalStore, transfer_port: u16) {
        let last_sync_time = SyncCursors::new(store, self.tenant)
            .last_sync_time()
            .unwrap_or_default();
        let announcement =
            PresenceAnnouncement::new(self.tenant, transfer_port, &self.device_name, last_sync_time);
        let payload = match serde_json::to_vec(&announcement) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "Failed to encode presence announcement");
                return;
            }
        };
        if let Err(error) = socket.send_to(&payload, self.target).await {
            tracing::debug!(%error, target = %self.target, "Presence announcement failed");
        }
    }

    /// Shortest window that always spans one peer announcement
    pub fn min_window(&self) -> Duration {
        self.announce_interval + self.announce_interval / 5
    }

    /// Clear the registry, listen for `window`, and return who answered.
    ///
    /// Peers only speak on their announce tick, so a window shorter than
    /// [`Self::min_window`] is extended to it.
    pub async fn discover_devices(&self, window: Duration) -> Vec<DeviceDescriptor> {
        let min_window = self.min_window();
        if window < min_window {
            tracing::debug!(
                ?window,
                ?min_window,
                "Extending discovery window to one announce period"
            );
        }
        self.registry.clear();
        tokio::time::sleep(window.max(min_window)).await;
        self.registry.snapshot()
    }
}
