//! Per-network guest registry.
//!
//! The registry is the shared state every listener task and every module
//! reads: an insertion-ordered set of attached guests with secondary indexes
//! by guest id, MAC address and LOCAL socket path.

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use smoltcp::wire::EthernetAddress;
use tokio::net::UnixDatagram;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::addr;
use crate::error::{Error, Result};

/// Product tag used in guest socket paths.
const SOCKET_PREFIX: &str = "unetd";

/// One guest attached to a network.
///
/// The fabric listens on the REMOTE path (the guest writes there) and
/// delivers frames by dialing the LOCAL path (the guest reads there).
pub struct Client {
    pub id: String,
    pub mac: EthernetAddress,
    /// Socket token; also names the guest's socket pair.
    pub token: Uuid,
    pub remote_path: PathBuf,
    pub local_path: PathBuf,
    ip: RwLock<Option<Ipv4Addr>>,
    /// Egress handle to the LOCAL path, dialed on first send.
    egress: tokio::sync::Mutex<Option<UnixDatagram>>,
    /// One-shot stop signal for the listener task. Taken exactly once.
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl Client {
    pub fn new(id: &str, mac: EthernetAddress, stop: oneshot::Sender<()>) -> Self {
        let token = Uuid::new_v4();
        let tmp = std::env::temp_dir();
        Client {
            id: id.to_string(),
            mac,
            token,
            remote_path: tmp.join(format!("{SOCKET_PREFIX}_{token}.remote")),
            local_path: tmp.join(format!("{SOCKET_PREFIX}_{token}.local")),
            ip: RwLock::new(None),
            egress: tokio::sync::Mutex::new(None),
            stop: Mutex::new(Some(stop)),
        }
    }

    /// The guest's learned IPv4 address, if any.
    pub fn ip(&self) -> Option<Ipv4Addr> {
        *self.ip.read().unwrap()
    }

    /// Bind an address to this guest, replacing any previous one.
    pub fn set_ip(&self, ip: Ipv4Addr) {
        *self.ip.write().unwrap() = Some(ip);
    }

    /// Record an observed address, but only if none is known yet.
    pub fn learn_ip(&self, ip: Ipv4Addr) -> Result<()> {
        let mut guard = self.ip.write().unwrap();
        if guard.is_some() {
            return Err(Error::AlreadyLearned);
        }
        *guard = Some(ip);
        Ok(())
    }

    /// Send a frame to the guest's LOCAL socket, dialing and caching the
    /// egress handle on first use.
    pub async fn send_local(&self, data: &[u8]) -> io::Result<()> {
        let mut guard = self.egress.lock().await;
        let sock = match guard.as_mut() {
            Some(sock) => sock,
            None => {
                let sock = UnixDatagram::unbound()?;
                sock.connect(&self.local_path)?;
                debug!(id = %self.id, "opened egress socket");
                guard.insert(sock)
            }
        };
        let sent = sock.send(data).await?;
        if sent != data.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "datagram not sent completely",
            ));
        }
        Ok(())
    }

    /// Drop the cached egress handle, closing the socket.
    pub async fn close_egress(&self) {
        self.egress.lock().await.take();
    }

    /// Signal the listener task to stop. Double-stop is an error.
    pub fn stop(&self) -> Result<()> {
        let sender = self
            .stop
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::AlreadyStopped)?;
        let _ = sender.send(());
        Ok(())
    }

    /// The netdev arguments the emulator needs to join the network with
    /// this guest's socket pair and MAC.
    pub fn qemu_args(&self) -> String {
        format!(
            "-netdev dgram,id={token},remote.type=unix,remote.path={remote},\
local.type=unix,local.path={local} -device virtio-net,netdev={token},mac={mac}",
            token = self.token,
            remote = self.remote_path.display(),
            local = self.local_path.display(),
            mac = addr::format_mac(self.mac),
        )
    }
}

#[derive(Default)]
struct Inner {
    /// Attached guests in attach order. Broadcast walks this.
    order: Vec<Arc<Client>>,
    by_id: HashMap<String, Arc<Client>>,
    by_mac: HashMap<EthernetAddress, Arc<Client>>,
    by_local: HashMap<PathBuf, Arc<Client>>,
}

/// Indexed set of attached guests, shared between the fabric and its
/// modules. Mutations are serialized by the inner lock; readers get
/// snapshots or cloned handles.
#[derive(Default)]
pub struct ClientRegistry {
    inner: RwLock<Inner>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a guest. Fails with `Conflict` when the id, MAC or socket token
    /// is already present.
    pub fn insert(&self, client: Arc<Client>) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.by_id.contains_key(&client.id) {
            return Err(Error::Conflict(format!("guest id {}", client.id)));
        }
        if inner.by_mac.contains_key(&client.mac) {
            return Err(Error::Conflict(format!("MAC {}", addr::format_mac(client.mac))));
        }
        if inner.by_local.contains_key(&client.local_path) {
            return Err(Error::Conflict(format!("socket token {}", client.token)));
        }
        inner.by_id.insert(client.id.clone(), client.clone());
        inner.by_mac.insert(client.mac, client.clone());
        inner
            .by_local
            .insert(client.local_path.clone(), client.clone());
        inner.order.push(client);
        Ok(())
    }

    pub fn by_id(&self, id: &str) -> Result<Arc<Client>> {
        self.inner
            .read()
            .unwrap()
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("guest {id}")))
    }

    pub fn by_mac(&self, mac: EthernetAddress) -> Result<Arc<Client>> {
        self.inner
            .read()
            .unwrap()
            .by_mac
            .get(&mac)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("guest with MAC {}", addr::format_mac(mac))))
    }

    pub fn by_local_socket(&self, path: &Path) -> Result<Arc<Client>> {
        self.inner
            .read()
            .unwrap()
            .by_local
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("guest with socket {}", path.display())))
    }

    /// Evict a guest from every index.
    pub fn remove(&self, client: &Client) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.by_id.remove(&client.id).is_none() {
            return Err(Error::NotFound(format!("guest {}", client.id)));
        }
        inner.by_mac.remove(&client.mac);
        inner.by_local.remove(&client.local_path);
        inner.order.retain(|c| c.id != client.id);
        Ok(())
    }

    /// Snapshot of the attached guests in attach order.
    pub fn vms(&self) -> Vec<Arc<Client>> {
        self.inner.read().unwrap().order.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record an observed source address for the guest with the given MAC.
    /// Fails when the address is unusable, the guest is unknown, or an
    /// address was already learned; callers that observe traffic passively
    /// swallow all three.
    pub fn learn_ip(&self, mac: EthernetAddress, ip: Ipv4Addr) -> Result<()> {
        let client = self.by_mac(mac)?;
        if !addr::is_usable_ip(ip) {
            return Err(Error::BadIp(ip));
        }
        client.learn_ip(ip)
    }
}
