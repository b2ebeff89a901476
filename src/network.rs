//! The network fabric.
//!
//! One `Network` is one named L2 segment: a registry of attached guests, a
//! fixed module chain, and one listener task per guest reading frames off
//! the guest's REMOTE datagram socket. Frames from one guest are processed
//! in arrival order by its listener; ordering across guests is undefined.

use std::sync::Arc;

use tokio::net::UnixDatagram;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::addr;
use crate::error::{Error, Result};
use crate::modules::{ModuleStatus, NetworkModule, Verdict};
use crate::registry::{Client, ClientRegistry};

/// Default datagram cap: an Ethernet frame with a 1500-byte payload.
pub const DEFAULT_FRAME_LIMIT: usize = 1514;

pub struct Network {
    core: Arc<NetworkCore>,
}

/// Shared fabric state; every listener task holds a handle.
struct NetworkCore {
    name: String,
    frame_limit: usize,
    registry: Arc<ClientRegistry>,
    modules: Vec<NetworkModule>,
    disconnect_on_write_failure: bool,
}

impl Network {
    pub fn new(
        name: &str,
        frame_limit: usize,
        registry: Arc<ClientRegistry>,
        modules: Vec<NetworkModule>,
        disconnect_on_write_failure: bool,
    ) -> Self {
        Network {
            core: Arc::new(NetworkCore {
                name: name.to_string(),
                frame_limit,
                registry,
                modules,
                disconnect_on_write_failure,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.core.registry
    }

    /// Attach a guest: allocate its socket token and MAC, register it and
    /// start its listener. The returned client carries everything the
    /// emulator needs to join the segment.
    pub fn attach(&self, id: &str) -> Result<Arc<Client>> {
        if self.core.registry.by_id(id).is_ok() {
            return Err(Error::Conflict(format!("guest id {id}")));
        }

        let mac = loop {
            let mac = addr::new_mac();
            if self.core.registry.by_mac(mac).is_err() {
                break mac;
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let client = Arc::new(Client::new(id, mac, stop_tx));
        self.core.registry.insert(client.clone())?;

        let core = Arc::clone(&self.core);
        let listener_client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = core.listen(listener_client, stop_rx).await {
                warn!(network = %core.name, error = %e, "listener failed");
            }
        });

        info!(network = %self.core.name, id, mac = %mac, "guest attached");
        Ok(client)
    }

    /// Detach a guest: stop its listener, let every module reclaim its
    /// per-guest state, drop the egress handle and evict it.
    pub async fn detach(&self, id: &str) -> Result<()> {
        self.core.detach(id).await
    }

    /// Detach every guest. Per-guest failures are collected into a single
    /// report; teardown never stops halfway.
    pub async fn teardown(&self) -> Result<()> {
        let mut failures = Vec::new();
        for client in self.core.registry.vms() {
            if let Err(e) = self.core.detach(&client.id).await {
                failures.push(format!("{}: {e}", client.id));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(failures.join(", ")))
        }
    }
}

impl NetworkCore {
    async fn detach(&self, id: &str) -> Result<()> {
        let client = self.registry.by_id(id)?;
        client.stop()?;
        for module in &self.modules {
            module.on_detach(&client);
        }
        client.close_egress().await;
        self.registry.remove(&client)?;
        info!(network = %self.name, id, "guest detached");
        Ok(())
    }

    /// Per-guest read loop on the REMOTE socket. The socket is closed and
    /// the REMOTE path unlinked on every exit path.
    async fn listen(&self, client: Arc<Client>, mut stop: oneshot::Receiver<()>) -> Result<()> {
        info!(network = %self.name, id = %client.id, "listener started");

        if client.remote_path.exists() {
            let _ = std::fs::remove_file(&client.remote_path);
        }
        let socket = match UnixDatagram::bind(&client.remote_path) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(
                    network = %self.name,
                    id = %client.id,
                    error = %e,
                    "failed to bind guest socket"
                );
                return Err(e.into());
            }
        };

        let mut buf = vec![0u8; self.frame_limit];
        loop {
            tokio::select! {
                _ = &mut stop => break,
                received = socket.recv(&mut buf) => {
                    let len = match received {
                        Ok(len) => len,
                        Err(e) => {
                            warn!(
                                network = %self.name,
                                id = %client.id,
                                error = %e,
                                "read error on guest socket"
                            );
                            continue;
                        }
                    };
                    self.process_frame(&client, &buf[..len]).await;
                }
            }
        }

        drop(socket);
        let _ = std::fs::remove_file(&client.remote_path);
        info!(network = %self.name, id = %client.id, "listener stopped");
        Ok(())
    }

    /// Walk the module chain for one frame and deliver per the verdict of
    /// the first stage that claims it.
    async fn process_frame(&self, sender: &Arc<Client>, frame: &[u8]) {
        let mut claimed = None;
        for module in &self.modules {
            match module.handle(frame) {
                Ok(ModuleStatus::Claimed(dispatch)) => {
                    claimed = Some(dispatch);
                    break;
                }
                Ok(ModuleStatus::Declined) => continue,
                Err(e) => {
                    // Expected for truncated frames, unsupported DHCP
                    // messages and unanswerable DNS queries.
                    debug!(
                        network = %self.name,
                        id = %sender.id,
                        error = %e,
                        "frame dropped"
                    );
                    return;
                }
            }
        }
        let Some(dispatch) = claimed else {
            return;
        };

        match dispatch.verdict {
            Verdict::None => {}
            Verdict::Sender => self.send_to(sender, &dispatch.payload).await,
            Verdict::Explicit(target) => self.send_to(&target, &dispatch.payload).await,
            Verdict::Broadcast => {
                for target in self.registry.vms() {
                    self.send_to(&target, &dispatch.payload).await;
                }
            }
            Verdict::Others => {
                for target in self.registry.vms() {
                    if target.id != sender.id {
                        self.send_to(&target, &dispatch.payload).await;
                    }
                }
            }
        }
    }

    /// Deliver bytes to one guest's LOCAL socket. A failed write detaches
    /// the guest when the network's policy says an unwritable peer has
    /// departed; the frame is lost either way.
    async fn send_to(&self, client: &Arc<Client>, data: &[u8]) {
        let Err(e) = client.send_local(data).await else {
            return;
        };
        if self.disconnect_on_write_failure {
            warn!(
                network = %self.name,
                id = %client.id,
                error = %e,
                "write failed, disconnecting guest"
            );
            if let Err(e) = self.detach(&client.id).await {
                warn!(
                    network = %self.name,
                    id = %client.id,
                    error = %e,
                    "disconnect after write failure failed"
                );
            }
        } else {
            warn!(
                network = %self.name,
                id = %client.id,
                error = %e,
                "write error on guest socket"
            );
        }
    }
}
