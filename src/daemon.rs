//! TCP control channel.
//!
//! Each connection carries exactly one JSON command envelope and gets one
//! plain-text response back. Handler failures are serialized in-band as
//! `Error: ...` text; a per-request failure never takes the daemon down.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::command::Command;
use crate::error::Result;
use crate::manager::NetworkManager;

/// Control-channel read cap; commands are single small JSON envelopes.
const READ_LIMIT: usize = 2048;

/// Bind the control channel and serve forever.
pub async fn run(host: &str, port: u16) -> Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    info!(host, port, "control channel listening");
    serve(listener).await
}

/// Accept loop over an already-bound listener.
pub async fn serve(listener: TcpListener) -> Result<()> {
    let manager = Arc::new(NetworkManager::new());
    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = handle(conn, manager).await {
                warn!(peer = %peer, error = %e, "control request failed");
            }
        });
    }
}

async fn handle(mut conn: TcpStream, manager: Arc<NetworkManager>) -> Result<()> {
    let mut buf = vec![0u8; READ_LIMIT];
    let len = conn.read(&mut buf).await?;

    let response = match serde_json::from_slice::<Command>(&buf[..len]) {
        Ok(command) => match dispatch(&manager, command).await {
            Ok(text) => text,
            Err(e) => format!("Error: {e}"),
        },
        Err(e) => {
            warn!(error = %e, "malformed control command");
            format!("Error: malformed command: {e}")
        }
    };

    conn.write_all(response.as_bytes()).await?;
    Ok(())
}

async fn dispatch(manager: &NetworkManager, command: Command) -> Result<String> {
    match command {
        Command::Create(cmd) => {
            info!(network = %cmd.network_name, "received: create");
            manager.create(cmd).await
        }
        Command::Connect(cmd) => {
            info!(network = %cmd.network_name, vm = %cmd.vm_id, "received: connect");
            manager.connect(cmd).await
        }
        Command::Disconnect(cmd) => {
            info!(network = %cmd.network_name, vm = %cmd.vm_id, "received: disconnect");
            manager.disconnect(cmd).await
        }
        Command::Inspect(cmd) => {
            info!(networks = ?cmd.network_names, "received: inspect");
            manager.inspect(cmd).await
        }
        Command::Ls(_) => {
            info!("received: ls");
            manager.ls().await
        }
        Command::Prune(_) => {
            info!("received: prune");
            manager.prune().await
        }
        Command::Rm(cmd) => {
            info!(network = %cmd.network_name, "received: rm");
            manager.rm(cmd).await
        }
    }
}
