//! Network collection and control-plane command handlers.
//!
//! The manager owns every network in the daemon and turns control commands
//! into fabric operations, rendering the plain-text responses the CLI
//! prints.

use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use tokio::sync::Mutex;
use tracing::info;

use crate::addr;
use crate::command::{
    ConnectCommand, CreateCommand, DisconnectCommand, InspectCommand, RmCommand,
};
use crate::error::{Error, Result};
use crate::modules::{DhcpModule, DnsModule, LearningModule, NetworkModule, SwitchModule};
use crate::network::{DEFAULT_FRAME_LIMIT, Network};
use crate::registry::ClientRegistry;

#[derive(Default)]
pub struct NetworkManager {
    /// Managed networks in creation order.
    networks: Mutex<Vec<Arc<Network>>>,
}

impl NetworkManager {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get_network(&self, name: &str) -> Result<Arc<Network>> {
        self.networks
            .lock()
            .await
            .iter()
            .find(|n| n.name() == name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("network {name}")))
    }

    /// Create a network with the fixed learning → DHCP → DNS → switch
    /// chain.
    pub async fn create(&self, cmd: CreateCommand) -> Result<String> {
        let mut networks = self.networks.lock().await;
        if networks.iter().any(|n| n.name() == cmd.network_name) {
            return Err(Error::Conflict(format!("network name {}", cmd.network_name)));
        }

        let subnet: Ipv4Net = cmd
            .subnet
            .parse()
            .map_err(|_| Error::BadInput(format!("invalid subnet: {}", cmd.subnet)))?;
        let gateway_ip: Ipv4Addr = cmd
            .gateway_ip
            .parse()
            .map_err(|_| Error::BadInput(format!("invalid gateway IP: {}", cmd.gateway_ip)))?;
        let gateway_mac = addr::parse_mac(&cmd.gateway_mac)?;
        let range = addr::expand_range(&cmd.range_ip)?;
        let dns_ip: Ipv4Addr = cmd
            .dns_ip
            .parse()
            .map_err(|_| Error::BadInput(format!("invalid DNS IP: {}", cmd.dns_ip)))?;
        let dns_mac = addr::parse_mac(&cmd.dns_mac)?;

        let registry = Arc::new(ClientRegistry::new());
        let modules = vec![
            NetworkModule::Learning(LearningModule::new(registry.clone())),
            NetworkModule::Dhcp(DhcpModule::new(
                subnet,
                gateway_ip,
                gateway_mac,
                range,
                dns_ip,
                registry.clone(),
            )),
            NetworkModule::Dns(DnsModule::new(dns_ip, dns_mac, registry.clone())),
            NetworkModule::Switch(SwitchModule::new(registry.clone())),
        ];

        networks.push(Arc::new(Network::new(
            &cmd.network_name,
            DEFAULT_FRAME_LIMIT,
            registry,
            modules,
            cmd.disconnect_on_power_off,
        )));
        info!(network = %cmd.network_name, subnet = %subnet, "network created");
        Ok(cmd.network_name)
    }

    /// Attach a guest and respond with the emulator's netdev arguments.
    pub async fn connect(&self, cmd: ConnectCommand) -> Result<String> {
        let network = self.get_network(&cmd.network_name).await?;
        let client = network.attach(&cmd.vm_id)?;
        Ok(client.qemu_args())
    }

    pub async fn disconnect(&self, cmd: DisconnectCommand) -> Result<String> {
        let network = self.get_network(&cmd.network_name).await?;
        network.detach(&cmd.vm_id).await?;
        Ok(cmd.vm_id)
    }

    /// Tab-separated table of attached guests for the selected networks.
    /// Unknown names are skipped, matching the control surface's lenient
    /// history.
    pub async fn inspect(&self, cmd: InspectCommand) -> Result<String> {
        let networks = self.networks.lock().await;
        let mut rows = vec!["ID\tMac Address\t\tIp\t\tSocket".to_string()];
        for name in &cmd.network_names {
            let Some(network) = networks.iter().find(|n| n.name() == name) else {
                continue;
            };
            rows.push(format!("-{name}{}", "-".repeat(90)));
            for client in network.registry().vms() {
                let ip = client
                    .ip()
                    .map_or_else(|| "None".to_string(), |ip| ip.to_string());
                rows.push(format!(
                    "{}\t{}\t{}\t{}",
                    client.id,
                    addr::format_mac(client.mac),
                    ip,
                    client.token
                ));
            }
        }
        Ok(rows.join("\n"))
    }

    pub async fn ls(&self) -> Result<String> {
        let networks = self.networks.lock().await;
        let mut rows = vec!["NAME".to_string(), "----".to_string()];
        rows.extend(networks.iter().map(|n| n.name().to_string()));
        Ok(rows.join("\n"))
    }

    pub async fn prune(&self) -> Result<String> {
        Ok("Not implemented".to_string())
    }

    /// Tear a network down and remove it. The network stays registered if
    /// teardown reports failures.
    pub async fn rm(&self, cmd: RmCommand) -> Result<String> {
        let network = self.get_network(&cmd.network_name).await?;
        network.teardown().await?;
        self.networks
            .lock()
            .await
            .retain(|n| n.name() != cmd.network_name);
        info!(network = %cmd.network_name, "network removed");
        Ok(cmd.network_name)
    }
}
