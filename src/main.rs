use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use unetd::command::{
    Command, ConnectCommand, CreateCommand, DisconnectCommand, InspectCommand, LsCommand,
    PruneCommand, RmCommand,
};
use unetd::{client, daemon};

#[derive(Parser)]
#[command(name = "unetd")]
#[command(about = "User-space virtual network fabric for QEMU guests")]
struct Cli {
    /// Daemon host interface
    #[arg(long, global = true, default_value = "0.0.0.0")]
    host: String,

    /// Daemon control port
    #[arg(short, long, global = true, default_value_t = 9000)]
    port: u16,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Start the daemon
    Daemon,

    /// Create a network
    Create {
        /// Subnet in CIDR form that represents the network segment
        #[arg(long, default_value = "10.10.10.0/24")]
        subnet: String,

        /// IP address of the gateway for the segment
        #[arg(long, default_value = "10.10.10.1")]
        gateway: String,

        /// MAC address of the gateway device
        #[arg(long, default_value = "52:54:00:12:34:ff")]
        gateway_mac: String,

        /// Pool of addresses available for DHCP assignment, as
        /// start-end within the subnet
        #[arg(long, default_value = "10.10.10.100-200")]
        range: String,

        /// IP address of the DNS service on the segment
        #[arg(long, default_value = "10.10.10.2")]
        dns: String,

        /// MAC address of the DNS service
        #[arg(long, default_value = "52:54:00:12:34:fe")]
        dns_mac: String,

        /// Detach a guest on the first failed write to its socket
        #[arg(long)]
        disconnect_on_poweroff: bool,

        /// Network name
        network: String,
    },

    /// Connect a vm to a network
    Connect { network: String, vm_id: String },

    /// Disconnect a vm from a network
    Disconnect { network: String, vm_id: String },

    /// Display detailed information on one or more networks
    Inspect {
        #[arg(required = true)]
        networks: Vec<String>,
    },

    /// List networks
    Ls,

    /// Remove all unused networks
    Prune,

    /// Remove a network
    Rm { network: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Use RUST_LOG if set, otherwise default to info for unetd
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("unetd=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    match cli.command {
        Cmd::Daemon => daemon::run(&cli.host, cli.port).await?,
        Cmd::Create {
            subnet,
            gateway,
            gateway_mac,
            range,
            dns,
            dns_mac,
            disconnect_on_poweroff,
            network,
        } => {
            client::run(
                &cli.host,
                cli.port,
                Command::Create(CreateCommand {
                    network_name: network,
                    subnet,
                    gateway_ip: gateway,
                    gateway_mac,
                    range_ip: range,
                    dns_ip: dns,
                    dns_mac,
                    disconnect_on_power_off: disconnect_on_poweroff,
                }),
            )
            .await?
        }
        Cmd::Connect { network, vm_id } => {
            client::run(
                &cli.host,
                cli.port,
                Command::Connect(ConnectCommand {
                    network_name: network,
                    vm_id,
                }),
            )
            .await?
        }
        Cmd::Disconnect { network, vm_id } => {
            client::run(
                &cli.host,
                cli.port,
                Command::Disconnect(DisconnectCommand {
                    network_name: network,
                    vm_id,
                }),
            )
            .await?
        }
        Cmd::Inspect { networks } => {
            client::run(
                &cli.host,
                cli.port,
                Command::Inspect(InspectCommand {
                    network_names: networks,
                }),
            )
            .await?
        }
        Cmd::Ls => client::run(&cli.host, cli.port, Command::Ls(LsCommand {})).await?,
        Cmd::Prune => client::run(&cli.host, cli.port, Command::Prune(PruneCommand {})).await?,
        Cmd::Rm { network } => {
            client::run(
                &cli.host,
                cli.port,
                Command::Rm(RmCommand {
                    network_name: network,
                }),
            )
            .await?
        }
    }

    Ok(())
}
