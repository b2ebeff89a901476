//! Control-channel command envelope.
//!
//! One JSON object per request: `{"Type": "<op>", "Command": {...}}` with
//! PascalCase payload fields, matching the wire format the CLI speaks.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "Type", content = "Command", rename_all = "lowercase")]
pub enum Command {
    Create(CreateCommand),
    Connect(ConnectCommand),
    Disconnect(DisconnectCommand),
    Inspect(InspectCommand),
    Ls(LsCommand),
    Prune(PruneCommand),
    Rm(RmCommand),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCommand {
    #[serde(rename = "NetworkName")]
    pub network_name: String,
    #[serde(rename = "Subnet")]
    pub subnet: String,
    #[serde(rename = "GatewayIP")]
    pub gateway_ip: String,
    #[serde(rename = "GatewayMAC")]
    pub gateway_mac: String,
    #[serde(rename = "RangeIP")]
    pub range_ip: String,
    #[serde(rename = "DnsIP")]
    pub dns_ip: String,
    #[serde(rename = "DnsMAC")]
    pub dns_mac: String,
    #[serde(rename = "DisconnectOnPowerOff")]
    pub disconnect_on_power_off: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectCommand {
    #[serde(rename = "NetworkName")]
    pub network_name: String,
    #[serde(rename = "VmID")]
    pub vm_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectCommand {
    #[serde(rename = "NetworkName")]
    pub network_name: String,
    #[serde(rename = "VmID")]
    pub vm_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectCommand {
    #[serde(rename = "NetworkNames")]
    pub network_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LsCommand {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneCommand {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RmCommand {
    #[serde(rename = "NetworkName")]
    pub network_name: String,
}
