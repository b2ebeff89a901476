//! Passive address learning.
//!
//! Watches the source fields of ARP and IPv4 traffic and records the
//! sender's IPv4 address against its MAC, so the DNS module can answer
//! queries by guest identifier. This stage never claims a frame; the rest
//! of the chain always sees it.

use std::net::Ipv4Addr;
use std::sync::Arc;

use smoltcp::wire::{ArpPacket, ArpRepr, EthernetFrame, EthernetProtocol, Ipv4Packet};
use tracing::{debug, trace};

use crate::error::Result;
use crate::modules::ModuleStatus;
use crate::registry::ClientRegistry;

pub struct LearningModule {
    registry: Arc<ClientRegistry>,
}

impl LearningModule {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        LearningModule { registry }
    }

    pub fn handle(&self, frame: &[u8]) -> Result<ModuleStatus> {
        let Ok(eth) = EthernetFrame::new_checked(frame) else {
            return Ok(ModuleStatus::Declined);
        };
        let src_mac = eth.src_addr();

        let observed = match eth.ethertype() {
            EthernetProtocol::Arp => ArpPacket::new_checked(eth.payload())
                .ok()
                .and_then(|packet| ArpRepr::parse(&packet).ok())
                .and_then(|repr| match repr {
                    ArpRepr::EthernetIpv4 {
                        source_protocol_addr,
                        ..
                    } => Some(Ipv4Addr::from(source_protocol_addr.0)),
                    _ => None,
                }),
            EthernetProtocol::Ipv4 => Ipv4Packet::new_checked(eth.payload())
                .ok()
                .map(|packet| Ipv4Addr::from(packet.src_addr().0)),
            _ => None,
        };

        if let Some(ip) = observed {
            match self.registry.learn_ip(src_mac, ip) {
                Ok(()) => debug!(mac = %src_mac, ip = %ip, "learned guest address"),
                // Re-observations and unusable sources are routine.
                Err(e) => trace!(mac = %src_mac, ip = %ip, error = %e, "address not learned"),
            }
        }

        Ok(ModuleStatus::Declined)
    }
}
