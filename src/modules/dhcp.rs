//! DHCPv4 server module.
//!
//! Leases addresses from a configured pool and answers DISCOVER and REQUEST
//! messages with OFFER and ACK. Leases have no expiry; an address stays
//! bound to its MAC until the guest detaches.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode, OptionCode};
use dhcproto::{Decodable, Decoder};
use ipnet::Ipv4Net;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, IpProtocol, Ipv4Address,
    Ipv4Packet, Ipv4Repr, UdpPacket, UdpRepr,
};
use tracing::debug;

use crate::error::{Error, Result};
use crate::modules::{Dispatch, ModuleStatus, Verdict};
use crate::registry::ClientRegistry;

const ETHERNET_HEADER_SIZE: usize = 14;
const IPV4_HEADER_SIZE: usize = 20;
const UDP_HEADER_SIZE: usize = 8;

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

/// Lease time handed to guests, in seconds (0x0098967f).
const LEASE_TIME_SECS: u32 = 9_999_999;

/// BOOTP fixed header length, up to and excluding the magic cookie.
const BOOTP_HEADER_SIZE: usize = 236;
const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

const BOOTREPLY: u8 = 2;

/// Message type option values of the replies this server sends.
const DHCP_OFFER: u8 = 2;
const DHCP_ACK: u8 = 5;

const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_END: u8 = 255;

/// One address bound to one guest MAC.
struct Lease {
    ip: Ipv4Addr,
    mac: EthernetAddress,
}

/// FREE/LEASED address pool. The union of the two sides is always the
/// configured range and their intersection is empty.
struct LeasePool {
    free: VecDeque<Ipv4Addr>,
    leased: Vec<Lease>,
}

impl LeasePool {
    fn new(range: Vec<Ipv4Addr>) -> Self {
        LeasePool {
            free: range.into(),
            leased: Vec::new(),
        }
    }

    /// Bind an address to a MAC. A MAC holds at most one lease; claiming
    /// again re-offers the bound address.
    fn lease(&mut self, mac: EthernetAddress) -> Result<Ipv4Addr> {
        if let Some(lease) = self.leased.iter().find(|l| l.mac == mac) {
            return Ok(lease.ip);
        }
        let ip = self.free.pop_front().ok_or(Error::PoolExhausted)?;
        self.leased.push(Lease { ip, mac });
        Ok(ip)
    }

    /// Return a MAC's lease to the free side.
    fn release(&mut self, mac: EthernetAddress) {
        while let Some(pos) = self.leased.iter().position(|l| l.mac == mac) {
            let lease = self.leased.remove(pos);
            self.free.push_back(lease.ip);
        }
    }
}

pub struct DhcpModule {
    gateway_ip: Ipv4Addr,
    gateway_mac: EthernetAddress,
    subnet_mask: Ipv4Addr,
    dns_ip: Ipv4Addr,
    pool: Mutex<LeasePool>,
    registry: Arc<ClientRegistry>,
}

impl DhcpModule {
    pub fn new(
        subnet: Ipv4Net,
        gateway_ip: Ipv4Addr,
        gateway_mac: EthernetAddress,
        range: Vec<Ipv4Addr>,
        dns_ip: Ipv4Addr,
        registry: Arc<ClientRegistry>,
    ) -> Self {
        DhcpModule {
            gateway_ip,
            gateway_mac,
            subnet_mask: subnet.netmask(),
            dns_ip,
            pool: Mutex::new(LeasePool::new(range)),
            registry,
        }
    }

    /// Claim Ethernet+IPv4+UDP(67)+DHCPv4 requests; everything else is
    /// declined to the next stage.
    pub fn handle(&self, frame: &[u8]) -> Result<ModuleStatus> {
        let Some(request) = parse_dhcp_request(frame) else {
            return Ok(ModuleStatus::Declined);
        };

        let msg_type = match message_type(&request) {
            Some(t) => t,
            None => return Ok(ModuleStatus::Declined),
        };
        let reply_type = match msg_type {
            MessageType::Discover => DHCP_OFFER,
            MessageType::Request => DHCP_ACK,
            other => {
                return Err(Error::Unsupported(format!("DHCP message type {other:?}")));
            }
        };

        let chaddr: [u8; 6] = request.chaddr()[..6]
            .try_into()
            .map_err(|_| Error::ParseError("DHCP client hardware address".into()))?;
        let client_mac = EthernetAddress(chaddr);
        let client = self.registry.by_mac(client_mac)?;

        let ip = self.pool.lock().unwrap().lease(client_mac)?;
        client.set_ip(ip);

        debug!(
            msg_type = ?msg_type,
            mac = %client_mac,
            ip = %ip,
            xid = request.xid(),
            "DHCP lease"
        );

        let payload = self.build_reply(&request, reply_type, ip, chaddr);
        Ok(ModuleStatus::Claimed(Dispatch::new(payload, Verdict::Sender)))
    }

    /// Return the detaching guest's lease to the pool.
    pub fn on_detach(&self, client: &crate::registry::Client) {
        self.pool.lock().unwrap().release(client.mac);
    }

    /// Build the complete OFFER/ACK frame: Ethernet gateway→client, IPv4
    /// gateway→255.255.255.255, UDP 67→68, then the BOOTP reply.
    fn build_reply(
        &self,
        request: &Message,
        reply_type: u8,
        leased_ip: Ipv4Addr,
        chaddr: [u8; 6],
    ) -> Vec<u8> {
        let dhcp_bytes = self.build_bootp_reply(request, reply_type, leased_ip, chaddr);

        let udp_len = UDP_HEADER_SIZE + dhcp_bytes.len();
        let ip_len = IPV4_HEADER_SIZE + udp_len;
        let mut packet = vec![0u8; ETHERNET_HEADER_SIZE + ip_len];

        let eth_repr = EthernetRepr {
            src_addr: self.gateway_mac,
            dst_addr: EthernetAddress(chaddr),
            ethertype: EthernetProtocol::Ipv4,
        };
        let mut eth_frame = EthernetFrame::new_unchecked(&mut packet[..]);
        eth_repr.emit(&mut eth_frame);

        let ip_repr = Ipv4Repr {
            src_addr: Ipv4Address::from_bytes(&self.gateway_ip.octets()),
            dst_addr: Ipv4Address::BROADCAST,
            next_header: IpProtocol::Udp,
            payload_len: udp_len,
            hop_limit: 64,
        };
        let mut ip_packet = Ipv4Packet::new_unchecked(eth_frame.payload_mut());
        ip_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());

        let udp_repr = UdpRepr {
            src_port: DHCP_SERVER_PORT,
            dst_port: DHCP_CLIENT_PORT,
        };
        let mut udp_packet = UdpPacket::new_unchecked(ip_packet.payload_mut());
        udp_repr.emit(
            &mut udp_packet,
            &ip_repr.src_addr.into(),
            &ip_repr.dst_addr.into(),
            dhcp_bytes.len(),
            |buf| buf.copy_from_slice(&dhcp_bytes),
            &ChecksumCapabilities::default(),
        );

        packet
    }

    /// BOOTP reply payload: fixed header, magic cookie, then the options in
    /// a fixed wire order: MessageType, ServerID, LeaseTime, Router,
    /// SubnetMask, DNS, End.
    fn build_bootp_reply(
        &self,
        request: &Message,
        reply_type: u8,
        leased_ip: Ipv4Addr,
        chaddr: [u8; 6],
    ) -> Vec<u8> {
        let mut out = vec![0u8; BOOTP_HEADER_SIZE];
        out[0] = BOOTREPLY;
        out[1] = 1; // htype: Ethernet
        out[2] = 6; // hlen
        out[4..8].copy_from_slice(&request.xid().to_be_bytes());
        out[16..20].copy_from_slice(&leased_ip.octets()); // yiaddr
        out[20..24].copy_from_slice(&self.gateway_ip.octets()); // siaddr
        out[28..34].copy_from_slice(&chaddr);
        out.extend_from_slice(&MAGIC_COOKIE);

        push_option(&mut out, OPT_MESSAGE_TYPE, &[reply_type]);
        push_option(&mut out, OPT_SERVER_ID, &self.gateway_ip.octets());
        push_option(&mut out, OPT_LEASE_TIME, &LEASE_TIME_SECS.to_be_bytes());
        push_option(&mut out, OPT_ROUTER, &self.gateway_ip.octets());
        push_option(&mut out, OPT_SUBNET_MASK, &self.subnet_mask.octets());
        push_option(&mut out, OPT_DNS, &self.dns_ip.octets());
        out.push(OPT_END);
        out
    }
}

fn push_option(out: &mut Vec<u8>, code: u8, data: &[u8]) {
    out.push(code);
    out.push(data.len() as u8);
    out.extend_from_slice(data);
}

/// Extract a BOOTP request from a frame, requiring the full
/// Ethernet/IPv4/UDP/DHCPv4 layering.
fn parse_dhcp_request(frame: &[u8]) -> Option<Message> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }
    let ipv4 = Ipv4Packet::new_checked(eth.payload()).ok()?;
    if ipv4.next_header() != IpProtocol::Udp {
        return None;
    }
    let udp = UdpPacket::new_checked(ipv4.payload()).ok()?;
    if udp.dst_port() != DHCP_SERVER_PORT {
        return None;
    }
    let mut decoder = Decoder::new(udp.payload());
    let msg = Message::decode(&mut decoder).ok()?;
    if msg.opcode() != Opcode::BootRequest {
        return None;
    }
    Some(msg)
}

fn message_type(msg: &Message) -> Option<MessageType> {
    msg.opts().get(OptionCode::MessageType).and_then(|opt| {
        if let DhcpOption::MessageType(t) = opt {
            Some(*t)
        } else {
            None
        }
    })
}
