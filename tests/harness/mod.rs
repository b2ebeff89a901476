//! Shared helpers for fabric integration tests: a simulated guest endpoint
//! speaking the datagram socket pair, plus protocol frame builders.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use dhcproto::v4::{DhcpOption, HType, Message, MessageType, Opcode};
use dhcproto::{Decodable, Decoder, Encodable, Encoder};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, UdpPacket, UdpRepr,
};
use tokio::net::UnixDatagram;
use tokio::time::{sleep, timeout};

use unetd::addr;
use unetd::modules::{DhcpModule, DnsModule, LearningModule, NetworkModule, SwitchModule};
use unetd::network::{DEFAULT_FRAME_LIMIT, Network};
use unetd::registry::{Client, ClientRegistry};

pub const ETHERNET_HEADER_SIZE: usize = 14;
pub const IPV4_HEADER_SIZE: usize = 20;
pub const UDP_HEADER_SIZE: usize = 8;
pub const ARP_PACKET_SIZE: usize = 28;

pub const GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(10, 10, 10, 1);
pub const GATEWAY_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0xff];
pub const DNS_IP: Ipv4Addr = Ipv4Addr::new(10, 10, 10, 2);
pub const DNS_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0xfe];

/// Build a network with the standard test addressing: subnet 10.10.10.0/24,
/// gateway 10.10.10.1, DNS 10.10.10.2 and the given DHCP range.
pub fn test_network(name: &str, range: &str, disconnect_on_write_failure: bool) -> Arc<Network> {
    let registry = Arc::new(ClientRegistry::new());
    let modules = vec![
        NetworkModule::Learning(LearningModule::new(registry.clone())),
        NetworkModule::Dhcp(DhcpModule::new(
            "10.10.10.0/24".parse().unwrap(),
            GATEWAY_IP,
            EthernetAddress(GATEWAY_MAC),
            addr::expand_range(range).unwrap(),
            DNS_IP,
            registry.clone(),
        )),
        NetworkModule::Dns(DnsModule::new(
            DNS_IP,
            EthernetAddress(DNS_MAC),
            registry.clone(),
        )),
        NetworkModule::Switch(SwitchModule::new(registry.clone())),
    ];
    Arc::new(Network::new(
        name,
        DEFAULT_FRAME_LIMIT,
        registry,
        modules,
        disconnect_on_write_failure,
    ))
}

/// A simulated guest: reads delivered frames from its LOCAL socket and
/// writes frames into the fabric through its REMOTE socket.
pub struct Guest {
    pub client: Arc<Client>,
    local: Option<UnixDatagram>,
    remote: UnixDatagram,
}

impl Guest {
    pub async fn join(network: &Arc<Network>, id: &str) -> Guest {
        let client = network.attach(id).expect("attach failed");

        // Bind the LOCAL endpoint before any delivery can happen.
        let local = UnixDatagram::bind(&client.local_path).expect("bind local socket");

        // The listener task binds the REMOTE path asynchronously.
        let remote = UnixDatagram::unbound().expect("create socket");
        let mut connected = false;
        for _ in 0..400 {
            if remote.connect(&client.remote_path).is_ok() {
                connected = true;
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert!(connected, "listener socket for {id} never appeared");

        Guest {
            client,
            local: Some(local),
            remote,
        }
    }

    pub fn mac(&self) -> [u8; 6] {
        self.client.mac.0
    }

    pub async fn send(&self, frame: &[u8]) {
        self.remote.send(frame).await.expect("send to fabric");
    }

    /// Receive one delivered frame, panicking if none arrives in time.
    pub async fn recv(&self) -> Vec<u8> {
        self.try_recv(Duration::from_secs(2))
            .await
            .expect("no frame delivered")
    }

    /// Receive one delivered frame if any arrives within the window.
    pub async fn try_recv(&self, window: Duration) -> Option<Vec<u8>> {
        let local = self.local.as_ref().expect("LOCAL endpoint closed");
        let mut buf = vec![0u8; DEFAULT_FRAME_LIMIT];
        match timeout(window, local.recv(&mut buf)).await {
            Ok(Ok(len)) => {
                buf.truncate(len);
                Some(buf)
            }
            _ => None,
        }
    }

    /// Close the LOCAL endpoint so subsequent fabric writes fail.
    pub fn close_local(&mut self) {
        self.local.take();
    }
}

// ============================================================================
// Frame builders
// ============================================================================

/// Raw Ethernet frame with an arbitrary ethertype and payload.
pub fn eth_frame(src: [u8; 6], dst: [u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; ETHERNET_HEADER_SIZE + payload.len()];
    let repr = EthernetRepr {
        src_addr: EthernetAddress(src),
        dst_addr: EthernetAddress(dst),
        ethertype: ethertype.into(),
    };
    let mut eth = EthernetFrame::new_unchecked(&mut frame);
    repr.emit(&mut eth);
    eth.payload_mut()[..payload.len()].copy_from_slice(payload);
    frame
}

fn udp_frame(
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = UDP_HEADER_SIZE + payload.len();
    let ip_len = IPV4_HEADER_SIZE + udp_len;
    let mut packet = vec![0u8; ETHERNET_HEADER_SIZE + ip_len];

    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(src_mac),
        dst_addr: EthernetAddress(dst_mac),
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut eth = EthernetFrame::new_unchecked(&mut packet[..]);
    eth_repr.emit(&mut eth);

    let ip_repr = Ipv4Repr {
        src_addr: Ipv4Address::from_bytes(&src_ip.octets()),
        dst_addr: Ipv4Address::from_bytes(&dst_ip.octets()),
        next_header: IpProtocol::Udp,
        payload_len: udp_len,
        hop_limit: 64,
    };
    let mut ip = Ipv4Packet::new_unchecked(eth.payload_mut());
    ip_repr.emit(&mut ip, &ChecksumCapabilities::default());

    let udp_repr = UdpRepr { src_port, dst_port };
    let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
    udp_repr.emit(
        &mut udp,
        &ip_repr.src_addr.into(),
        &ip_repr.dst_addr.into(),
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &ChecksumCapabilities::default(),
    );
    packet
}

/// DHCP DISCOVER from the given guest MAC.
pub fn dhcp_discover(mac: [u8; 6], xid: u32) -> Vec<u8> {
    dhcp_frame(mac, xid, MessageType::Discover)
}

/// DHCP REQUEST from the given guest MAC.
pub fn dhcp_request(mac: [u8; 6], xid: u32) -> Vec<u8> {
    dhcp_frame(mac, xid, MessageType::Request)
}

pub fn dhcp_frame(mac: [u8; 6], xid: u32, msg_type: MessageType) -> Vec<u8> {
    let mut msg = Message::default();
    msg.set_opcode(Opcode::BootRequest);
    msg.set_htype(HType::Eth);
    msg.set_xid(xid);
    msg.set_chaddr(&mac);
    msg.opts_mut().insert(DhcpOption::MessageType(msg_type));

    let mut dhcp_bytes = Vec::new();
    let mut encoder = Encoder::new(&mut dhcp_bytes);
    msg.encode(&mut encoder).unwrap();

    udp_frame(
        mac,
        [0xff; 6],
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::BROADCAST,
        68,
        67,
        &dhcp_bytes,
    )
}

/// Parse an OFFER/ACK frame back into its BOOTP message.
pub fn parse_dhcp_reply(frame: &[u8]) -> Message {
    let payload = dhcp_payload(frame);
    let mut decoder = Decoder::new(&payload);
    Message::decode(&mut decoder).unwrap()
}

/// Raw BOOTP payload of an OFFER/ACK frame.
pub fn dhcp_payload(frame: &[u8]) -> Vec<u8> {
    let eth = EthernetFrame::new_checked(frame).unwrap();
    let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
    let udp = UdpPacket::new_checked(ip.payload()).unwrap();
    assert_eq!(udp.src_port(), 67);
    assert_eq!(udp.dst_port(), 68);
    udp.payload().to_vec()
}

/// BOOTP fixed header length, up to and excluding the magic cookie.
pub const BOOTP_HEADER_SIZE: usize = 236;

/// Walk a BOOTP payload's options region, returning (code, length) pairs
/// through the End option.
pub fn dhcp_option_layout(payload: &[u8]) -> Vec<(u8, u8)> {
    assert_eq!(
        &payload[BOOTP_HEADER_SIZE..BOOTP_HEADER_SIZE + 4],
        &[0x63, 0x82, 0x53, 0x63],
        "magic cookie must follow the BOOTP header"
    );
    let mut layout = Vec::new();
    let mut pos = BOOTP_HEADER_SIZE + 4;
    while pos < payload.len() {
        let code = payload[pos];
        if code == 255 {
            layout.push((code, 0));
            break;
        }
        let len = payload[pos + 1];
        layout.push((code, len));
        pos += 2 + len as usize;
    }
    layout
}

/// DNS query frame for one question.
pub fn dns_query(
    src_mac: [u8; 6],
    src_ip: Ipv4Addr,
    src_port: u16,
    id: u16,
    qname: &str,
    qtype: u16,
) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&id.to_be_bytes());
    payload.extend_from_slice(&0x0100u16.to_be_bytes()); // RD set, QR clear
    payload.extend_from_slice(&1u16.to_be_bytes());
    payload.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    encode_qname(&mut payload, qname);
    payload.extend_from_slice(&qtype.to_be_bytes());
    payload.extend_from_slice(&1u16.to_be_bytes()); // class IN

    udp_frame(src_mac, DNS_MAC, src_ip, DNS_IP, src_port, 53, &payload)
}

fn encode_qname(out: &mut Vec<u8>, name: &str) {
    for label in name.split('.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
}

/// A decoded DNS response: header fields and the answer rdata blobs.
pub struct DnsReply {
    pub id: u16,
    pub flags: u16,
    pub question_count: u16,
    pub answer_count: u16,
    pub answers: Vec<(u16, u32, Vec<u8>)>, // (rtype, ttl, rdata)
}

/// Parse a DNS response frame delivered by the fabric.
pub fn parse_dns_reply(frame: &[u8]) -> DnsReply {
    let eth = EthernetFrame::new_checked(frame).unwrap();
    let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
    let udp = UdpPacket::new_checked(ip.payload()).unwrap();
    assert_eq!(udp.src_port(), 53);
    let payload = udp.payload();

    let id = u16::from_be_bytes([payload[0], payload[1]]);
    let flags = u16::from_be_bytes([payload[2], payload[3]]);
    let question_count = u16::from_be_bytes([payload[4], payload[5]]);
    let answer_count = u16::from_be_bytes([payload[6], payload[7]]);

    let mut pos = 12;
    for _ in 0..question_count {
        pos = skip_name(payload, pos) + 4;
    }
    let mut answers = Vec::new();
    for _ in 0..answer_count {
        pos = skip_name(payload, pos);
        let rtype = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
        let ttl = u32::from_be_bytes([
            payload[pos + 4],
            payload[pos + 5],
            payload[pos + 6],
            payload[pos + 7],
        ]);
        let rdlen = u16::from_be_bytes([payload[pos + 8], payload[pos + 9]]) as usize;
        let rdata = payload[pos + 10..pos + 10 + rdlen].to_vec();
        answers.push((rtype, ttl, rdata));
        pos += 10 + rdlen;
    }

    DnsReply {
        id,
        flags,
        question_count,
        answer_count,
        answers,
    }
}

fn skip_name(payload: &[u8], mut pos: usize) -> usize {
    loop {
        let len = payload[pos] as usize;
        if len == 0 {
            return pos + 1;
        }
        if len & 0xc0 != 0 {
            return pos + 2;
        }
        pos += 1 + len;
    }
}

/// ARP request frame.
pub fn arp_request(src_mac: [u8; 6], src_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    let mut frame = vec![0u8; ETHERNET_HEADER_SIZE + ARP_PACKET_SIZE];
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(src_mac),
        dst_addr: EthernetAddress([0xff; 6]),
        ethertype: EthernetProtocol::Arp,
    };
    let mut eth = EthernetFrame::new_unchecked(&mut frame);
    eth_repr.emit(&mut eth);

    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: EthernetAddress(src_mac),
        source_protocol_addr: Ipv4Address::from_bytes(&src_ip.octets()),
        target_hardware_addr: EthernetAddress([0; 6]),
        target_protocol_addr: Ipv4Address::from_bytes(&target_ip.octets()),
    };
    let mut arp = ArpPacket::new_unchecked(eth.payload_mut());
    arp_repr.emit(&mut arp);
    frame
}

/// A decoded ARP reply.
pub struct ArpReply {
    pub sender_mac: [u8; 6],
    pub sender_ip: Ipv4Addr,
    pub target_mac: [u8; 6],
    pub target_ip: Ipv4Addr,
}

pub fn parse_arp_reply(frame: &[u8]) -> ArpReply {
    let eth = EthernetFrame::new_checked(frame).unwrap();
    assert_eq!(eth.ethertype(), EthernetProtocol::Arp);
    let arp = ArpPacket::new_checked(eth.payload()).unwrap();
    match ArpRepr::parse(&arp).unwrap() {
        ArpRepr::EthernetIpv4 {
            operation,
            source_hardware_addr,
            source_protocol_addr,
            target_hardware_addr,
            target_protocol_addr,
        } => {
            assert_eq!(operation, ArpOperation::Reply);
            ArpReply {
                sender_mac: source_hardware_addr.0,
                sender_ip: Ipv4Addr::from(source_protocol_addr.0),
                target_mac: target_hardware_addr.0,
                target_ip: Ipv4Addr::from(target_protocol_addr.0),
            }
        }
        _ => panic!("expected an EthernetIpv4 ARP reply"),
    }
}
