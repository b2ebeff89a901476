//! DNS module.
//!
//! Owns one service address on the segment and does two jobs: answers ARP
//! requests for that address, and answers A/AAAA queries whose name equals
//! an attached guest's identifier with the guest's learned address. AAAA
//! answers carry a fixed documentation-range address so guests do not stall
//! waiting for an IPv6 record.

use std::net::Ipv4Addr;
use std::sync::Arc;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, UdpPacket, UdpRepr,
};
use tracing::debug;

use crate::error::{Error, Result};
use crate::modules::{Dispatch, ModuleStatus, Verdict};
use crate::registry::ClientRegistry;

const ETHERNET_HEADER_SIZE: usize = 14;
const IPV4_HEADER_SIZE: usize = 20;
const UDP_HEADER_SIZE: usize = 8;
const ARP_PACKET_SIZE: usize = 28;

const DNS_PORT: u16 = 53;
const DNS_HEADER_SIZE: usize = 12;

const QTYPE_A: u16 = 1;
const QTYPE_AAAA: u16 = 28;

/// TTL on every answer, in seconds.
const ANSWER_TTL: u32 = 300;

/// Stub AAAA record (2001:db8:85a3::1) handed out for every known name.
const AAAA_STUB: [u8; 16] = [
    0x20, 0x01, 0x0d, 0xb8, 0x85, 0xa3, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x01,
];

pub struct DnsModule {
    ip: Ipv4Addr,
    mac: EthernetAddress,
    registry: Arc<ClientRegistry>,
}

/// One parsed question plus the raw bytes to echo back.
struct Question {
    name: String,
    qtype: u16,
    qclass: u16,
}

/// A parsed DNS query header and its question section.
struct Query {
    id: u16,
    opcode: u16,
    response: bool,
    questions: Vec<Question>,
    /// Raw question section, echoed verbatim into the response.
    question_bytes: Vec<u8>,
}

impl DnsModule {
    pub fn new(ip: Ipv4Addr, mac: EthernetAddress, registry: Arc<ClientRegistry>) -> Self {
        DnsModule { ip, mac, registry }
    }

    pub fn handle(&self, frame: &[u8]) -> Result<ModuleStatus> {
        let Ok(eth) = EthernetFrame::new_checked(frame) else {
            return Ok(ModuleStatus::Declined);
        };
        match eth.ethertype() {
            EthernetProtocol::Arp => self.handle_arp(&eth),
            EthernetProtocol::Ipv4 => self.handle_query(&eth),
            _ => Ok(ModuleStatus::Declined),
        }
    }

    /// Answer ARP requests whose target protocol address is the DNS
    /// service address.
    fn handle_arp(&self, eth: &EthernetFrame<&[u8]>) -> Result<ModuleStatus> {
        let Ok(arp) = ArpPacket::new_checked(eth.payload()) else {
            return Ok(ModuleStatus::Declined);
        };
        let Ok(repr) = ArpRepr::parse(&arp) else {
            return Ok(ModuleStatus::Declined);
        };
        match repr {
            ArpRepr::EthernetIpv4 {
                operation: ArpOperation::Request,
                source_hardware_addr,
                source_protocol_addr,
                target_protocol_addr,
                ..
            } if Ipv4Addr::from(target_protocol_addr.0) == self.ip => {
                debug!(
                    requester = %source_protocol_addr,
                    "answering ARP for the DNS service address"
                );
                let mut packet = vec![0u8; ETHERNET_HEADER_SIZE + ARP_PACKET_SIZE];
                let eth_repr = EthernetRepr {
                    src_addr: self.mac,
                    dst_addr: source_hardware_addr,
                    ethertype: EthernetProtocol::Arp,
                };
                let mut eth_frame = EthernetFrame::new_unchecked(&mut packet[..]);
                eth_repr.emit(&mut eth_frame);

                let arp_repr = ArpRepr::EthernetIpv4 {
                    operation: ArpOperation::Reply,
                    source_hardware_addr: self.mac,
                    source_protocol_addr: target_protocol_addr,
                    target_hardware_addr: source_hardware_addr,
                    target_protocol_addr: source_protocol_addr,
                };
                let mut arp_packet = ArpPacket::new_unchecked(eth_frame.payload_mut());
                arp_repr.emit(&mut arp_packet);

                Ok(ModuleStatus::Claimed(Dispatch::new(packet, Verdict::Sender)))
            }
            _ => Ok(ModuleStatus::Declined),
        }
    }

    /// Answer A/AAAA queries addressed to port 53.
    fn handle_query(&self, eth: &EthernetFrame<&[u8]>) -> Result<ModuleStatus> {
        let Ok(ipv4) = Ipv4Packet::new_checked(eth.payload()) else {
            return Ok(ModuleStatus::Declined);
        };
        if ipv4.next_header() != IpProtocol::Udp {
            return Ok(ModuleStatus::Declined);
        }
        let Ok(udp) = UdpPacket::new_checked(ipv4.payload()) else {
            return Ok(ModuleStatus::Declined);
        };
        if udp.dst_port() != DNS_PORT {
            return Ok(ModuleStatus::Declined);
        }
        let Some(query) = parse_query(udp.payload()) else {
            return Ok(ModuleStatus::Declined);
        };
        if query.response {
            return Ok(ModuleStatus::Declined);
        }

        let answers = self.build_answers(&query);
        if answers.is_empty() {
            return Err(Error::NoAnswer);
        }
        debug!(id = query.id, answers = answers.len(), "answering DNS query");

        let dns_bytes = build_response(&query, &answers);

        // Outer packet: Ethernet and IPv4 reversed, UDP back to the
        // querier's source port.
        let udp_len = UDP_HEADER_SIZE + dns_bytes.len();
        let ip_len = IPV4_HEADER_SIZE + udp_len;
        let mut packet = vec![0u8; ETHERNET_HEADER_SIZE + ip_len];

        let eth_repr = EthernetRepr {
            src_addr: eth.dst_addr(),
            dst_addr: eth.src_addr(),
            ethertype: EthernetProtocol::Ipv4,
        };
        let reply_src: Ipv4Address = ipv4.dst_addr();
        let reply_dst: Ipv4Address = ipv4.src_addr();
        let reply_port = udp.src_port();

        let mut eth_frame = EthernetFrame::new_unchecked(&mut packet[..]);
        eth_repr.emit(&mut eth_frame);

        let ip_repr = Ipv4Repr {
            src_addr: reply_src,
            dst_addr: reply_dst,
            next_header: IpProtocol::Udp,
            payload_len: udp_len,
            hop_limit: 64,
        };
        let mut ip_packet = Ipv4Packet::new_unchecked(eth_frame.payload_mut());
        ip_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());

        let udp_repr = UdpRepr {
            src_port: DNS_PORT,
            dst_port: reply_port,
        };
        let mut udp_packet = UdpPacket::new_unchecked(ip_packet.payload_mut());
        udp_repr.emit(
            &mut udp_packet,
            &ip_repr.src_addr.into(),
            &ip_repr.dst_addr.into(),
            dns_bytes.len(),
            |buf| buf.copy_from_slice(&dns_bytes),
            &ChecksumCapabilities::default(),
        );

        Ok(ModuleStatus::Claimed(Dispatch::new(packet, Verdict::Sender)))
    }

    /// One answer per question whose name matches an attached guest with a
    /// learned address; other names and record types are skipped.
    fn build_answers(&self, query: &Query) -> Vec<AnswerRecord> {
        let mut answers = Vec::new();
        for question in &query.questions {
            let Ok(client) = self.registry.by_id(&question.name) else {
                continue;
            };
            let Some(ip) = client.ip() else {
                continue;
            };
            let rdata = match question.qtype {
                QTYPE_A => ip.octets().to_vec(),
                QTYPE_AAAA => AAAA_STUB.to_vec(),
                _ => continue,
            };
            answers.push(AnswerRecord {
                name: question.name.clone(),
                rtype: question.qtype,
                rclass: question.qclass,
                rdata,
            });
        }
        answers
    }
}

struct AnswerRecord {
    name: String,
    rtype: u16,
    rclass: u16,
    rdata: Vec<u8>,
}

/// Parse a DNS message header and question section. Returns `None` when the
/// bytes do not form a well-formed question section.
fn parse_query(payload: &[u8]) -> Option<Query> {
    if payload.len() < DNS_HEADER_SIZE {
        return None;
    }
    let id = u16::from_be_bytes([payload[0], payload[1]]);
    let flags = u16::from_be_bytes([payload[2], payload[3]]);
    let qdcount = u16::from_be_bytes([payload[4], payload[5]]);

    let mut pos = DNS_HEADER_SIZE;
    let mut questions = Vec::with_capacity(qdcount as usize);
    for _ in 0..qdcount {
        let (name, end) = parse_name(payload, pos)?;
        if end + 4 > payload.len() {
            return None;
        }
        questions.push(Question {
            name,
            qtype: u16::from_be_bytes([payload[end], payload[end + 1]]),
            qclass: u16::from_be_bytes([payload[end + 2], payload[end + 3]]),
        });
        pos = end + 4;
    }

    Some(Query {
        id,
        opcode: (flags >> 11) & 0xf,
        response: flags & 0x8000 != 0,
        questions,
        question_bytes: payload[DNS_HEADER_SIZE..pos].to_vec(),
    })
}

/// Parse an uncompressed label sequence starting at `pos`; returns the
/// dotted name and the offset just past the terminating zero label.
fn parse_name(payload: &[u8], mut pos: usize) -> Option<(String, usize)> {
    let mut labels: Vec<&str> = Vec::new();
    loop {
        let len = *payload.get(pos)? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        // Compression pointers never appear in the question section of a
        // query; reject them rather than chase offsets.
        if len & 0xc0 != 0 {
            return None;
        }
        let label = payload.get(pos + 1..pos + 1 + len)?;
        labels.push(std::str::from_utf8(label).ok()?);
        pos += 1 + len;
    }
    if labels.is_empty() {
        return None;
    }
    Some((labels.join("."), pos))
}

/// Assemble the response message: header with QR/AA/RA set, the question
/// section echoed, then the answer records with uncompressed names.
fn build_response(query: &Query, answers: &[AnswerRecord]) -> Vec<u8> {
    let mut out = Vec::with_capacity(DNS_HEADER_SIZE + query.question_bytes.len() + 64);
    out.extend_from_slice(&query.id.to_be_bytes());
    let flags: u16 = 0x8000 | (query.opcode << 11) | 0x0400 | 0x0080;
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&(query.questions.len() as u16).to_be_bytes());
    out.extend_from_slice(&(answers.len() as u16).to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());

    out.extend_from_slice(&query.question_bytes);

    for answer in answers {
        encode_name(&mut out, &answer.name);
        out.extend_from_slice(&answer.rtype.to_be_bytes());
        out.extend_from_slice(&answer.rclass.to_be_bytes());
        out.extend_from_slice(&ANSWER_TTL.to_be_bytes());
        out.extend_from_slice(&(answer.rdata.len() as u16).to_be_bytes());
        out.extend_from_slice(&answer.rdata);
    }
    out
}

fn encode_name(out: &mut Vec<u8>, name: &str) {
    for label in name.split('.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
}
