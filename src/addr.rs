//! Address utilities: MAC generation, IP-range expansion and address checks.

use std::net::Ipv4Addr;

use rand::Rng;
use smoltcp::wire::EthernetAddress;

use crate::error::{Error, Result};

/// The all-ones Ethernet broadcast address.
pub const BROADCAST_MAC: EthernetAddress = EthernetAddress([0xff; 6]);

/// Generate a random MAC address with the locally-administered bit set and
/// the multicast bit cleared.
pub fn new_mac() -> EthernetAddress {
    let mut mac = [0u8; 6];
    rand::thread_rng().fill(&mut mac);
    mac[0] = (mac[0] | 0x02) & 0xfe;
    EthernetAddress(mac)
}

/// Parse a colon-separated MAC address string.
pub fn parse_mac(s: &str) -> Result<EthernetAddress> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for octet in mac.iter_mut() {
        let part = parts
            .next()
            .ok_or_else(|| Error::BadInput(format!("invalid MAC address: {s}")))?;
        *octet = u8::from_str_radix(part, 16)
            .map_err(|_| Error::BadInput(format!("invalid MAC address: {s}")))?;
    }
    if parts.next().is_some() {
        return Err(Error::BadInput(format!("invalid MAC address: {s}")));
    }
    Ok(EthernetAddress(mac))
}

/// Render a MAC in the colon-separated form emulators and the control
/// plane expect.
pub fn format_mac(mac: EthernetAddress) -> String {
    let m = mac.0;
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        m[0], m[1], m[2], m[3], m[4], m[5]
    )
}

/// Expand an `a.b.c.x-y` range string into the inclusive address sequence
/// a.b.c.x ..= a.b.c.y.
pub fn expand_range(range: &str) -> Result<Vec<Ipv4Addr>> {
    let (start, end) = range
        .split_once('-')
        .ok_or_else(|| Error::BadInput(format!("invalid IP range: {range}")))?;
    let start: Ipv4Addr = start
        .parse()
        .map_err(|_| Error::BadInput(format!("invalid IP range: {range}")))?;
    let end: u8 = end
        .parse()
        .map_err(|_| Error::BadInput(format!("invalid IP range: {range}")))?;
    let [a, b, c, first] = start.octets();
    if first > end {
        return Err(Error::BadInput(format!(
            "range start must not be above range end: {range}"
        )));
    }
    Ok((first..=end).map(|d| Ipv4Addr::new(a, b, c, d)).collect())
}

/// Test a MAC against ff:ff:ff:ff:ff:ff.
pub fn is_broadcast_mac(mac: EthernetAddress) -> bool {
    mac == BROADCAST_MAC
}

/// An address a guest can plausibly own: rejects loopback, multicast,
/// link-local, unspecified and the limited broadcast.
pub fn is_usable_ip(ip: Ipv4Addr) -> bool {
    !(ip.is_loopback()
        || ip.is_multicast()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast())
}
