//! RFC 1071 Internet checksum helpers.

use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Add `data` to a running 32-bit one's complement accumulator.
pub fn add_bytes(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

/// Fold the accumulator to 16 bits and complement it.
pub fn finish(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

pub fn internet_checksum(data: &[u8]) -> u16 {
    finish(add_bytes(0, data))
}

/// Checksum of an IPv4 header whose checksum field is zero (or included, for verification).
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    internet_checksum(header)
}

fn pseudo_header_ipv4(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, len: usize) -> u32 {
    let mut sum = add_bytes(0, &src.octets());
    sum = add_bytes(sum, &dst.octets());
    sum = sum.wrapping_add(protocol as u32);
    sum.wrapping_add(len as u32)
}

fn pseudo_header_ipv6(src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, len: usize) -> u32 {
    let mut sum = add_bytes(0, &src.octets());
    sum = add_bytes(sum, &dst.octets());
    sum = add_bytes(sum, &(len as u32).to_be_bytes());
    sum.wrapping_add(next_header as u32)
}

/// Transport checksum (TCP/UDP) over an IPv4 pseudo header.
pub fn transport_checksum_ipv4(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    finish(add_bytes(
        pseudo_header_ipv4(src, dst, protocol, segment.len()),
        segment,
    ))
}

/// Transport checksum (TCP/UDP/ICMPv6) over an IPv6 pseudo header.
pub fn transport_checksum_ipv6(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    next_header: u8,
    segment: &[u8],
) -> u16 {
    finish(add_bytes(
        pseudo_header_ipv6(src, dst, next_header, segment.len()),
        segment,
    ))
}

/// Transport checksum for either address family.
///
/// Mixed families cannot occur on the wire; they are summed as if both were IPv6 (the IPv4 side
/// mapped) so the function stays total.
pub fn transport_checksum(src: IpAddr, dst: IpAddr, protocol: u8, segment: &[u8]) -> u16 {
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => transport_checksum_ipv4(src, dst, protocol, segment),
        (src, dst) => transport_checksum_ipv6(to_v6(src), to_v6(dst), protocol, segment),
    }
}

fn to_v6(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}
