//! Attribution of flows to the application that owns the local socket.
//!
//! The kernel's connection tables (`/proc/net/tcp` and friends) list every socket with its
//! local and remote endpoint and the owning uid. Rows are cached for [`UID_MAX_AGE`]; a lookup
//! that misses the cache rescans the table for its protocol and refreshes the cache on the way.

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use tunguard_packet::IpVersion;

use crate::config::UID_MAX_AGE;
use crate::flow::Protocol;
use crate::Millis;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Endpoints {
    version: IpVersion,
    protocol: Protocol,
    src: IpAddr,
    sport: u16,
    dst: IpAddr,
    /// Zero for unconnected sockets.
    dport: u16,
}

impl Endpoints {
    /// Whether a table row (`self`) describes the socket behind `query`. Unspecified row
    /// addresses and a zero remote port act as wildcards.
    fn covers(&self, query: &Endpoints) -> bool {
        self.version == query.version
            && self.protocol == query.protocol
            && self.sport == query.sport
            && (self.dport == query.dport || self.dport == 0)
            && (self.src == query.src || self.src.is_unspecified())
            && (self.dst == query.dst || self.dst.is_unspecified())
    }
}

#[derive(Clone, Copy, Debug)]
struct CacheEntry {
    time: Millis,
    row: Endpoints,
    uid: u32,
}

pub(crate) struct UidResolver {
    dir: PathBuf,
    cache: Vec<CacheEntry>,
}

impl UidResolver {
    pub(crate) fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Vec::new(),
        }
    }

    /// Owner of the local socket behind a flow, or `None` when no table row matches.
    pub(crate) fn resolve(
        &mut self,
        protocol: Protocol,
        src: IpAddr,
        sport: u16,
        dst: IpAddr,
        dport: u16,
        now: Millis,
    ) -> Option<u32> {
        // Dual-stack sockets list IPv4 peers as mapped addresses in the IPv6 table.
        if let (IpAddr::V4(src4), IpAddr::V4(dst4)) = (src, dst) {
            if protocol != Protocol::Icmp {
                let mapped = Endpoints {
                    version: IpVersion::V6,
                    protocol,
                    src: IpAddr::V6(src4.to_ipv6_mapped()),
                    sport,
                    dst: IpAddr::V6(dst4.to_ipv6_mapped()),
                    dport,
                };
                if let Some(uid) = self.lookup(&mapped, now) {
                    return Some(uid);
                }
            }
        }

        let query = Endpoints {
            version: IpVersion::of(&src),
            protocol,
            src,
            sport,
            dst,
            dport,
        };
        let uid = self.lookup(&query, now);
        match uid {
            Some(uid) => tracing::debug!(%protocol, %src, sport, %dst, dport, uid, "uid resolved"),
            None => tracing::debug!(%protocol, %src, sport, %dst, dport, "uid not found"),
        }
        uid
    }

    fn lookup(&mut self, query: &Endpoints, now: Millis) -> Option<u32> {
        if let Some(entry) = self
            .cache
            .iter()
            .find(|entry| now.saturating_sub(entry.time) <= UID_MAX_AGE && entry.row.covers(query))
        {
            return Some(entry.uid);
        }

        let path = self.table_path(query.version, query.protocol);
        let rows = match read_table(&path, query.version, query.protocol) {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(path = %path.display(), "connection table unreadable: {err}");
                return None;
            }
        };

        let mut found = None;
        for (row, uid) in rows {
            self.remember(row, uid, now);
            if found.is_none() && row.covers(query) {
                found = Some(uid);
            }
        }
        found
    }

    fn remember(&mut self, row: Endpoints, uid: u32, now: Millis) {
        let slot = self
            .cache
            .iter_mut()
            .find(|entry| entry.row == row || now.saturating_sub(entry.time) > UID_MAX_AGE);
        let entry = CacheEntry {
            time: now,
            row,
            uid,
        };
        match slot {
            Some(slot) => *slot = entry,
            None => self.cache.push(entry),
        }
    }

    fn table_path(&self, version: IpVersion, protocol: Protocol) -> PathBuf {
        let name = match (protocol, version) {
            (Protocol::Icmp, IpVersion::V4) => "icmp",
            (Protocol::Icmp, IpVersion::V6) => "icmp6",
            (Protocol::Tcp, IpVersion::V4) => "tcp",
            (Protocol::Tcp, IpVersion::V6) => "tcp6",
            (Protocol::Udp, IpVersion::V4) => "udp",
            (Protocol::Udp, IpVersion::V6) => "udp6",
        };
        self.dir.join(name)
    }
}

fn read_table(
    path: &Path,
    version: IpVersion,
    protocol: Protocol,
) -> io::Result<Vec<(Endpoints, u32)>> {
    let text = fs::read_to_string(path)?;
    Ok(text
        .lines()
        .skip(1)
        .filter_map(|line| parse_row(line, version, protocol))
        .collect())
}

/// `sl local_address rem_address st tx_queue:rx_queue tr:tm->when retrnsmt uid ...`
fn parse_row(line: &str, version: IpVersion, protocol: Protocol) -> Option<(Endpoints, u32)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let (src, sport) = parse_endpoint(fields.get(1)?, version)?;
    let (dst, dport) = parse_endpoint(fields.get(2)?, version)?;
    let uid = fields.get(7)?.parse().ok()?;
    Some((
        Endpoints {
            version,
            protocol,
            src,
            sport,
            dst,
            dport,
        },
        uid,
    ))
}

/// Addresses are printed as native-endian 32-bit words in hex, ports as plain hex.
fn parse_endpoint(field: &str, version: IpVersion) -> Option<(IpAddr, u16)> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let word = |i: usize| -> Option<[u8; 4]> {
        let hex = addr.get(i * 8..i * 8 + 8)?;
        Some(u32::from_str_radix(hex, 16).ok()?.to_ne_bytes())
    };
    let ip = match version {
        IpVersion::V4 if addr.len() == 8 => IpAddr::V4(Ipv4Addr::from(word(0)?)),
        IpVersion::V6 if addr.len() == 32 => {
            let mut octets = [0u8; 16];
            for i in 0..4 {
                octets[i * 4..i * 4 + 4].copy_from_slice(&word(i)?);
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some((ip, port))
}
