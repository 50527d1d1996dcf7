//! Engine configuration and the fixed protocol constants.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use tunguard_packet::IpVersion;

use crate::error::ConfigError;
use crate::Millis;

pub use tunguard_packet::dhcp::DhcpLease as DhcpConfig;

pub const ICMP_TIMEOUT: Millis = 5_000;

pub const UDP_TIMEOUT_53: Millis = 15_000;
pub const UDP_TIMEOUT_ANY: Millis = 300_000;
/// Grace period before a finished or blocked UDP session is removed.
pub const UDP_KEEP_TIMEOUT: Millis = 60_000;

pub const TCP_INIT_TIMEOUT: Millis = 20_000;
pub const TCP_IDLE_TIMEOUT: Millis = 3_600_000;
pub const TCP_CLOSE_TIMEOUT: Millis = 20_000;
/// Grace period before a closed TCP session is removed.
pub const TCP_KEEP_TIMEOUT: Millis = 300_000;

/// Share of the soft descriptor limit that sessions may use.
pub const SESSION_LIMIT_PERCENT: u64 = 40;
pub const SESSION_MAX: usize = 409;

/// Minimum interval between two sweeps of the session table.
pub const MIN_CHECK_INTERVAL: Millis = 100;
pub const DEFAULT_POLL_TIMEOUT: Millis = 3_600_000;

pub const TUN_YIELD: usize = 10;
pub const UDP_YIELD: usize = 10;

pub const UID_MAX_AGE: Millis = 30_000;

pub const SEND_BUF_DEFAULT: u32 = 163_840;
/// Worst-case header bytes charged against the send window per unconfirmed segment.
pub const TCP_HEADER_MARGIN: u32 = 40;

pub const UDP_MAX_MSG_V4: usize = 65_507;
pub const UDP_MAX_MSG_V6: usize = 65_487;

pub const DEFAULT_MTU: u16 = 10_000;

/// MSS advertised to clients: the MTU minus the IP and TCP headers.
pub fn default_mss(version: IpVersion) -> u16 {
    mss_for_mtu(DEFAULT_MTU, version)
}

pub(crate) fn mss_for_mtu(mtu: u16, version: IpVersion) -> u16 {
    let overhead = match version {
        IpVersion::V4 => 40,
        IpVersion::V6 => 60,
    };
    mtu.saturating_sub(overhead)
}

pub(crate) fn udp_max_message(version: IpVersion) -> usize {
    match version {
        IpVersion::V4 => UDP_MAX_MSG_V4,
        IpVersion::V6 => UDP_MAX_MSG_V6,
    }
}

/// Relay used for outbound TCP connections that are not redirected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Socks5Config {
    pub addr: SocketAddr,
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub mtu: u16,
    /// Extra cap on concurrent sessions, applied on top of the descriptor-derived bound.
    pub max_sessions: Option<usize>,
    pub socks5: Option<Socks5Config>,
    /// When false, UDP flows to port 53 skip the policy check and are policed by the DNS
    /// inspector instead.
    pub forward_dns: bool,
    /// Response code written into blocked DNS responses.
    pub dns_block_rcode: u8,
    /// Verify IPv4 header checksums on ingress.
    pub verify_checksums: bool,
    /// Directory holding the `tcp`, `udp`, `icmp` connection tables and their IPv6 variants.
    pub proc_net_dir: PathBuf,
    pub dhcp: DhcpConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            max_sessions: None,
            socks5: None,
            forward_dns: false,
            dns_block_rcode: tunguard_packet::dns::DNS_RCODE_NXDOMAIN,
            verify_checksums: false,
            proc_net_dir: PathBuf::from("/proc/net"),
            dhcp: DhcpConfig {
                server: Ipv4Addr::new(10, 1, 10, 1),
                client: Ipv4Addr::new(10, 1, 10, 2),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
                dns: Ipv4Addr::new(8, 8, 8, 8),
                lease_secs: 3600,
            },
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `TUNGUARD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(mtu) = parse_var::<u16>(&lookup, "TUNGUARD_MTU")? {
            if mtu < 1280 {
                return Err(ConfigError::TooSmall("TUNGUARD_MTU", 1280));
            }
            config.mtu = mtu;
        }
        if let Some(max) = parse_var::<usize>(&lookup, "TUNGUARD_MAX_SESSIONS")? {
            if max == 0 {
                return Err(ConfigError::TooSmall("TUNGUARD_MAX_SESSIONS", 1));
            }
            config.max_sessions = Some(max);
        }
        if let Some(addr) = parse_var::<SocketAddr>(&lookup, "TUNGUARD_SOCKS5_ADDR")? {
            config.socks5 = Some(Socks5Config {
                addr,
                username: lookup("TUNGUARD_SOCKS5_USERNAME").unwrap_or_default(),
                password: lookup("TUNGUARD_SOCKS5_PASSWORD").unwrap_or_default(),
            });
        }
        if let Some(forward) = parse_bool(&lookup, "TUNGUARD_FORWARD_DNS")? {
            config.forward_dns = forward;
        }
        if let Some(rcode) = parse_var::<u8>(&lookup, "TUNGUARD_DNS_BLOCK_RCODE")? {
            if rcode > 15 {
                return Err(ConfigError::InvalidEnv("TUNGUARD_DNS_BLOCK_RCODE"));
            }
            config.dns_block_rcode = rcode;
        }
        if let Some(verify) = parse_bool(&lookup, "TUNGUARD_VERIFY_CHECKSUMS")? {
            config.verify_checksums = verify;
        }
        if let Some(dir) = lookup("TUNGUARD_PROC_NET") {
            config.proc_net_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    pub fn mss(&self, version: IpVersion) -> u16 {
        mss_for_mtu(self.mtu, version)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv(name)),
    }
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<bool>, ConfigError> {
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidEnv(name)),
    }
}
