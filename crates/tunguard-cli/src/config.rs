use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tunguard_engine::{EngineConfig, Socks5Config};

#[derive(Debug, Clone, Parser)]
#[command(name = "tunguard", version, about)]
pub struct Args {
    /// Tun file descriptor inherited from the parent process.
    ///
    /// Environment variable: `TUNGUARD_TUN_FD`.
    #[arg(long, env = "TUNGUARD_TUN_FD")]
    pub tun_fd: i32,

    /// TOML policy file with allow/deny lists and redirects. Without one every flow is
    /// allowed.
    ///
    /// Environment variable: `TUNGUARD_POLICY`.
    #[arg(long, env = "TUNGUARD_POLICY")]
    pub policy: Option<PathBuf>,

    /// Tun MTU; overrides `TUNGUARD_MTU`.
    #[arg(long)]
    pub mtu: Option<u16>,

    /// Extra cap on concurrent sessions; overrides `TUNGUARD_MAX_SESSIONS`.
    #[arg(long)]
    pub max_sessions: Option<usize>,

    /// SOCKS5 relay for TCP flows that are not redirected. Credentials come from
    /// `TUNGUARD_SOCKS5_USERNAME` and `TUNGUARD_SOCKS5_PASSWORD`.
    #[arg(long)]
    pub socks5: Option<SocketAddr>,

    /// Police port 53 UDP flows like any other flow instead of only inspecting answers.
    #[arg(long)]
    pub forward_dns: bool,

    /// Seconds between stats reports; 0 disables them.
    #[arg(long, default_value_t = 60)]
    pub stats_interval: u64,

    /// Rewrite this file with Prometheus text metrics on every stats report.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,
}

impl Args {
    /// Layer the command line over a configuration read from the environment.
    pub fn apply(&self, mut config: EngineConfig) -> EngineConfig {
        if let Some(mtu) = self.mtu {
            config.mtu = mtu;
        }
        if let Some(max) = self.max_sessions {
            config.max_sessions = Some(max);
        }
        if let Some(addr) = self.socks5 {
            let (username, password) = config
                .socks5
                .take()
                .map(|relay| (relay.username, relay.password))
                .unwrap_or_default();
            config.socks5 = Some(Socks5Config {
                addr,
                username,
                password,
            });
        }
        config.forward_dns |= self.forward_dns;
        config.verify_checksums |=
            tracing::enabled!(target: "tunguard_engine", tracing::Level::DEBUG);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_the_environment() {
        let args = Args::try_parse_from([
            "tunguard",
            "--tun-fd",
            "3",
            "--mtu",
            "1500",
            "--socks5",
            "127.0.0.1:1080",
            "--forward-dns",
        ])
        .unwrap();
        assert_eq!(args.tun_fd, 3);
        assert_eq!(args.stats_interval, 60);

        let env = EngineConfig {
            max_sessions: Some(32),
            socks5: Some(Socks5Config {
                addr: "10.0.0.1:1080".parse().unwrap(),
                username: "user".into(),
                password: "secret".into(),
            }),
            ..EngineConfig::default()
        };
        let config = args.apply(env);
        assert_eq!(config.mtu, 1500);
        assert_eq!(config.max_sessions, Some(32));
        assert!(config.forward_dns);
        let relay = config.socks5.unwrap();
        assert_eq!(relay.addr, "127.0.0.1:1080".parse().unwrap());
        assert_eq!(relay.username, "user");
        assert_eq!(relay.password, "secret");
    }

    #[test]
    fn tun_fd_is_required() {
        if std::env::var_os("TUNGUARD_TUN_FD").is_none() {
            assert!(Args::try_parse_from(["tunguard"]).is_err());
        }
        assert!(Args::try_parse_from(["tunguard", "--tun-fd", "x"]).is_err());
    }
}
