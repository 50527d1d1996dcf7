//! The TOML policy file.
//!
//! ```toml
//! allow = []                      # empty: every destination not denied
//! deny = ["198.51.100.0/24", "2001:db8::/32"]
//! deny_domains = ["tracker.example"]
//! log_packets = false
//!
//! [[redirects]]
//! from = "203.0.113.10:80"
//! to = "127.0.0.1:8080"
//! ```

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use tunguard_engine::{IpCidr, StaticPolicy};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PolicyFile {
    allow: Vec<String>,
    deny: Vec<String>,
    deny_domains: Vec<String>,
    redirects: Vec<Redirect>,
    log_packets: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Redirect {
    from: SocketAddr,
    to: SocketAddr,
}

pub fn load(path: &Path) -> anyhow::Result<StaticPolicy> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read policy file {}", path.display()))?;
    parse(&text).with_context(|| format!("invalid policy file {}", path.display()))
}

pub fn parse(text: &str) -> anyhow::Result<StaticPolicy> {
    let file: PolicyFile = toml::from_str(text)?;
    Ok(StaticPolicy {
        allow_ips: cidrs(&file.allow)?,
        deny_ips: cidrs(&file.deny)?,
        deny_domains: file
            .deny_domains
            .iter()
            .map(|name| name.trim_end_matches('.').to_ascii_lowercase())
            .collect(),
        redirects: file
            .redirects
            .iter()
            .map(|redirect| (redirect.from, redirect.to))
            .collect(),
        log_packets: file.log_packets,
    })
}

fn cidrs(list: &[String]) -> anyhow::Result<Vec<IpCidr>> {
    list.iter()
        .map(|entry| entry.parse::<IpCidr>().map_err(anyhow::Error::from))
        .collect()
}
