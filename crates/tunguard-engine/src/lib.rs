//! User-space flow engine that sits behind a tun device.
//!
//! The engine reads raw IP datagrams from the tun descriptor, tracks per-flow state for ICMP
//! echo, UDP and TCP, forwards the traffic through ordinary non-blocking sockets (optionally
//! through a SOCKS5 relay) and writes synthesized response datagrams back to the tun device.
//!
//! Policy, telemetry and socket protection are supplied by the embedder through the [`Host`]
//! trait. [`StaticPolicy`] is a ready-made implementation driven by CIDR and domain lists.
//!
//! ```no_run
//! use std::os::fd::{FromRawFd, OwnedFd};
//! use std::sync::Arc;
//!
//! use tunguard_engine::{Engine, EngineConfig, StaticPolicy};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // SAFETY: descriptor 3 is a tun device inherited from the parent process.
//! let tun = unsafe { OwnedFd::from_raw_fd(3) };
//! let mut engine = Engine::new(EngineConfig::default(), Arc::new(StaticPolicy::default()), tun)?;
//! let handle = engine.handle();
//! std::thread::spawn(move || engine.run());
//! // ... later, from any thread:
//! handle.stop();
//! # Ok(())
//! # }
//! ```
#![deny(unsafe_code)]

pub mod config;
mod dns;
mod engine;
mod error;
mod flow;
mod host;
mod icmp;
mod ingress;
mod metrics;
mod policy;
mod session;
mod sys;
mod tcp;
mod tun;
mod uid;
mod udp;

pub use config::{default_mss, DhcpConfig, EngineConfig, Socks5Config};
pub use engine::{Engine, EngineHandle, EngineStats};
pub use error::{ConfigError, EngineError};
pub use flow::{FlowKey, Protocol};
pub use host::{
    Direction, FlowDescriptor, Host, PacketRecord, ResolvedRecord, UsageRecord, Verdict,
};
pub use metrics::{Metrics, MetricsSnapshot};
pub use policy::{IpCidr, ParseCidrError, StaticPolicy};
pub use tcp::TcpState;

/// Milliseconds on the engine's monotonic clock.
pub type Millis = u64;
