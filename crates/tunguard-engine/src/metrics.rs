use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::flow::Protocol;

#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    // Tun traffic
    packets_rx_total: AtomicU64,
    packets_tx_total: AtomicU64,
    bytes_rx_total: AtomicU64,
    bytes_tx_total: AtomicU64,
    tun_write_fail_total: AtomicU64,

    // Drops
    packets_malformed_total: AtomicU64,
    packets_unsupported_total: AtomicU64,
    capacity_dropped_total: AtomicU64,
    policy_denied_total: AtomicU64,

    // Sessions
    icmp_sessions_active: AtomicU64,
    udp_sessions_active: AtomicU64,
    tcp_sessions_active: AtomicU64,
    icmp_sessions_total: AtomicU64,
    udp_sessions_total: AtomicU64,
    tcp_sessions_total: AtomicU64,
    sessions_removed_total: AtomicU64,
    tcp_resets_total: AtomicU64,

    // Inspectors
    dns_blocked_total: AtomicU64,
    dhcp_replies_total: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_rx_total: u64,
    pub packets_tx_total: u64,
    pub bytes_rx_total: u64,
    pub bytes_tx_total: u64,
    pub tun_write_fail_total: u64,
    pub packets_malformed_total: u64,
    pub packets_unsupported_total: u64,
    pub capacity_dropped_total: u64,
    pub policy_denied_total: u64,
    pub icmp_sessions_total: u64,
    pub udp_sessions_total: u64,
    pub tcp_sessions_total: u64,
    pub sessions_removed_total: u64,
    pub tcp_resets_total: u64,
    pub dns_blocked_total: u64,
    pub dhcp_replies_total: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn packet_rx(&self, bytes: usize) {
        self.inner.packets_rx_total.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_rx_total
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn packet_tx(&self, bytes: usize) {
        self.inner.packets_tx_total.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_tx_total
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn tun_write_failed(&self) {
        self.inner
            .tun_write_fail_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn packet_malformed(&self) {
        self.inner
            .packets_malformed_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn packet_unsupported(&self) {
        self.inner
            .packets_unsupported_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn capacity_dropped(&self) {
        self.inner
            .capacity_dropped_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn policy_denied(&self) {
        self.inner
            .policy_denied_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_opened(&self, protocol: Protocol) {
        let counter = match protocol {
            Protocol::Icmp => &self.inner.icmp_sessions_total,
            Protocol::Udp => &self.inner.udp_sessions_total,
            Protocol::Tcp => &self.inner.tcp_sessions_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_removed(&self) {
        self.inner
            .sessions_removed_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_active(&self, icmp: usize, udp: usize, tcp: usize) {
        self.inner
            .icmp_sessions_active
            .store(icmp as u64, Ordering::Relaxed);
        self.inner
            .udp_sessions_active
            .store(udp as u64, Ordering::Relaxed);
        self.inner
            .tcp_sessions_active
            .store(tcp as u64, Ordering::Relaxed);
    }

    pub(crate) fn tcp_reset(&self) {
        self.inner.tcp_resets_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dns_blocked(&self) {
        self.inner.dns_blocked_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dhcp_reply(&self) {
        self.inner.dhcp_replies_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let inner = &self.inner;
        MetricsSnapshot {
            packets_rx_total: load(&inner.packets_rx_total),
            packets_tx_total: load(&inner.packets_tx_total),
            bytes_rx_total: load(&inner.bytes_rx_total),
            bytes_tx_total: load(&inner.bytes_tx_total),
            tun_write_fail_total: load(&inner.tun_write_fail_total),
            packets_malformed_total: load(&inner.packets_malformed_total),
            packets_unsupported_total: load(&inner.packets_unsupported_total),
            capacity_dropped_total: load(&inner.capacity_dropped_total),
            policy_denied_total: load(&inner.policy_denied_total),
            icmp_sessions_total: load(&inner.icmp_sessions_total),
            udp_sessions_total: load(&inner.udp_sessions_total),
            tcp_sessions_total: load(&inner.tcp_sessions_total),
            sessions_removed_total: load(&inner.sessions_removed_total),
            tcp_resets_total: load(&inner.tcp_resets_total),
            dns_blocked_total: load(&inner.dns_blocked_total),
            dhcp_replies_total: load(&inner.dhcp_replies_total),
        }
    }

    pub fn render_prometheus(&self) -> String {
        let snap = self.snapshot();
        let icmp_active = self.inner.icmp_sessions_active.load(Ordering::Relaxed);
        let udp_active = self.inner.udp_sessions_active.load(Ordering::Relaxed);
        let tcp_active = self.inner.tcp_sessions_active.load(Ordering::Relaxed);

        let mut out = String::new();

        push_counter(&mut out, "tunguard_packets_rx_total", snap.packets_rx_total);
        push_counter(&mut out, "tunguard_packets_tx_total", snap.packets_tx_total);
        push_counter(&mut out, "tunguard_bytes_rx_total", snap.bytes_rx_total);
        push_counter(&mut out, "tunguard_bytes_tx_total", snap.bytes_tx_total);
        push_counter(
            &mut out,
            "tunguard_tun_write_fail_total",
            snap.tun_write_fail_total,
        );

        push_counter(
            &mut out,
            "tunguard_packets_malformed_total",
            snap.packets_malformed_total,
        );
        push_counter(
            &mut out,
            "tunguard_packets_unsupported_total",
            snap.packets_unsupported_total,
        );
        push_counter(
            &mut out,
            "tunguard_capacity_dropped_total",
            snap.capacity_dropped_total,
        );
        push_counter(
            &mut out,
            "tunguard_policy_denied_total",
            snap.policy_denied_total,
        );

        push_gauge(&mut out, "tunguard_icmp_sessions_active", icmp_active);
        push_gauge(&mut out, "tunguard_udp_sessions_active", udp_active);
        push_gauge(&mut out, "tunguard_tcp_sessions_active", tcp_active);
        push_counter(
            &mut out,
            "tunguard_icmp_sessions_total",
            snap.icmp_sessions_total,
        );
        push_counter(&mut out, "tunguard_udp_sessions_total", snap.udp_sessions_total);
        push_counter(&mut out, "tunguard_tcp_sessions_total", snap.tcp_sessions_total);
        push_counter(
            &mut out,
            "tunguard_sessions_removed_total",
            snap.sessions_removed_total,
        );
        push_counter(&mut out, "tunguard_tcp_resets_total", snap.tcp_resets_total);

        push_counter(&mut out, "tunguard_dns_blocked_total", snap.dns_blocked_total);
        push_counter(&mut out, "tunguard_dhcp_replies_total", snap.dhcp_replies_total);

        out
    }
}

fn push_gauge(out: &mut String, name: &str, val: u64) {
    out.push_str("# TYPE ");
    out.push_str(name);
    out.push_str(" gauge\n");
    out.push_str(name);
    out.push(' ');
    out.push_str(&val.to_string());
    out.push('\n');
}

fn push_counter(out: &mut String, name: &str, val: u64) {
    out.push_str("# TYPE ");
    out.push_str(name);
    out.push_str(" counter\n");
    out.push_str(name);
    out.push(' ');
    out.push_str(&val.to_string());
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_counters_and_gauges() {
        let metrics = Metrics::new();
        metrics.packet_rx(60);
        metrics.packet_rx(40);
        metrics.session_opened(Protocol::Tcp);
        metrics.set_active(0, 2, 1);

        let snap = metrics.snapshot();
        assert_eq!(snap.packets_rx_total, 2);
        assert_eq!(snap.bytes_rx_total, 100);
        assert_eq!(snap.tcp_sessions_total, 1);

        let text = metrics.render_prometheus();
        assert!(text.contains("# TYPE tunguard_bytes_rx_total counter\ntunguard_bytes_rx_total 100\n"));
        assert!(text.contains("# TYPE tunguard_udp_sessions_active gauge\ntunguard_udp_sessions_active 2\n"));
    }
}
