//! Inspection of DNS responses on their way back to the client.

use std::net::IpAddr;

use tracing::{debug, warn};
use tunguard_packet::dns::{self, DnsMessage, DnsRecordData};

use crate::engine::Context;
use crate::flow::FlowKey;
use crate::host::{Direction, PacketRecord, ResolvedRecord};

/// Report the addresses in a DNS response and rewrite it in place when the queried name is
/// blocked or the answer carries a service binding.
///
/// Returns the new message length when the response was rewritten.
pub(crate) fn inspect_response(
    ctx: &Context,
    key: &FlowKey,
    uid: Option<u32>,
    msg: &mut [u8],
) -> Option<usize> {
    let header = DnsMessage::parse(msg).ok()?;
    if !header.is_response()
        || header.opcode() != 0
        || header.question_count() == 0
        || header.answer_count() == 0
    {
        if header.answer_count() > 0 {
            warn!(
                flow = %key,
                qr = header.is_response(),
                opcode = header.opcode(),
                qdcount = header.question_count(),
                ancount = header.answer_count(),
                "unexpected DNS message"
            );
        }
        return None;
    }
    if header.question_count() > 1 {
        warn!(flow = %key, qdcount = header.question_count(), "multiple DNS questions");
    }

    let response = match dns::parse_response(msg) {
        Ok(response) => response,
        Err(err) => {
            warn!(flow = %key, "unparsable DNS response: {err}");
            return None;
        }
    };
    debug!(
        flow = %key,
        qname = %response.qname,
        qtype = response.qtype,
        answers = response.answers.len(),
        "DNS response"
    );

    for answer in &response.answers {
        let resource = match answer.data {
            DnsRecordData::A(ip) => IpAddr::V4(ip),
            DnsRecordData::Aaaa(ip) => IpAddr::V6(ip),
            DnsRecordData::ServiceBinding => {
                warn!(flow = %key, name = %answer.name, rtype = answer.rtype, "service binding answer");
                continue;
            }
            DnsRecordData::Other => continue,
        };
        debug!(flow = %key, name = %answer.name, %resource, ttl = answer.ttl, "resolved");
        ctx.host.dns_resolved(&ResolvedRecord {
            qname: response.qname.clone(),
            aname: answer.name.clone(),
            resource,
            ttl: answer.ttl,
            uid,
        });
    }

    if !response.has_service_binding() && !ctx.host.is_domain_blocked(&response.qname, uid) {
        return None;
    }

    let rcode = ctx.config.dns_block_rcode;
    let len = match dns::rewrite_as_blocked(msg, response.question_end, rcode) {
        Ok(len) => len,
        Err(err) => {
            warn!(flow = %key, "DNS rewrite failed: {err}");
            return None;
        }
    };
    warn!(flow = %key, qname = %response.qname, rcode, "DNS response blocked");
    ctx.metrics.dns_blocked();
    ctx.host.log_packet(&PacketRecord {
        direction: Direction::Inbound,
        version: key.version,
        protocol: key.protocol,
        flags: String::new(),
        src: key.src,
        sport: key.sport,
        dst: key.dst,
        dport: key.dport,
        data: format!(
            "qtype {} qname {} rcode {}",
            response.qtype, response.qname, rcode
        ),
        uid,
        allowed: false,
    });
    Some(len)
}
