//! Client side of the SOCKS5 handshake (RFC 1928, username/password auth per RFC 1929).

use std::net::SocketAddr;

use thiserror::Error;

use super::state::Socks5Phase;

pub(crate) const SOCKS5_VERSION: u8 = 5;
const AUTH_VERSION: u8 = 1;

const METHOD_NO_AUTH: u8 = 0;
const METHOD_USER_PASS: u8 = 2;

const CMD_CONNECT: u8 = 1;

const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum Socks5Error {
    #[error("relay selected unsupported auth method {0}")]
    UnsupportedMethod(u8),
    #[error("relay rejected credentials (status {0})")]
    AuthRejected(u8),
    /// Reply codes: 1 general failure, 2 not allowed by ruleset, 3 network unreachable, 4 host
    /// unreachable, 5 refused, 6 TTL expired, 7 command not supported, 8 address type not
    /// supported.
    #[error("relay refused connect (reply {0})")]
    ConnectRejected(u8),
    #[error("unexpected {len} byte reply in phase {phase:?}")]
    UnexpectedReply { phase: Socks5Phase, len: usize },
}

/// Greeting offering "no auth" and "username/password".
pub(crate) fn hello() -> [u8; 4] {
    [SOCKS5_VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS]
}

/// Username/password sub-negotiation; each field is cut at 255 bytes.
pub(crate) fn auth_request(username: &str, password: &str) -> Vec<u8> {
    let user = &username.as_bytes()[..username.len().min(255)];
    let pass = &password.as_bytes()[..password.len().min(255)];
    let mut buf = Vec::with_capacity(3 + user.len() + pass.len());
    buf.push(AUTH_VERSION);
    buf.push(user.len() as u8);
    buf.extend_from_slice(user);
    buf.push(pass.len() as u8);
    buf.extend_from_slice(pass);
    buf
}

pub(crate) fn connect_request(dst: SocketAddr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(22);
    buf.extend_from_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0]);
    match dst {
        SocketAddr::V4(addr) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&addr.ip().octets());
        }
    }
    buf.extend_from_slice(&dst.port().to_be_bytes());
    buf
}

/// Expected length of a connect reply, from its bound address type.
fn connect_reply_len(reply: &[u8]) -> Option<usize> {
    match *reply.get(3)? {
        ATYP_IPV4 => Some(4 + 4 + 2),
        ATYP_IPV6 => Some(4 + 16 + 2),
        ATYP_DOMAIN => Some(4 + 1 + *reply.get(4)? as usize + 2),
        _ => None,
    }
}

/// Phase reached after receiving `reply` while in `phase`.
pub(crate) fn on_reply(phase: Socks5Phase, reply: &[u8]) -> Result<Socks5Phase, Socks5Error> {
    let unexpected = Socks5Error::UnexpectedReply {
        phase,
        len: reply.len(),
    };
    match (phase, reply) {
        (Socks5Phase::Hello, [SOCKS5_VERSION, method]) => match *method {
            METHOD_NO_AUTH => Ok(Socks5Phase::Connect),
            METHOD_USER_PASS => Ok(Socks5Phase::Auth),
            other => Err(Socks5Error::UnsupportedMethod(other)),
        },
        (Socks5Phase::Auth, [AUTH_VERSION | SOCKS5_VERSION, status]) => match *status {
            0 => Ok(Socks5Phase::Connect),
            other => Err(Socks5Error::AuthRejected(other)),
        },
        (Socks5Phase::Connect, [SOCKS5_VERSION, code, ..])
            if connect_reply_len(reply) == Some(reply.len()) =>
        {
            match *code {
                0 => Ok(Socks5Phase::Connected),
                other => Err(Socks5Error::ConnectRejected(other)),
            }
        }
        _ => Err(unexpected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_encoded() {
        assert_eq!(hello(), [5, 2, 0, 2]);
        assert_eq!(auth_request("bob", "pw"), b"\x01\x03bob\x02pw");
        assert_eq!(
            connect_request("93.184.216.34:443".parse().unwrap()),
            [5, 1, 0, 1, 93, 184, 216, 34, 0x01, 0xbb]
        );
        let v6 = connect_request("[2001:db8::1]:80".parse().unwrap());
        assert_eq!(v6.len(), 22);
        assert_eq!(&v6[..4], &[5, 1, 0, 4]);
        assert_eq!(&v6[20..], &[0, 80]);

        let long = "x".repeat(300);
        assert_eq!(auth_request(&long, "").len(), 2 + 255 + 1);
    }

    #[test]
    fn handshake_without_auth() {
        assert_eq!(on_reply(Socks5Phase::Hello, &[5, 0]), Ok(Socks5Phase::Connect));
        let reply = [5, 0, 0, 1, 127, 0, 0, 1, 0x1f, 0x90];
        assert_eq!(on_reply(Socks5Phase::Connect, &reply), Ok(Socks5Phase::Connected));
    }

    #[test]
    fn handshake_with_auth() {
        assert_eq!(on_reply(Socks5Phase::Hello, &[5, 2]), Ok(Socks5Phase::Auth));
        assert_eq!(on_reply(Socks5Phase::Auth, &[1, 0]), Ok(Socks5Phase::Connect));
        assert_eq!(
            on_reply(Socks5Phase::Auth, &[1, 1]),
            Err(Socks5Error::AuthRejected(1))
        );
    }

    #[test]
    fn connect_reply_length_follows_address_type() {
        let mut v6 = vec![5, 0, 0, 4];
        v6.extend_from_slice(&[0; 18]);
        assert_eq!(on_reply(Socks5Phase::Connect, &v6), Ok(Socks5Phase::Connected));

        let mut domain = vec![5, 0, 0, 3, 4];
        domain.extend_from_slice(b"host");
        domain.extend_from_slice(&[0, 80]);
        assert_eq!(on_reply(Socks5Phase::Connect, &domain), Ok(Socks5Phase::Connected));

        assert!(matches!(
            on_reply(Socks5Phase::Connect, &v6[..10]),
            Err(Socks5Error::UnexpectedReply { len: 10, .. })
        ));
        assert_eq!(
            on_reply(Socks5Phase::Connect, &[5, 5, 0, 1, 0, 0, 0, 0, 0, 0]),
            Err(Socks5Error::ConnectRejected(5))
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(
            on_reply(Socks5Phase::Hello, &[5, 0xff]),
            Err(Socks5Error::UnsupportedMethod(0xff))
        );
        assert!(on_reply(Socks5Phase::Hello, &[4, 0]).is_err());
        assert!(on_reply(Socks5Phase::Hello, &[5, 0, 0]).is_err());
        assert!(on_reply(Socks5Phase::Connected, &[5, 0]).is_err());
    }
}
