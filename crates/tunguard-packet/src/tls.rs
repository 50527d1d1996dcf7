//! Server Name Indication extraction from a TLS ClientHello.
//!
//! The parser only looks at the first record of the stream and never decrypts anything. Every
//! failure is reported as "no name"; an incomplete or unusual ClientHello is not an error.

use super::read_u16;

pub const TLS_CONTENT_HANDSHAKE: u8 = 22;
pub const TLS_HANDSHAKE_CLIENT_HELLO: u8 = 1;
pub const TLS_EXTENSION_SERVER_NAME: u16 = 0;
const SNI_HOST_NAME: u8 = 0;

/// Record header (5) + handshake header (4) + client version (2) + random (32).
const SESSION_ID_OFFSET: usize = 43;

/// Returns the host name carried in the ServerName extension of a ClientHello, if any.
pub fn client_hello_server_name(record: &[u8]) -> Option<&str> {
    if record.len() < 6 || record[0] != TLS_CONTENT_HANDSHAKE {
        return None;
    }
    if record[1] < 3 || record[5] != TLS_HANDSHAKE_CLIENT_HELLO {
        return None;
    }

    let mut off = SESSION_ID_OFFSET;
    let session_id_len = *record.get(off)? as usize;
    off += 1 + session_id_len;

    let cipher_suites_len = read_u16(record, off).ok()? as usize;
    off += 2 + cipher_suites_len;

    let compression_len = *record.get(off)? as usize;
    off += 1 + compression_len;

    let extensions_len = read_u16(record, off).ok()? as usize;
    off += 2;
    let extensions_end = off.checked_add(extensions_len)?.min(record.len());

    while off + 4 <= extensions_end {
        let ext_type = read_u16(record, off).ok()?;
        let ext_len = read_u16(record, off + 2).ok()? as usize;
        let body = off + 4;
        if ext_type == TLS_EXTENSION_SERVER_NAME {
            return server_name_from_extension(record.get(body..body.checked_add(ext_len)?)?);
        }
        off = body + ext_len;
    }
    None
}

fn server_name_from_extension(ext: &[u8]) -> Option<&str> {
    let list_len = read_u16(ext, 0).ok()? as usize;
    let list = ext.get(2..2 + list_len)?;
    let mut off = 0;
    while off + 3 <= list.len() {
        let name_type = list[off];
        let name_len = read_u16(list, off + 1).ok()? as usize;
        let name = list.get(off + 3..off + 3 + name_len)?;
        if name_type == SNI_HOST_NAME {
            return core::str::from_utf8(name).ok().filter(|name| !name.is_empty());
        }
        off += 3 + name_len;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extension(ext_type: u16, body: &[u8]) -> Vec<u8> {
        let mut out = ext_type.to_be_bytes().to_vec();
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn sni_body(name: &str) -> Vec<u8> {
        let mut entry = vec![SNI_HOST_NAME];
        entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
        entry.extend_from_slice(name.as_bytes());
        let mut body = (entry.len() as u16).to_be_bytes().to_vec();
        body.extend_from_slice(&entry);
        body
    }

    fn client_hello(extensions: &[Vec<u8>]) -> Vec<u8> {
        let mut hello = vec![3, 3];
        hello.extend_from_slice(&[0x11; 32]);
        hello.push(32);
        hello.extend_from_slice(&[0x22; 32]);
        hello.extend_from_slice(&4u16.to_be_bytes());
        hello.extend_from_slice(&[0x13, 0x01, 0x13, 0x02]);
        hello.extend_from_slice(&[1, 0]);
        let exts: Vec<u8> = extensions.concat();
        hello.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        hello.extend_from_slice(&exts);

        let mut handshake = vec![TLS_HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&hello);

        let mut record = vec![TLS_CONTENT_HANDSHAKE, 3, 1];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn finds_sni_after_other_extensions() {
        let record = client_hello(&[
            extension(0x000b, &[3, 0, 1, 2]),
            extension(0x000a, &[0, 4, 0, 0x1d, 0, 0x17]),
            extension(TLS_EXTENSION_SERVER_NAME, &sni_body("www.example.org")),
        ]);
        assert_eq!(client_hello_server_name(&record), Some("www.example.org"));
    }

    #[test]
    fn no_sni_extension() {
        let record = client_hello(&[extension(0x0017, &[])]);
        assert_eq!(client_hello_server_name(&record), None);
    }

    #[test]
    fn truncated_hello_yields_none() {
        let record = client_hello(&[extension(
            TLS_EXTENSION_SERVER_NAME,
            &sni_body("truncated.example"),
        )]);
        for cut in [6, 40, 60, 90, record.len() - 3] {
            assert_eq!(client_hello_server_name(&record[..cut]), None, "cut at {cut}");
        }
    }

    #[test]
    fn non_handshake_records_are_ignored() {
        let mut record = client_hello(&[extension(
            TLS_EXTENSION_SERVER_NAME,
            &sni_body("a.example"),
        )]);
        record[0] = 23;
        assert_eq!(client_hello_server_name(&record), None);
        assert_eq!(client_hello_server_name(b"GET / HTTP/1.1\r\n"), None);
    }
}
