//! Handshake message framing and field extraction.

use tls_parser::{
    parse_tls_client_hello_extensions, parse_tls_extensions, parse_tls_plaintext, SNIType,
    TlsExtension, TlsMessage, TlsMessageHandshake, TlsVersion,
};

use crate::error::{Error, Result};

pub const HANDSHAKE_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeType {
    HelloRequest,
    ClientHello,
    ServerHello,
    NewSessionTicket,
    Certificate,
    ServerKeyExchange,
    CertificateRequest,
    ServerHelloDone,
    CertificateVerify,
    ClientKeyExchange,
    Finished,
    CertificateStatus,
}

impl TryFrom<u8> for HandshakeType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => HandshakeType::HelloRequest,
            1 => HandshakeType::ClientHello,
            2 => HandshakeType::ServerHello,
            4 => HandshakeType::NewSessionTicket,
            11 => HandshakeType::Certificate,
            12 => HandshakeType::ServerKeyExchange,
            13 => HandshakeType::CertificateRequest,
            14 => HandshakeType::ServerHelloDone,
            15 => HandshakeType::CertificateVerify,
            16 => HandshakeType::ClientKeyExchange,
            20 => HandshakeType::Finished,
            22 => HandshakeType::CertificateStatus,
            other => return Err(Error::UnsupportedHandshake(other)),
        })
    }
}

impl HandshakeType {
    /// Whether the client (rather than the server) sends this message.
    pub fn sent_by_client(self) -> Option<bool> {
        match self {
            HandshakeType::ClientHello
            | HandshakeType::ClientKeyExchange
            | HandshakeType::CertificateVerify => Some(true),
            HandshakeType::Finished | HandshakeType::Certificate => None,
            _ => Some(false),
        }
    }
}

/// One complete handshake message.
#[derive(Debug)]
pub struct HandshakeMessage {
    pub msg_type: u8,
    /// Header plus body, as hashed into the transcript.
    pub raw: Vec<u8>,
}

impl HandshakeMessage {
    pub fn body(&self) -> &[u8] {
        &self.raw[HANDSHAKE_HEADER_LEN..]
    }
}

/// Reassembles handshake messages that span records (or share one).
#[derive(Debug, Default)]
pub struct HandshakeReader {
    buf: Vec<u8>,
}

impl HandshakeReader {
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn next_message(&mut self, max_len: usize) -> Result<Option<HandshakeMessage>> {
        if self.buf.len() < HANDSHAKE_HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([0, self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > max_len {
            return Err(Error::HandshakeTooLarge { len, max: max_len });
        }
        let total = HANDSHAKE_HEADER_LEN + len;
        if self.buf.len() < total {
            return Ok(None);
        }
        let rest = self.buf.split_off(total);
        let raw = std::mem::replace(&mut self.buf, rest);
        Ok(Some(HandshakeMessage {
            msg_type: raw[0],
            raw,
        }))
    }
}

#[derive(Debug, Default)]
pub struct ClientHelloInfo {
    pub version: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub ticket: Option<Vec<u8>>,
    pub server_name: Option<String>,
    pub extended_master_secret: bool,
}

/// Parse a ClientHello (header included) with tls-parser.
pub fn parse_client_hello(raw: &[u8]) -> Result<ClientHelloInfo> {
    // parse_tls_plaintext expects: type(1) + version(2) + length(2) + body
    if raw.len() > u16::MAX as usize {
        return Err(Error::MalformedHandshake("ClientHello too long to parse"));
    }
    let mut full = Vec::with_capacity(5 + raw.len());
    full.push(0x16);
    full.extend_from_slice(&[0x03, 0x03]);
    full.extend_from_slice(&(raw.len() as u16).to_be_bytes());
    full.extend_from_slice(raw);

    let (_, parsed) =
        parse_tls_plaintext(&full).map_err(|_| Error::MalformedHandshake("ClientHello"))?;
    let ch = parsed
        .msg
        .iter()
        .find_map(|m| match m {
            TlsMessage::Handshake(TlsMessageHandshake::ClientHello(ch)) => Some(ch),
            _ => None,
        })
        .ok_or(Error::MalformedHandshake("ClientHello"))?;

    let mut info = ClientHelloInfo {
        version: ch.version.0,
        ..Default::default()
    };
    if ch.random.len() != 32 {
        return Err(Error::MalformedHandshake("ClientHello random"));
    }
    info.random.copy_from_slice(ch.random);
    info.session_id = ch.session_id.map(|s| s.to_vec()).unwrap_or_default();

    if let Some(ext_data) = ch.ext {
        let (_, exts) = parse_tls_client_hello_extensions(ext_data)
            .map_err(|_| Error::MalformedHandshake("ClientHello extensions"))?;
        for ext in &exts {
            match ext {
                TlsExtension::SNI(names) => {
                    info.server_name = names
                        .iter()
                        .find(|(kind, _)| *kind == SNIType::HostName)
                        .and_then(|(_, name)| std::str::from_utf8(name).ok())
                        .map(|s| s.to_ascii_lowercase());
                }
                TlsExtension::SessionTicket(ticket) if !ticket.is_empty() => {
                    info.ticket = Some(ticket.to_vec());
                }
                TlsExtension::ExtendedMasterSecret => info.extended_master_secret = true,
                _ => {}
            }
        }
    }
    Ok(info)
}

#[derive(Debug)]
pub struct ServerHelloInfo {
    pub version: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suite: u16,
    pub compression: u8,
    pub extended_master_secret: bool,
    pub tls13: bool,
}

/// Parse a ServerHello body.
///
/// version(2) random(32) session_id<0..32> cipher_suite(2) compression(1)
/// [extensions<0..2^16-1>]
pub fn parse_server_hello(body: &[u8]) -> Result<ServerHelloInfo> {
    let err = || Error::MalformedHandshake("ServerHello");
    if body.len() < 2 + 32 + 1 {
        return Err(err());
    }
    let version = u16::from_be_bytes([body[0], body[1]]);
    let mut random = [0u8; 32];
    random.copy_from_slice(&body[2..34]);
    let sid_len = body[34] as usize;
    if sid_len > 32 {
        return Err(err());
    }
    let mut pos = 35 + sid_len;
    if body.len() < pos + 3 {
        return Err(err());
    }
    let session_id = body[35..pos].to_vec();
    let cipher_suite = u16::from_be_bytes([body[pos], body[pos + 1]]);
    let compression = body[pos + 2];
    pos += 3;

    let mut extended_master_secret = false;
    let mut tls13 = false;
    if body.len() >= pos + 2 {
        let ext_len = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
        let ext_data = body.get(pos + 2..pos + 2 + ext_len).ok_or_else(err)?;
        let (_, exts) =
            parse_tls_extensions(ext_data).map_err(|_| Error::MalformedHandshake("ServerHello extensions"))?;
        for ext in &exts {
            match ext {
                TlsExtension::ExtendedMasterSecret => extended_master_secret = true,
                TlsExtension::SupportedVersions(versions) => {
                    tls13 |= versions.contains(&TlsVersion::Tls13);
                }
                _ => {}
            }
        }
    }

    Ok(ServerHelloInfo {
        version,
        random,
        session_id,
        cipher_suite,
        compression,
        extended_master_secret,
        tls13,
    })
}

/// The RSA-encrypted pre-master secret from a ClientKeyExchange body.
/// TLS carries a 2-byte length prefix; some SSLv3-era stacks omit it.
pub fn client_key_exchange_payload(body: &[u8]) -> &[u8] {
    if body.len() >= 2 {
        let declared = u16::from_be_bytes([body[0], body[1]]) as usize;
        if declared == body.len() - 2 {
            return &body[2..];
        }
    }
    body
}

/// The opaque ticket from a NewSessionTicket body:
/// lifetime_hint(4) ticket<0..2^16-1>.
pub fn parse_new_session_ticket(body: &[u8]) -> Result<&[u8]> {
    if body.len() < 6 {
        return Err(Error::MalformedHandshake("NewSessionTicket"));
    }
    let len = u16::from_be_bytes([body[4], body[5]]) as usize;
    body.get(6..6 + len)
        .ok_or(Error::MalformedHandshake("NewSessionTicket"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn handshake(msg_type: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![msg_type];
        out.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        out.extend_from_slice(body);
        out
    }

    /// ClientHello with optional session id, SNI, ticket and EMS extensions.
    pub(crate) fn client_hello(
        random: &[u8; 32],
        session_id: &[u8],
        sni: Option<&str>,
        ticket: Option<&[u8]>,
        ems: bool,
    ) -> Vec<u8> {
        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(random);
        body.push(session_id.len() as u8);
        body.extend_from_slice(session_id);
        body.extend_from_slice(&[0x00, 0x04, 0x00, 0x9C, 0x00, 0x2F]);
        body.extend_from_slice(&[0x01, 0x00]);
        let mut exts = Vec::new();
        if let Some(name) = sni {
            let mut list = vec![0x00];
            list.extend_from_slice(&(name.len() as u16).to_be_bytes());
            list.extend_from_slice(name.as_bytes());
            exts.extend_from_slice(&[0x00, 0x00]);
            exts.extend_from_slice(&((list.len() + 2) as u16).to_be_bytes());
            exts.extend_from_slice(&(list.len() as u16).to_be_bytes());
            exts.extend_from_slice(&list);
        }
        if let Some(t) = ticket {
            exts.extend_from_slice(&[0x00, 0x23]);
            exts.extend_from_slice(&(t.len() as u16).to_be_bytes());
            exts.extend_from_slice(t);
        }
        if ems {
            exts.extend_from_slice(&[0x00, 0x17, 0x00, 0x00]);
        }
        if !exts.is_empty() {
            body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
            body.extend_from_slice(&exts);
        }
        handshake(1, &body)
    }

    pub(crate) fn server_hello(
        random: &[u8; 32],
        session_id: &[u8],
        suite: u16,
        version: u16,
        ems: bool,
    ) -> Vec<u8> {
        let mut body = version.to_be_bytes().to_vec();
        body.extend_from_slice(random);
        body.push(session_id.len() as u8);
        body.extend_from_slice(session_id);
        body.extend_from_slice(&suite.to_be_bytes());
        body.push(0);
        if ems {
            body.extend_from_slice(&[0x00, 0x04, 0x00, 0x17, 0x00, 0x00]);
        }
        handshake(2, &body)
    }

    #[test]
    fn reader_splits_and_joins_messages() {
        let a = handshake(14, &[]);
        let b = handshake(11, &[0, 0, 0]);
        let mut joined = a.clone();
        joined.extend_from_slice(&b);

        let mut r = HandshakeReader::default();
        r.push(&joined[..5]);
        let first = r.next_message(1024).unwrap().unwrap();
        assert_eq!(first.msg_type, 14);
        assert!(first.body().is_empty());
        assert!(r.next_message(1024).unwrap().is_none());
        r.push(&joined[5..]);
        let second = r.next_message(1024).unwrap().unwrap();
        assert_eq!(second.raw, b);
        assert!(r.is_empty());
    }

    #[test]
    fn reader_rejects_oversized_message() {
        let mut r = HandshakeReader::default();
        r.push(&[1, 0x01, 0x00, 0x00]);
        assert!(matches!(
            r.next_message(1024),
            Err(Error::HandshakeTooLarge { len: 65536, max: 1024 })
        ));
    }

    #[test]
    fn handshake_types() {
        assert_eq!(HandshakeType::try_from(16).unwrap(), HandshakeType::ClientKeyExchange);
        assert!(matches!(HandshakeType::try_from(99), Err(Error::UnsupportedHandshake(99))));
        assert_eq!(HandshakeType::ClientHello.sent_by_client(), Some(true));
        assert_eq!(HandshakeType::ServerHelloDone.sent_by_client(), Some(false));
        assert_eq!(HandshakeType::Finished.sent_by_client(), None);
    }

    #[test]
    fn client_hello_fields() {
        let raw = client_hello(&[9; 32], &[5; 32], Some("Example.COM"), Some(b"tkt"), true);
        let info = parse_client_hello(&raw).unwrap();
        assert_eq!(info.random, [9; 32]);
        assert_eq!(info.session_id, vec![5; 32]);
        assert_eq!(info.server_name.as_deref(), Some("example.com"));
        assert_eq!(info.ticket.as_deref(), Some(&b"tkt"[..]));
        assert!(info.extended_master_secret);
    }

    #[test]
    fn client_hello_without_extensions() {
        let raw = client_hello(&[1; 32], &[], None, None, false);
        let info = parse_client_hello(&raw).unwrap();
        assert!(info.session_id.is_empty());
        assert!(info.server_name.is_none());
        assert!(!info.extended_master_secret);
        assert!(parse_client_hello(&raw[..20]).is_err());
    }

    #[test]
    fn server_hello_fields() {
        let raw = server_hello(&[2; 32], &[7; 16], 0x009C, 0x0303, true);
        let info = parse_server_hello(&raw[4..]).unwrap();
        assert_eq!(info.random, [2; 32]);
        assert_eq!(info.session_id, vec![7; 16]);
        assert_eq!(info.cipher_suite, 0x009C);
        assert_eq!(info.compression, 0);
        assert!(info.extended_master_secret);
        assert!(!info.tls13);
        assert!(parse_server_hello(&raw[4..30]).is_err());
    }

    #[test]
    fn key_exchange_and_ticket_bodies() {
        assert_eq!(client_key_exchange_payload(&[0, 3, 1, 2, 3]), &[1, 2, 3]);
        assert_eq!(client_key_exchange_payload(&[9, 9, 1]), &[9, 9, 1]);
        let nst = [0, 0, 0x1c, 0x20, 0, 3, b'a', b'b', b'c'];
        assert_eq!(parse_new_session_ticket(&nst).unwrap(), b"abc");
        assert!(parse_new_session_ticket(&nst[..7]).is_err());
    }
}
