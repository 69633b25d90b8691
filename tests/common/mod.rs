//! Helpers shared by the integration tests: TCP frame construction, a
//! sending-side TLS record sealer and scripted RSA handshakes.

#![allow(dead_code)]

use std::path::Path;
use std::sync::OnceLock;

use etherparse::PacketBuilder;
use openssl::rsa::{Padding, Rsa};
use openssl::symm::{Cipher, Crypter, Mode};
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::hmac;

use tlstap::tls::kdf;
use tlstap::tls::suites::{self, BulkCipher, CipherSuite, MacAlgorithm, ProtocolVersion};

pub const CLIENT: [u8; 4] = [10, 0, 0, 1];
pub const SERVER: [u8; 4] = [10, 0, 0, 2];
pub const SERVER_PORT: u16 = 443;

pub fn server_ip() -> std::net::IpAddr {
    std::net::IpAddr::from(SERVER)
}

/// PEM of a throwaway RSA key, generated once per test binary.
pub fn key_pem() -> Vec<u8> {
    static PEM: OnceLock<Vec<u8>> = OnceLock::new();
    PEM.get_or_init(fresh_key_pem).clone()
}

pub fn fresh_key_pem() -> Vec<u8> {
    Rsa::generate(1024).unwrap().private_key_to_pem().unwrap()
}

// =============================================================================
// TCP
// =============================================================================

#[derive(Default, Clone, Copy)]
pub struct Flags {
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
}

#[allow(clippy::too_many_arguments)]
pub fn tcp_frame(
    src: [u8; 4],
    sport: u16,
    dst: [u8; 4],
    dport: u16,
    seq: u32,
    ack: Option<u32>,
    flags: Flags,
    payload: &[u8],
) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1])
        .ipv4(src, dst, 64)
        .tcp(sport, dport, seq, 65535);
    let builder = if flags.syn { builder.syn() } else { builder };
    let builder = if flags.fin { builder.fin() } else { builder };
    let builder = if flags.rst { builder.rst() } else { builder };
    let builder = match ack {
        Some(n) => builder.ack(n),
        None => builder,
    };
    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut out, payload).unwrap();
    out
}

/// Tracks both directions' next sequence numbers of one connection so
/// every generated segment carries consistent seq/ack values.
pub struct Flow {
    pub client_port: u16,
    c_isn: u32,
    s_isn: u32,
    pub c_next: u32,
    pub s_next: u32,
}

impl Flow {
    pub fn new(client_port: u16) -> Self {
        Self::with_isn(client_port, 1_000 + u32::from(client_port), 90_000)
    }

    pub fn with_isn(client_port: u16, c_isn: u32, s_isn: u32) -> Self {
        Flow {
            client_port,
            c_isn,
            s_isn,
            c_next: c_isn.wrapping_add(1),
            s_next: s_isn.wrapping_add(1),
        }
    }

    pub fn syn(&self) -> Vec<u8> {
        let flags = Flags { syn: true, ..Default::default() };
        tcp_frame(CLIENT, self.client_port, SERVER, SERVER_PORT, self.c_isn, None, flags, &[])
    }

    pub fn syn_ack(&self) -> Vec<u8> {
        let flags = Flags { syn: true, ..Default::default() };
        tcp_frame(
            SERVER,
            SERVER_PORT,
            CLIENT,
            self.client_port,
            self.s_isn,
            Some(self.c_isn.wrapping_add(1)),
            flags,
            &[],
        )
    }

    pub fn client(&mut self, payload: &[u8]) -> Vec<u8> {
        let frame = self.client_at(self.c_next, payload);
        self.c_next = self.c_next.wrapping_add(payload.len() as u32);
        frame
    }

    pub fn server(&mut self, payload: &[u8]) -> Vec<u8> {
        let frame = self.server_at(self.s_next, payload);
        self.s_next = self.s_next.wrapping_add(payload.len() as u32);
        frame
    }

    pub fn client_at(&self, seq: u32, payload: &[u8]) -> Vec<u8> {
        tcp_frame(
            CLIENT,
            self.client_port,
            SERVER,
            SERVER_PORT,
            seq,
            Some(self.s_next),
            Flags::default(),
            payload,
        )
    }

    pub fn server_at(&self, seq: u32, payload: &[u8]) -> Vec<u8> {
        tcp_frame(
            SERVER,
            SERVER_PORT,
            CLIENT,
            self.client_port,
            seq,
            Some(self.c_next),
            Flags::default(),
            payload,
        )
    }

    /// Client bytes that were sent but never captured.
    pub fn lose_client(&mut self, len: usize) {
        self.c_next = self.c_next.wrapping_add(len as u32);
    }

    /// Pure ACK from the server for everything the client sent.
    pub fn server_ack(&self) -> Vec<u8> {
        self.server_at(self.s_next, &[])
    }

    /// Split `payload` into `parts` client segments without sending them in
    /// order; the caller decides delivery order.
    pub fn client_segments(&mut self, payload: &[u8], parts: usize) -> Vec<Vec<u8>> {
        let size = payload.len().div_ceil(parts);
        let frames = payload
            .chunks(size)
            .enumerate()
            .map(|(i, chunk)| self.client_at(self.c_next.wrapping_add((i * size) as u32), chunk))
            .collect();
        self.c_next = self.c_next.wrapping_add(payload.len() as u32);
        frames
    }

    pub fn client_fin(&mut self) -> Vec<u8> {
        let flags = Flags { fin: true, ..Default::default() };
        let frame = tcp_frame(
            CLIENT,
            self.client_port,
            SERVER,
            SERVER_PORT,
            self.c_next,
            Some(self.s_next),
            flags,
            &[],
        );
        self.c_next = self.c_next.wrapping_add(1);
        frame
    }

    pub fn server_fin(&mut self) -> Vec<u8> {
        let flags = Flags { fin: true, ..Default::default() };
        let frame = tcp_frame(
            SERVER,
            SERVER_PORT,
            CLIENT,
            self.client_port,
            self.s_next,
            Some(self.c_next),
            flags,
            &[],
        );
        self.s_next = self.s_next.wrapping_add(1);
        frame
    }
}

// =============================================================================
// TLS
// =============================================================================

pub fn handshake_msg(msg_type: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![msg_type];
    out.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    out.extend_from_slice(body);
    out
}

pub fn record(content_type: u8, version: u16, body: &[u8]) -> Vec<u8> {
    let mut out = vec![content_type];
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
    out
}

pub fn client_hello(
    version: u16,
    random: &[u8; 32],
    session_id: &[u8],
    suite: u16,
    sni: Option<&str>,
    ticket: Option<&[u8]>,
    ems: bool,
) -> Vec<u8> {
    let mut body = version.to_be_bytes().to_vec();
    body.extend_from_slice(random);
    body.push(session_id.len() as u8);
    body.extend_from_slice(session_id);
    body.extend_from_slice(&[0x00, 0x02]);
    body.extend_from_slice(&suite.to_be_bytes());
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
    handshake_msg(1, &body)
}

pub fn server_hello(version: u16, random: &[u8; 32], session_id: &[u8], suite: u16, ems: bool) -> Vec<u8> {
    let mut body = version.to_be_bytes().to_vec();
    body.extend_from_slice(random);
    body.push(session_id.len() as u8);
    body.extend_from_slice(session_id);
    body.extend_from_slice(&suite.to_be_bytes());
    body.push(0);
    if ems {
        body.extend_from_slice(&[0x00, 0x04, 0x00, 0x17, 0x00, 0x00]);
    }
    handshake_msg(2, &body)
}

fn additional_data(seq: u64, content_type: u8, version: u16, len: usize) -> [u8; 13] {
    let mut ad = [0u8; 13];
    ad[..8].copy_from_slice(&seq.to_be_bytes());
    ad[8] = content_type;
    ad[9..11].copy_from_slice(&version.to_be_bytes());
    ad[11..].copy_from_slice(&(len as u16).to_be_bytes());
    ad
}

/// Sending side of one direction: protects records the way a TLS peer would.
pub struct Sealer {
    suite: &'static CipherSuite,
    version: ProtocolVersion,
    mac_key: Vec<u8>,
    key: Vec<u8>,
    iv: Vec<u8>,
    pub seq: u64,
}

impl Sealer {
    fn new(suite: &'static CipherSuite, version: ProtocolVersion, mac_key: &[u8], key: &[u8], iv: &[u8]) -> Self {
        Sealer {
            suite,
            version,
            mac_key: mac_key.to_vec(),
            key: key.to_vec(),
            iv: iv.to_vec(),
            seq: 0,
        }
    }

    /// Protect `plaintext` and return the complete record.
    pub fn seal(&mut self, content_type: u8, plaintext: &[u8]) -> Vec<u8> {
        let fragment = if self.suite.bulk.is_aead() {
            self.seal_gcm(content_type, plaintext)
        } else {
            self.seal_cbc(content_type, plaintext)
        };
        self.seq += 1;
        record(content_type, self.version.wire(), &fragment)
    }

    fn seal_gcm(&self, content_type: u8, plaintext: &[u8]) -> Vec<u8> {
        let alg = if self.key.len() == 16 {
            &aead::AES_128_GCM
        } else {
            &aead::AES_256_GCM
        };
        let key = LessSafeKey::new(UnboundKey::new(alg, &self.key).unwrap());
        let explicit = self.seq.to_be_bytes();
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.iv);
        nonce[4..].copy_from_slice(&explicit);
        let ad = additional_data(self.seq, content_type, self.version.wire(), plaintext.len());
        let mut buf = plaintext.to_vec();
        key.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::from(ad), &mut buf)
            .unwrap();
        let mut fragment = explicit.to_vec();
        fragment.extend_from_slice(&buf);
        fragment
    }

    fn seal_cbc(&mut self, content_type: u8, plaintext: &[u8]) -> Vec<u8> {
        let (cipher, block) = match self.suite.bulk {
            BulkCipher::TripleDesCbc => (Cipher::des_ede3_cbc(), 8),
            BulkCipher::Aes128Cbc => (Cipher::aes_128_cbc(), 16),
            BulkCipher::Aes256Cbc => (Cipher::aes_256_cbc(), 16),
            other => panic!("{:?} is not a CBC cipher", other),
        };
        let mac_alg = match self.suite.mac {
            Some(MacAlgorithm::Sha1) => hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            Some(MacAlgorithm::Sha256) => hmac::HMAC_SHA256,
            Some(MacAlgorithm::Sha384) => hmac::HMAC_SHA384,
            None => panic!("CBC suite without MAC"),
        };
        let mac_key = hmac::Key::new(mac_alg, &self.mac_key);
        let mut ctx = hmac::Context::with_key(&mac_key);
        ctx.update(&additional_data(self.seq, content_type, self.version.wire(), plaintext.len()));
        ctx.update(plaintext);

        let mut data = plaintext.to_vec();
        data.extend_from_slice(ctx.sign().as_ref());
        let pad = (block - (data.len() + 1) % block) % block;
        data.extend(std::iter::repeat(pad as u8).take(pad + 1));

        let chained = self.version == ProtocolVersion::Tls10;
        let iv = if chained {
            self.iv.clone()
        } else {
            vec![(self.seq as u8) ^ 0xA5; block]
        };
        let mut crypter = Crypter::new(cipher, Mode::Encrypt, &self.key, Some(&iv)).unwrap();
        crypter.pad(false);
        let mut out = vec![0u8; data.len() + block];
        let mut n = crypter.update(&data, &mut out).unwrap();
        n += crypter.finalize(&mut out[n..]).unwrap();
        out.truncate(n);

        if chained {
            self.iv = out[out.len() - block..].to_vec();
            out
        } else {
            let mut fragment = iv;
            fragment.extend_from_slice(&out);
            fragment
        }
    }
}

#[derive(Clone, Copy)]
pub struct HandshakeOptions<'a> {
    pub suite: u16,
    pub version: ProtocolVersion,
    /// Session ID the server assigns (empty: none).
    pub session_id: &'a [u8],
    pub sni: Option<&'a str>,
    pub ems: bool,
    /// Ticket the server issues in a NewSessionTicket before its
    /// ChangeCipherSpec.
    pub ticket: Option<&'a [u8]>,
}

impl Default for HandshakeOptions<'_> {
    fn default() -> Self {
        HandshakeOptions {
            suite: 0x009C,
            version: ProtocolVersion::Tls12,
            session_id: &[],
            sni: None,
            ems: false,
            ticket: None,
        }
    }
}

/// A completed scripted handshake: the frames to feed and both peers'
/// sealers, ready for application data.
pub struct Negotiated {
    pub frames: Vec<Vec<u8>>,
    pub client: Sealer,
    pub server: Sealer,
    pub suite: u16,
    pub version: ProtocolVersion,
    pub master: Vec<u8>,
    pub session_id: Vec<u8>,
    pub ticket: Option<Vec<u8>>,
}

fn random(tag: u8, port: u16) -> [u8; 32] {
    let mut r = [tag; 32];
    r[..2].copy_from_slice(&port.to_be_bytes());
    r
}

fn sealers(
    suite: &'static CipherSuite,
    version: ProtocolVersion,
    master: &[u8],
    cr: &[u8; 32],
    sr: &[u8; 32],
) -> (Sealer, Sealer) {
    let kb = kdf::key_block(version, suite, master, cr, sr).unwrap();
    (
        Sealer::new(suite, version, &kb.client_mac, &kb.client_key, &kb.client_iv),
        Sealer::new(suite, version, &kb.server_mac, &kb.server_key, &kb.server_iv),
    )
}

/// Full RSA handshake: SYN, SYN-ACK, ClientHello, ServerHello + Certificate
/// + ServerHelloDone, ClientKeyExchange + CCS + Finished, CCS + Finished.
pub fn full_handshake(flow: &mut Flow, pem: &[u8], opts: &HandshakeOptions<'_>) -> Negotiated {
    let suite = suites::lookup(opts.suite).unwrap();
    let version = opts.version;
    let wire = version.wire();
    let cr = random(0x11, flow.client_port);
    let sr = random(0x22, flow.client_port);

    // A client able to receive a ticket offers the empty extension.
    let offer = opts.ticket.map(|_| &[][..]);
    let ch = client_hello(wire, &cr, &[], opts.suite, opts.sni, offer, opts.ems);
    let sh = server_hello(wire, &sr, opts.session_id, opts.suite, opts.ems);
    let cert = handshake_msg(11, &[0, 0, 0]);
    let done = handshake_msg(14, &[]);

    let mut pre_master = vec![0x03, 0x03];
    pre_master.extend_from_slice(&[0x5A; 46]);
    let rsa = Rsa::private_key_from_pem(pem).unwrap();
    let mut encrypted = vec![0u8; rsa.size() as usize];
    let n = rsa
        .public_encrypt(&pre_master, &mut encrypted, Padding::PKCS1)
        .unwrap();
    encrypted.truncate(n);
    let mut cke_body = (encrypted.len() as u16).to_be_bytes().to_vec();
    cke_body.extend_from_slice(&encrypted);
    let cke = handshake_msg(16, &cke_body);

    let mut transcript = [ch.clone(), sh.clone(), cert.clone(), done.clone(), cke.clone()].concat();
    let master = if opts.ems {
        kdf::extended_master_secret(version, suite, &pre_master, &transcript)
    } else {
        kdf::master_secret(version, suite, &pre_master, &cr, &sr)
    }
    .unwrap()
    .to_vec();
    let (mut client, mut server) = sealers(suite, version, &master, &cr, &sr);

    let cfin = handshake_msg(
        20,
        &kdf::finished_verify_data(version, suite, &master, b"client finished", &transcript).unwrap(),
    );
    transcript.extend_from_slice(&cfin);
    let nst = opts.ticket.map(new_session_ticket);
    if let Some(nst) = &nst {
        transcript.extend_from_slice(nst);
    }
    let sfin = handshake_msg(
        20,
        &kdf::finished_verify_data(version, suite, &master, b"server finished", &transcript).unwrap(),
    );

    let mut frames = vec![flow.syn(), flow.syn_ack()];
    frames.push(flow.client(&record(22, wire, &ch)));
    frames.push(flow.server(&record(22, wire, &[sh, cert, done].concat())));
    let mut client_flight = record(22, wire, &cke);
    client_flight.extend(record(20, wire, &[1]));
    client_flight.extend(client.seal(22, &cfin));
    frames.push(flow.client(&client_flight));
    let mut server_flight = nst.map(|m| record(22, wire, &m)).unwrap_or_default();
    server_flight.extend(record(20, wire, &[1]));
    server_flight.extend(server.seal(22, &sfin));
    frames.push(flow.server(&server_flight));

    Negotiated {
        frames,
        client,
        server,
        suite: opts.suite,
        version,
        master,
        session_id: opts.session_id.to_vec(),
        ticket: opts.ticket.map(<[u8]>::to_vec),
    }
}

fn new_session_ticket(ticket: &[u8]) -> Vec<u8> {
    let mut body = 7200u32.to_be_bytes().to_vec();
    body.extend_from_slice(&(ticket.len() as u16).to_be_bytes());
    body.extend_from_slice(ticket);
    handshake_msg(4, &body)
}

/// Abbreviated handshake resuming `prev` by session ID on a new connection.
pub fn resumed_handshake(flow: &mut Flow, prev: &Negotiated) -> Negotiated {
    resume(flow, prev, &prev.session_id, None)
}

/// Abbreviated handshake resuming `prev` with the ticket it was issued. The
/// client sends a fresh `session_id` next to the ticket and the server
/// echoes it to accept.
pub fn ticket_handshake(flow: &mut Flow, prev: &Negotiated, session_id: &[u8]) -> Negotiated {
    let ticket = prev.ticket.as_deref().expect("no ticket issued");
    resume(flow, prev, session_id, Some(ticket))
}

fn resume(flow: &mut Flow, prev: &Negotiated, session_id: &[u8], ticket: Option<&[u8]>) -> Negotiated {
    let suite = suites::lookup(prev.suite).unwrap();
    let version = prev.version;
    let wire = version.wire();
    let cr = random(0x33, flow.client_port);
    let sr = random(0x44, flow.client_port);

    let ch = client_hello(wire, &cr, session_id, prev.suite, None, ticket, false);
    let sh = server_hello(wire, &sr, session_id, prev.suite, false);
    let mut transcript = [ch.clone(), sh.clone()].concat();
    let (mut client, mut server) = sealers(suite, version, &prev.master, &cr, &sr);

    let sfin = handshake_msg(
        20,
        &kdf::finished_verify_data(version, suite, &prev.master, b"server finished", &transcript).unwrap(),
    );
    transcript.extend_from_slice(&sfin);
    let cfin = handshake_msg(
        20,
        &kdf::finished_verify_data(version, suite, &prev.master, b"client finished", &transcript).unwrap(),
    );

    let mut frames = vec![flow.syn(), flow.syn_ack()];
    frames.push(flow.client(&record(22, wire, &ch)));
    let mut server_flight = record(22, wire, &sh);
    server_flight.extend(record(20, wire, &[1]));
    server_flight.extend(server.seal(22, &sfin));
    frames.push(flow.server(&server_flight));
    let mut client_flight = record(20, wire, &[1]);
    client_flight.extend(client.seal(22, &cfin));
    frames.push(flow.client(&client_flight));

    Negotiated {
        frames,
        client,
        server,
        suite: prev.suite,
        version,
        master: prev.master.clone(),
        session_id: session_id.to_vec(),
        ticket: ticket.map(<[u8]>::to_vec),
    }
}

// =============================================================================
// Pcap
// =============================================================================

pub fn write_pcap(path: &Path, frames: &[Vec<u8>]) {
    let mut data = Vec::new();
    data.extend_from_slice(&0xa1b2c3d4u32.to_le_bytes());
    data.extend_from_slice(&2u16.to_le_bytes());
    data.extend_from_slice(&4u16.to_le_bytes());
    data.extend_from_slice(&0i32.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(&65535u32.to_le_bytes());
    data.extend_from_slice(&1u32.to_le_bytes());
    for (i, frame) in frames.iter().enumerate() {
        let len = frame.len() as u32;
        data.extend_from_slice(&(1_700_000_000u32 + i as u32).to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(frame);
    }
    std::fs::write(path, &data).unwrap();
}
