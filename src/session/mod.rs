//! One tracked TCP flow carrying TLS.
//!
//! A [`Session`] owns both directions' reassembly state, record framing and
//! handshake buffers, and the two [`TlsEngine`] views. Per-packet work runs
//! with the session's own lock held; the table lock is never needed here.

pub mod table;

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::protocol::{normalize_ip, Direction, PacketInfo, SessionKey};
use crate::reassembly::{Adjusted, Budget, StreamReassembly};
use crate::registry::{PrivateKey, ServerProfile};
use crate::tls::cache::{CacheKey, CachedSession, SessionCache};
use crate::tls::engine::{EngineFactory, SecretSource, TlsEngine};
use crate::tls::handshake::{
    client_key_exchange_payload, parse_client_hello, parse_new_session_ticket,
    parse_server_hello, HandshakeMessage, HandshakeReader, HandshakeType,
};
use crate::tls::suites::ProtocolVersion;
use crate::tls::{is_record_boundary, ContentType, Record, RecordReader};

/// Engine-wide settings and shared state a packet needs while it holds the
/// session lock.
pub struct PacketContext<'a> {
    pub recovery: bool,
    pub max_reassembly: Option<usize>,
    pub max_record_len: usize,
    pub max_handshake_len: usize,
    pub cache: &'a SessionCache,
    pub now: SystemTime,
}

/// What one packet produced.
#[derive(Debug, Default)]
pub struct PacketOutcome {
    /// Decrypted application data in delivery order.
    pub chunks: Vec<(Direction, Vec<u8>)>,
    /// Two terminal events (FIN/RST) have been seen; the session is done.
    pub closed: bool,
    /// An ack fault was absorbed by jumping the peer's stream forward.
    pub ack_fault: bool,
    /// Stream bytes given up while handling this packet.
    pub missed_bytes: u64,
}

impl PacketOutcome {
    fn push(&mut self, dir: Direction, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        match self.chunks.last_mut() {
            Some((last_dir, last)) if *last_dir == dir => last.extend_from_slice(&data),
            _ => self.chunks.push((dir, data)),
        }
    }
}

#[derive(Debug, Default)]
struct DirectionState {
    reassembly: StreamReassembly,
    records: RecordReader,
    handshake: HandshakeReader,
    cipher_on: bool,
    records_seen: u64,
    records_skipped: u64,
}

#[derive(Default)]
struct HandshakeState {
    client_hello_seen: bool,
    client_random: Option<[u8; 32]>,
    server_random: Option<[u8; 32]>,
    client_session_id: Vec<u8>,
    server_session_id: Vec<u8>,
    offered_ticket: Option<Vec<u8>>,
    server_name: Option<String>,
    key: Option<Arc<PrivateKey>>,
    client_ems: bool,
    ems: bool,
    suite: u16,
    version: u16,
    resumed: bool,
    transcript: Vec<u8>,
    finished: [bool; 2],
}

pub struct Session {
    key: SessionKey,
    client: (IpAddr, u16),
    server: (IpAddr, u16),
    profile: Arc<ServerProfile>,
    dirs: [DirectionState; 2],
    engines: [Box<dyn TlsEngine>; 2],
    hs: HandshakeState,
    terminal_events: u32,
    fatal: Option<String>,
    decryptable: bool,
    buffered: Arc<AtomicUsize>,
}

impl Session {
    pub fn new(
        key: SessionKey,
        client: (IpAddr, u16),
        server: (IpAddr, u16),
        profile: Arc<ServerProfile>,
        factory: EngineFactory,
        buffered: Arc<AtomicUsize>,
    ) -> Self {
        let hs = HandshakeState {
            key: profile.key_for(None),
            ..Default::default()
        };
        Session {
            key,
            client: (normalize_ip(client.0), client.1),
            server: (normalize_ip(server.0), server.1),
            profile,
            dirs: Default::default(),
            engines: [
                factory(Direction::ClientToServer),
                factory(Direction::ServerToClient),
            ],
            hs,
            terminal_events: 0,
            fatal: None,
            decryptable: true,
            buffered,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn client(&self) -> (IpAddr, u16) {
        self.client
    }

    pub fn server(&self) -> (IpAddr, u16) {
        self.server
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }

    pub fn fatal_reason(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    /// False once the session is tracked for structure only.
    pub fn is_decryptable(&self) -> bool {
        self.decryptable
    }

    pub fn server_name(&self) -> Option<&str> {
        self.hs.server_name.as_deref()
    }

    pub fn is_resumed(&self) -> bool {
        self.hs.resumed
    }

    pub fn terminal_events(&self) -> u32 {
        self.terminal_events
    }

    pub fn buffered_bytes(&self) -> usize {
        self.dirs.iter().map(|d| d.reassembly.buffered()).sum()
    }

    /// Bytes both directions have given up to ack-fault jumps and record
    /// resynchronization.
    pub fn missed_bytes(&self) -> u64 {
        self.dirs.iter().map(|d| d.reassembly.missed_bytes()).sum()
    }

    /// Counter the session publishes its buffered byte count to after each
    /// packet, readable without taking the session lock.
    pub fn buffered_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.buffered)
    }

    pub fn records_seen(&self, dir: Direction) -> u64 {
        self.dirs[dir.index()].records_seen
    }

    pub fn records_skipped(&self, dir: Direction) -> u64 {
        self.dirs[dir.index()].records_skipped
    }

    pub fn direction_of(&self, src: IpAddr, src_port: u16) -> Direction {
        if (normalize_ip(src), src_port) == self.client {
            Direction::ClientToServer
        } else {
            Direction::ServerToClient
        }
    }

    /// Feed one packet. A fatal error flags the session; the packet after
    /// that gets `Error::SessionFatal` and the caller evicts the session.
    pub fn on_packet(&mut self, pkt: &PacketInfo<'_>, ctx: &PacketContext<'_>) -> Result<PacketOutcome> {
        if let Some(reason) = &self.fatal {
            return Err(Error::SessionFatal(reason.clone()));
        }
        let mut out = PacketOutcome::default();
        let missed_before = self.missed_bytes();
        let result = self.process(pkt, ctx, &mut out);
        out.missed_bytes = self.missed_bytes() - missed_before;
        self.buffered.store(self.buffered_bytes(), Ordering::Relaxed);
        match result {
            Ok(()) => {
                out.closed = self.terminal_events >= 2;
                Ok(out)
            }
            Err(e) => {
                if e.is_session_fatal() {
                    warn!(session = %self.key, error = %e, "session failed");
                    self.fatal = Some(e.to_string());
                }
                Err(e)
            }
        }
    }

    fn process(&mut self, pkt: &PacketInfo<'_>, ctx: &PacketContext<'_>, out: &mut PacketOutcome) -> Result<()> {
        let tcp = &pkt.tcp;
        let dir = self.direction_of(pkt.ip.src, tcp.src_port);
        let i = dir.index();

        if tcp.flags.rst {
            self.terminal_events += 1;
            return Ok(());
        }
        if tcp.flags.syn {
            let r = &mut self.dirs[i].reassembly;
            if !r.is_anchored() {
                r.set_initial_seq(tcp.seq);
            }
            return Ok(());
        }
        if tcp.flags.ack {
            self.check_ack(dir, tcp.ack, ctx, out)?;
        }
        if tcp.payload.is_empty() && !tcp.flags.fin {
            return Ok(());
        }

        if !self.dirs[i].reassembly.is_anchored() {
            debug!(session = %self.key, %dir, "direction joined mid-stream");
            self.dirs[i].reassembly.start_mid_stream(tcp.seq, true);
        }
        let budget = Budget {
            limit: ctx.max_reassembly,
            other: self.dirs[dir.opposite().index()].reassembly.buffered(),
        };
        let adjusted =
            self.dirs[i]
                .reassembly
                .adjust_sequence(tcp.seq, tcp.payload, tcp.flags.fin, budget)?;
        if let Adjusted::InOrder(bytes) = adjusted {
            self.consume(dir, bytes, ctx, out)?;
        }
        self.drain(dir, ctx, out)?;

        for d in self.dirs.iter_mut() {
            self.terminal_events += d.reassembly.take_fin_events();
        }
        Ok(())
    }

    /// Compare an acknowledgment from `dir` against what the opposite
    /// direction has delivered.
    fn check_ack(&mut self, dir: Direction, ack: u32, ctx: &PacketContext<'_>, out: &mut PacketOutcome) -> Result<()> {
        let peer = dir.opposite();
        let r = &mut self.dirs[peer.index()].reassembly;
        let Some(missing) = r.ack_fault(ack) else {
            return Ok(());
        };
        if !ctx.recovery {
            r.mark_fatal();
            return Err(Error::AckFault { missing });
        }
        let skipped = r.recover_from_ack_fault(ack);
        r.take_ack_fault();
        out.ack_fault = true;
        debug!(session = %self.key, dir = %peer, missing, skipped, "ack fault, resynchronizing");
        self.drain(peer, ctx, out)
    }

    /// Pull queued bytes that became contiguous, resynchronizing to a record
    /// boundary first when the direction is in repair mode.
    fn drain(&mut self, dir: Direction, ctx: &PacketContext<'_>, out: &mut PacketOutcome) -> Result<()> {
        let i = dir.index();
        loop {
            let r = &mut self.dirs[i].reassembly;
            if r.skip_partial() {
                let max = ctx.max_record_len;
                if !r.find_next_record(|data| is_record_boundary(data, max)) {
                    return Ok(());
                }
                self.leave_repair(dir);
            }
            match self.dirs[i].reassembly.next_contiguous() {
                Some(bytes) => self.consume(dir, &bytes, ctx, out)?,
                None => return Ok(()),
            }
        }
    }

    fn leave_repair(&mut self, dir: Direction) {
        let d = &mut self.dirs[dir.index()];
        d.records.reset();
        d.handshake.reset();
        self.engines[dir.index()].resync();
        debug!(session = %self.key, %dir, missed = d.reassembly.missed_bytes(), "resynchronized at record boundary");
    }

    fn consume(&mut self, dir: Direction, bytes: &[u8], ctx: &PacketContext<'_>, out: &mut PacketOutcome) -> Result<()> {
        let i = dir.index();
        self.dirs[i].records.push(bytes);
        while let Some(record) = self.dirs[i].records.next_record(ctx.max_record_len)? {
            self.dirs[i].records_seen += 1;
            self.handle_record(dir, record, ctx, out)?;
        }
        Ok(())
    }

    fn mark_undecryptable(&mut self, reason: &'static str) {
        if self.decryptable {
            debug!(session = %self.key, reason, "tracking session structurally only");
            self.decryptable = false;
            for d in self.dirs.iter_mut() {
                d.handshake.reset();
            }
        }
    }

    fn handle_record(&mut self, dir: Direction, record: Record, ctx: &PacketContext<'_>, out: &mut PacketOutcome) -> Result<()> {
        let i = dir.index();
        if !self.decryptable {
            if record.content_type == ContentType::ChangeCipherSpec {
                self.dirs[i].cipher_on = true;
            }
            self.dirs[i].records_skipped += 1;
            return Ok(());
        }

        let fragment = if self.dirs[i].cipher_on {
            match self.engines[i].decrypt_record(record.content_type.as_u8(), record.version, &record.fragment) {
                Ok(plain) => plain,
                Err(Error::ResyncPending) => {
                    self.dirs[i].records_skipped += 1;
                    debug!(session = %self.key, %dir, "record skipped while resynchronizing");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        } else {
            record.fragment
        };

        match record.content_type {
            ContentType::ChangeCipherSpec => {
                self.engines[i].change_cipher_spec()?;
                self.dirs[i].cipher_on = true;
                debug!(session = %self.key, %dir, "ChangeCipherSpec");
            }
            ContentType::Alert => {
                debug!(session = %self.key, %dir, alert = ?fragment.get(..2), "alert");
            }
            ContentType::Handshake => self.handle_handshake_record(dir, &fragment, ctx)?,
            ContentType::ApplicationData => {
                if !self.dirs[i].cipher_on {
                    if self.hs.client_hello_seen {
                        return Err(Error::UnexpectedMessage("application data before ChangeCipherSpec"));
                    }
                    self.mark_undecryptable("application data without an observed handshake");
                    self.dirs[i].records_skipped += 1;
                    return Ok(());
                }
                out.push(dir, fragment);
            }
            ContentType::Heartbeat => {}
        }
        Ok(())
    }

    fn handle_handshake_record(&mut self, dir: Direction, fragment: &[u8], ctx: &PacketContext<'_>) -> Result<()> {
        let i = dir.index();
        if !self.hs.client_hello_seen
            && self.dirs[i].handshake.is_empty()
            && fragment.first() != Some(&1)
        {
            self.mark_undecryptable("handshake joined after ClientHello");
            self.dirs[i].records_skipped += 1;
            return Ok(());
        }
        self.dirs[i].handshake.push(fragment);
        while let Some(msg) = self.dirs[i].handshake.next_message(ctx.max_handshake_len)? {
            self.handle_handshake(dir, msg, ctx)?;
            if !self.decryptable {
                break;
            }
        }
        Ok(())
    }

    fn handle_handshake(&mut self, dir: Direction, msg: HandshakeMessage, ctx: &PacketContext<'_>) -> Result<()> {
        let typ = HandshakeType::try_from(msg.msg_type)?;
        if let Some(from_client) = typ.sent_by_client() {
            if from_client != (dir == Direction::ClientToServer) {
                return Err(Error::UnexpectedMessage("handshake message from the wrong peer"));
            }
        }
        debug!(session = %self.key, %dir, msg = ?typ, len = msg.body().len(), "handshake");

        match typ {
            HandshakeType::HelloRequest => {}
            HandshakeType::ClientHello => self.on_client_hello(msg)?,
            HandshakeType::ServerHello => {
                self.on_server_hello(msg.body(), ctx)?;
                self.hs.transcript.extend_from_slice(&msg.raw);
            }
            HandshakeType::Certificate
            | HandshakeType::CertificateRequest
            | HandshakeType::ServerHelloDone
            | HandshakeType::CertificateVerify
            | HandshakeType::CertificateStatus => {
                self.hs.transcript.extend_from_slice(&msg.raw);
            }
            HandshakeType::ServerKeyExchange => {
                return Err(Error::EphemeralKeyExchange(self.hs.suite));
            }
            HandshakeType::ClientKeyExchange => {
                self.hs.transcript.extend_from_slice(&msg.raw);
                self.on_client_key_exchange(msg.body(), ctx)?;
            }
            HandshakeType::Finished => {
                let complete = self.on_finished(dir, msg.body())?;
                self.hs.transcript.extend_from_slice(&msg.raw);
                if complete {
                    for e in self.engines.iter_mut() {
                        e.release_handshake_material();
                    }
                    self.hs.transcript = Vec::new();
                    debug!(session = %self.key, resumed = self.hs.resumed, "handshake complete");
                }
            }
            HandshakeType::NewSessionTicket => {
                self.on_new_session_ticket(msg.body(), ctx)?;
                self.hs.transcript.extend_from_slice(&msg.raw);
            }
        }
        Ok(())
    }

    fn on_client_hello(&mut self, msg: HandshakeMessage) -> Result<()> {
        let info = parse_client_hello(&msg.raw)?;
        let key = self.profile.key_for(info.server_name.as_deref());
        self.hs = HandshakeState {
            client_hello_seen: true,
            client_random: Some(info.random),
            client_session_id: info.session_id,
            offered_ticket: info.ticket,
            server_name: info.server_name,
            key,
            client_ems: info.extended_master_secret,
            transcript: msg.raw,
            ..Default::default()
        };
        Ok(())
    }

    fn on_server_hello(&mut self, body: &[u8], ctx: &PacketContext<'_>) -> Result<()> {
        let sh = parse_server_hello(body)?;
        if sh.tls13 {
            return Err(Error::UnsupportedVersion(0x0304));
        }
        ProtocolVersion::from_wire(sh.version)?;
        if sh.compression != 0 {
            return Err(Error::CompressionNotSupported(sh.compression));
        }
        let client_random = self
            .hs
            .client_random
            .ok_or(Error::UnexpectedMessage("ServerHello before ClientHello"))?;
        for e in self.engines.iter_mut() {
            e.set_randoms(&client_random, &sh.random);
            e.set_cipher_spec(sh.cipher_suite, sh.version)?;
        }
        self.hs.server_random = Some(sh.random);
        self.hs.suite = sh.cipher_suite;
        self.hs.version = sh.version;
        self.hs.ems = self.hs.client_ems && sh.extended_master_secret;

        let resumed =
            !self.hs.client_session_id.is_empty() && sh.session_id == self.hs.client_session_id;
        self.hs.server_session_id = sh.session_id;
        if !resumed {
            return Ok(());
        }

        let from_ticket = self
            .hs
            .offered_ticket
            .as_ref()
            .and_then(|t| ctx.cache.get(&CacheKey::Ticket(t.clone()), ctx.now));
        let cached = from_ticket
            .or_else(|| {
                ctx.cache
                    .get(&CacheKey::SessionId(self.hs.server_session_id.clone()), ctx.now)
            })
            .filter(|c| c.suite == sh.cipher_suite && c.version == sh.version)
            .ok_or(Error::SessionNotCached)?;
        for e in self.engines.iter_mut() {
            e.derive_master_secret(SecretSource::Resumed(&cached.master))?;
            e.derive_working_keys()?;
        }
        self.hs.resumed = true;
        Ok(())
    }

    fn on_client_key_exchange(&mut self, body: &[u8], ctx: &PacketContext<'_>) -> Result<()> {
        if self.hs.resumed {
            return Err(Error::UnexpectedMessage("ClientKeyExchange in resumed handshake"));
        }
        if self.hs.server_random.is_none() {
            return Err(Error::UnexpectedMessage("ClientKeyExchange before ServerHello"));
        }
        let key = self.hs.key.clone().ok_or(Error::MissingPrivateKey)?;
        let pre_master = Zeroizing::new(key.decrypt_pre_master(client_key_exchange_payload(body))?);
        let session_transcript = self.hs.ems.then_some(self.hs.transcript.as_slice());
        for e in self.engines.iter_mut() {
            e.derive_master_secret(SecretSource::PreMaster {
                secret: &pre_master,
                session_transcript,
            })?;
            e.derive_working_keys()?;
        }

        if !self.hs.server_session_id.is_empty() {
            if let Some(master) = self.engines[0].master_secret() {
                ctx.cache.insert(
                    CacheKey::SessionId(self.hs.server_session_id.clone()),
                    CachedSession::new(master, self.hs.suite, self.hs.version),
                    ctx.now,
                );
            }
        }
        Ok(())
    }

    /// Returns true once both directions' Finished messages verified.
    fn on_finished(&mut self, dir: Direction, verify_data: &[u8]) -> Result<bool> {
        let i = dir.index();
        if !self.dirs[i].cipher_on {
            return Err(Error::UnexpectedMessage("Finished before ChangeCipherSpec"));
        }
        self.engines[i].verify_finished(verify_data, &self.hs.transcript)?;
        self.hs.finished[i] = true;
        Ok(self.hs.finished.iter().all(|f| *f))
    }

    fn on_new_session_ticket(&mut self, body: &[u8], ctx: &PacketContext<'_>) -> Result<()> {
        let ticket = parse_new_session_ticket(body)?;
        if ticket.is_empty() {
            return Ok(());
        }
        if let Some(master) = self.engines[Direction::ServerToClient.index()].master_secret() {
            ctx.cache.insert(
                CacheKey::Ticket(ticket.to_vec()),
                CachedSession::new(master, self.hs.suite, self.hs.version),
                ctx.now,
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("decryptable", &self.decryptable)
            .field("terminal_events", &self.terminal_events)
            .field("fatal", &self.fatal)
            .finish_non_exhaustive()
    }
}
