//! The decoding engine: registry, session table and resumption cache behind
//! one instance, with no process-wide state.

use std::fmt;
use std::io::Write;
use std::net::IpAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::protocol::{parse_frame, Direction, PacketInfo, SessionKey};
use crate::registry::{KeyFormat, PrivateKey, ServerProfile, ServerRegistry};
use crate::session::table::{SessionHandle, SessionTable};
use crate::session::{PacketContext, Session};
use crate::stats::{SessionStats, Stats};
use crate::tls::cache::SessionCache;
use crate::tls::engine::{default_factory, EngineFactory};

/// One chunk of decrypted application data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedData {
    pub key: SessionKey,
    pub direction: Direction,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct RecoveryPolicy {
    enabled: bool,
    max_reassembly: Option<usize>,
}

pub type TraceSink = Box<dyn Write + Send>;

pub struct Engine {
    config: EngineConfig,
    policy: RwLock<RecoveryPolicy>,
    registry: ServerRegistry,
    table: SessionTable,
    cache: SessionCache,
    stats: Stats,
    trace: Mutex<Option<TraceSink>>,
    factory: EngineFactory,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_engine_factory(config, default_factory)
    }

    /// Build an engine whose sessions get their per-direction TLS engines
    /// from `factory`.
    pub fn with_engine_factory(config: EngineConfig, factory: EngineFactory) -> Result<Self> {
        config.validate()?;
        Ok(Engine {
            policy: RwLock::new(RecoveryPolicy {
                enabled: config.recovery,
                max_reassembly: config.max_reassembly_bytes,
            }),
            registry: ServerRegistry::new(),
            table: SessionTable::new(
                config.bucket_count,
                config.sweep_interval,
                config.session_timeout(),
            ),
            cache: SessionCache::new(
                config.session_cache_capacity,
                config.session_cache_timeout(),
            ),
            stats: Stats::default(),
            trace: Mutex::new(None),
            factory,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// Register an RSA private key for a server endpoint. `name` binds the
    /// key to a server name offered via SNI; without it the key becomes the
    /// endpoint's default.
    pub fn register_key(
        &self,
        addr: IpAddr,
        port: u16,
        name: Option<&str>,
        key: &[u8],
        format: KeyFormat,
        password: Option<&[u8]>,
    ) -> Result<()> {
        let key = PrivateKey::load(key, format, password)?;
        info!(%addr, port, name, bits = key.bits(), "registered server key");
        self.registry.register(addr, port, Arc::new(key), name);
        Ok(())
    }

    pub fn is_registered_address(&self, addr: IpAddr) -> bool {
        self.registry.is_registered_address(addr)
    }

    pub fn is_registered_port(&self, port: u16) -> bool {
        self.registry.is_registered_port(port)
    }

    /// Switch ack-fault recovery and the per-session reassembly budget.
    /// Applies to every packet processed after the call.
    pub fn enable_recovery(&self, on: bool, max_reassembly: Option<usize>) {
        *self.policy.write() = RecoveryPolicy {
            enabled: on,
            max_reassembly,
        };
        debug!(on, ?max_reassembly, "recovery policy changed");
    }

    pub fn set_trace(&self, sink: Option<TraceSink>) {
        *self.trace.lock() = sink;
    }

    pub fn session_stats(&self) -> SessionStats {
        self.stats
            .snapshot(self.table.len(), self.table.buffered_bytes())
    }

    /// Decode one frame using the wall clock, concatenating every plaintext
    /// chunk it released. `None` means no plaintext yet.
    pub fn decode_packet(&self, frame: &[u8]) -> Result<Option<Vec<u8>>> {
        let chunks = self.process_frame(frame, SystemTime::now())?;
        if chunks.is_empty() {
            return Ok(None);
        }
        Ok(Some(chunks.into_iter().flat_map(|c| c.data).collect()))
    }

    /// Decode one link-layer frame captured at `now`. Non-TCP frames decode
    /// to nothing.
    pub fn process_frame(&self, frame: &[u8], now: SystemTime) -> Result<Vec<DecodedData>> {
        match parse_frame(frame, self.config.link_type)? {
            Some(pkt) => self.process_packet(&pkt, now),
            None => Ok(Vec::new()),
        }
    }

    pub fn process_packet(&self, pkt: &PacketInfo<'_>, now: SystemTime) -> Result<Vec<DecodedData>> {
        let key = pkt.session_key();
        let handle = if pkt.is_client_syn() {
            let profile = self
                .registry
                .resolve(pkt.ip.dst, pkt.tcp.dst_port)
                .ok_or(Error::ServerNotRegistered {
                    addr: pkt.ip.dst,
                    port: pkt.tcp.dst_port,
                })?;
            let client = (pkt.ip.src, pkt.tcp.src_port);
            let server = (pkt.ip.dst, pkt.tcp.dst_port);
            self.create_session(key, client, server, profile, now)
        } else {
            match self.table.lookup(&key, now) {
                Some(handle) => handle,
                None => {
                    let (client, server, profile) = self.resolve_endpoints(pkt)?;
                    if pkt.tcp.payload.is_empty() {
                        return Err(Error::NoSession);
                    }
                    self.create_session(key, client, server, profile, now)
                }
            }
        };

        let ctx = {
            let policy = *self.policy.read();
            PacketContext {
                recovery: policy.enabled,
                max_reassembly: policy.max_reassembly,
                max_record_len: self.config.max_record_len,
                max_handshake_len: self.config.max_handshake_len,
                cache: &self.cache,
                now,
            }
        };

        // The session lock is released before the table lock is taken to
        // remove the entry.
        let result = {
            let mut session = handle.session.lock();
            session.on_packet(pkt, &ctx)
        };

        match result {
            Ok(outcome) => {
                self.stats.missed(outcome.missed_bytes);
                if outcome.ack_fault {
                    self.stats.ack_fault();
                    self.trace(format_args!("ack-fault {} missed={}", key, outcome.missed_bytes));
                }
                if outcome.closed && self.table.remove(&key, handle.id) {
                    self.stats.closed();
                    self.trace(format_args!("close {}", key));
                }
                let decoded: Vec<DecodedData> = outcome
                    .chunks
                    .into_iter()
                    .map(|(direction, data)| DecodedData { key, direction, data })
                    .collect();
                self.stats
                    .decrypted(decoded.iter().map(|d| d.data.len()).sum());
                Ok(decoded)
            }
            Err(Error::SessionFatal(reason)) => {
                self.table.remove(&key, handle.id);
                self.trace(format_args!("evict-fatal {}", key));
                Err(Error::SessionFatal(reason))
            }
            Err(e) => {
                if e.is_session_fatal() {
                    self.stats.fatal();
                    self.trace(format_args!("fatal {} {}", key, e));
                }
                Err(e)
            }
        }
    }

    /// Evict idle sessions and expired resumption entries. Returns the
    /// number of sessions evicted.
    pub fn sweep_stale(&self, now: SystemTime) -> usize {
        let evicted = self.table.sweep_stale(now, self.config.session_timeout());
        self.note_stale(&evicted);
        let expired = self.cache.sweep(now);
        if expired > 0 {
            debug!(expired, "resumption cache entries expired");
        }
        evicted.len()
    }

    /// Pick the server side of a flow whose SYN was not seen: the
    /// destination if it is registered, otherwise the source. An
    /// unregistered flow is reported against its likely server endpoint.
    fn resolve_endpoints(
        &self,
        pkt: &PacketInfo<'_>,
    ) -> Result<((IpAddr, u16), (IpAddr, u16), Arc<ServerProfile>)> {
        let src = (pkt.ip.src, pkt.tcp.src_port);
        let dst = (pkt.ip.dst, pkt.tcp.dst_port);
        if let Some(profile) = self.registry.resolve(dst.0, dst.1) {
            return Ok((src, dst, profile));
        }
        if let Some(profile) = self.registry.resolve(src.0, src.1) {
            return Ok((dst, src, profile));
        }
        let (addr, port) = likely_server(src, dst, |port| self.registry.is_registered_port(port));
        Err(Error::ServerNotRegistered { addr, port })
    }

    fn create_session(
        &self,
        key: SessionKey,
        client: (IpAddr, u16),
        server: (IpAddr, u16),
        profile: Arc<ServerProfile>,
        now: SystemTime,
    ) -> SessionHandle {
        let session = Session::new(
            key,
            client,
            server,
            profile,
            self.factory,
            Arc::new(AtomicUsize::new(0)),
        );
        let created = self.table.create(session, now);
        self.stats.session_created(self.table.len());
        self.note_stale(&created.evicted);
        if created.replaced {
            self.trace(format_args!("replace {}", key));
        }
        self.trace(format_args!("create {} client={}:{}", key, client.0, client.1));
        debug!(session = %key, "session created");
        created.handle
    }

    fn note_stale(&self, evicted: &[SessionKey]) {
        if evicted.is_empty() {
            return;
        }
        self.stats.stale(evicted.len());
        for key in evicted {
            self.trace(format_args!("evict-stale {}", key));
        }
        debug!(count = evicted.len(), "idle sessions evicted");
    }

    fn trace(&self, line: fmt::Arguments<'_>) {
        let mut sink = self.trace.lock();
        if let Some(w) = sink.as_mut() {
            let _ = writeln!(w, "{}", line);
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("servers", &self.registry.len())
            .field("sessions", &self.table.len())
            .finish_non_exhaustive()
    }
}

/// The endpoint on a port some key is registered for, else the lower port.
fn likely_server(
    src: (IpAddr, u16),
    dst: (IpAddr, u16),
    registered: impl Fn(u16) -> bool,
) -> (IpAddr, u16) {
    match (registered(dst.1), registered(src.1)) {
        (true, _) => dst,
        (false, true) => src,
        (false, false) if src.1 < dst.1 => src,
        (false, false) => dst,
    }
}
