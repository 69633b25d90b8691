//! Fixed-bucket table of live sessions behind one table-wide lock.
//!
//! Each entry hands out its session behind its own `Mutex`, so a packet
//! holds the table lock only long enough to find or insert the entry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use super::Session;
use crate::protocol::SessionKey;

/// Shared reference to a live session, tagged with the id of the table
/// entry it came from.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: u64,
    pub session: Arc<Mutex<Session>>,
}

struct Entry {
    id: u64,
    key: SessionKey,
    last_used: SystemTime,
    buffered: Arc<AtomicUsize>,
    session: Arc<Mutex<Session>>,
}

struct Inner {
    buckets: Vec<Vec<Entry>>,
    len: usize,
    next_id: u64,
    inserts: u64,
}

/// Result of [`SessionTable::create`].
pub struct Created {
    pub handle: SessionHandle,
    /// An older session with the same key was dropped.
    pub replaced: bool,
    /// Keys evicted by the periodic stale sweep this insertion triggered.
    pub evicted: Vec<SessionKey>,
}

pub struct SessionTable {
    inner: Mutex<Inner>,
    sweep_interval: u64,
    timeout: Duration,
}

fn addr_hash(addr: std::net::IpAddr) -> u64 {
    let octets: Vec<u8> = match addr {
        std::net::IpAddr::V4(a) => a.octets().to_vec(),
        std::net::IpAddr::V6(a) => a.octets().to_vec(),
    };
    octets
        .iter()
        .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3))
}

/// Symmetric in the two endpoints, so both traffic directions land in the
/// same bucket even for a key built without normalization.
pub fn bucket_index(key: &SessionKey, bucket_count: usize) -> usize {
    let endpoints = addr_hash(key.addr_a) ^ addr_hash(key.addr_b);
    let ports = u64::from(key.port_a) ^ u64::from(key.port_b);
    (endpoints.wrapping_add(ports) % bucket_count.max(1) as u64) as usize
}

fn is_stale(last_used: SystemTime, now: SystemTime, timeout: Duration) -> bool {
    now.duration_since(last_used).map_or(false, |idle| idle > timeout)
}

impl SessionTable {
    pub fn new(bucket_count: usize, sweep_interval: u64, timeout: Duration) -> Self {
        let buckets = (0..bucket_count.max(1)).map(|_| Vec::new()).collect();
        SessionTable {
            inner: Mutex::new(Inner {
                buckets,
                len: 0,
                next_id: 1,
                inserts: 0,
            }),
            sweep_interval,
            timeout,
        }
    }

    /// Insert a new session, replacing any entry with the same key. Every
    /// `sweep_interval`-th insertion also evicts idle sessions.
    pub fn create(&self, session: Session, now: SystemTime) -> Created {
        let key = *session.key();
        let buffered = session.buffered_counter();
        let mut inner = self.inner.lock();
        let bucket = bucket_index(&key, inner.buckets.len());

        let before = inner.buckets[bucket].len();
        inner.buckets[bucket].retain(|e| e.key != key);
        let replaced = inner.buckets[bucket].len() != before;
        if replaced {
            inner.len -= 1;
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let session = Arc::new(Mutex::new(session));
        inner.buckets[bucket].push(Entry {
            id,
            key,
            last_used: now,
            buffered,
            session: Arc::clone(&session),
        });
        inner.len += 1;
        inner.inserts += 1;

        let evicted = if self.sweep_interval > 0 && inner.inserts % self.sweep_interval == 0 {
            sweep_locked(&mut inner, now, self.timeout)
        } else {
            Vec::new()
        };

        Created {
            handle: SessionHandle { id, session },
            replaced,
            evicted,
        }
    }

    /// Find the session for either direction of a flow and refresh its
    /// last-used time.
    pub fn lookup(&self, key: &SessionKey, now: SystemTime) -> Option<SessionHandle> {
        let mut inner = self.inner.lock();
        let bucket = bucket_index(key, inner.buckets.len());
        let entry = inner.buckets[bucket].iter_mut().find(|e| e.key == *key)?;
        entry.last_used = now;
        Some(SessionHandle {
            id: entry.id,
            session: Arc::clone(&entry.session),
        })
    }

    /// Remove the entry created as `id`. A newer session that reused the key
    /// is left alone.
    pub fn remove(&self, key: &SessionKey, id: u64) -> bool {
        let mut inner = self.inner.lock();
        let bucket = bucket_index(key, inner.buckets.len());
        let before = inner.buckets[bucket].len();
        inner.buckets[bucket].retain(|e| !(e.key == *key && e.id == id));
        let removed = inner.buckets[bucket].len() != before;
        if removed {
            inner.len -= 1;
        }
        removed
    }

    pub fn sweep_stale(&self, now: SystemTime, timeout: Duration) -> Vec<SessionKey> {
        let mut inner = self.inner.lock();
        sweep_locked(&mut inner, now, timeout)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of out-of-order bytes queued by every live session.
    pub fn buffered_bytes(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .buckets
            .iter()
            .flatten()
            .map(|e| e.buffered.load(Ordering::Relaxed))
            .sum()
    }
}

fn sweep_locked(inner: &mut Inner, now: SystemTime, timeout: Duration) -> Vec<SessionKey> {
    let mut evicted = Vec::new();
    for bucket in inner.buckets.iter_mut() {
        bucket.retain(|e| {
            let stale = is_stale(e.last_used, now, timeout);
            if stale {
                evicted.push(e.key);
            }
            !stale
        });
    }
    inner.len -= evicted.len();
    evicted
}
