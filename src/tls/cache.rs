//! Engine-wide resumption cache: session IDs and tickets to master secrets.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use zeroize::Zeroizing;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    SessionId(Vec<u8>),
    Ticket(Vec<u8>),
}

#[derive(Clone)]
pub struct CachedSession {
    pub master: Zeroizing<Vec<u8>>,
    pub suite: u16,
    pub version: u16,
    stored: SystemTime,
    generation: u64,
}

impl CachedSession {
    pub fn new(master: &[u8], suite: u16, version: u16) -> Self {
        CachedSession {
            master: Zeroizing::new(master.to_vec()),
            suite,
            version,
            stored: SystemTime::UNIX_EPOCH,
            generation: 0,
        }
    }
}

impl std::fmt::Debug for CachedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedSession")
            .field("suite", &format_args!("0x{:04x}", self.suite))
            .field("version", &format_args!("0x{:04x}", self.version))
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, CachedSession>,
    /// Insertion order; stale generations are skipped on eviction.
    order: VecDeque<(CacheKey, u64)>,
    generation: u64,
}

pub struct SessionCache {
    inner: Mutex<Inner>,
    capacity: usize,
    timeout: Duration,
}

fn expired(stored: SystemTime, now: SystemTime, timeout: Duration) -> bool {
    now.duration_since(stored).map_or(false, |age| age > timeout)
}

impl SessionCache {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        SessionCache {
            inner: Mutex::new(Inner::default()),
            capacity,
            timeout,
        }
    }

    pub fn insert(&self, key: CacheKey, mut entry: CachedSession, now: SystemTime) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.generation += 1;
        entry.stored = now;
        entry.generation = inner.generation;
        let generation = inner.generation;
        inner.order.push_back((key.clone(), generation));
        inner.entries.insert(key, entry);

        while inner.entries.len() > self.capacity {
            let Some((oldest, generation)) = inner.order.pop_front() else {
                break;
            };
            if inner.entries.get(&oldest).map(|e| e.generation) == Some(generation) {
                inner.entries.remove(&oldest);
            }
        }
        if inner.order.len() > 2 * self.capacity.max(16) {
            let Inner { entries, order, .. } = &mut *inner;
            order.retain(|(k, g)| entries.get(k).map(|e| e.generation) == Some(*g));
        }
    }

    pub fn get(&self, key: &CacheKey, now: SystemTime) -> Option<CachedSession> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get(key)?;
        if expired(entry.stored, now, self.timeout) {
            inner.entries.remove(key);
            return None;
        }
        Some(entry.clone())
    }

    /// Drop entries older than the cache timeout.
    pub fn sweep(&self, now: SystemTime) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        let timeout = self.timeout;
        inner
            .entries
            .retain(|_, e| !expired(e.stored, now, timeout));
        let Inner { entries, order, .. } = &mut *inner;
        order.retain(|(k, g)| entries.get(k).map(|e| e.generation) == Some(*g));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn sid(b: u8) -> CacheKey {
        CacheKey::SessionId(vec![b; 32])
    }

    #[test]
    fn insert_and_get() {
        let cache = SessionCache::new(10, Duration::from_secs(60));
        cache.insert(sid(1), CachedSession::new(&[7; 48], 0x009C, 0x0303), t(100));
        let got = cache.get(&sid(1), t(120)).unwrap();
        assert_eq!(got.suite, 0x009C);
        assert_eq!(&got.master[..], &[7u8; 48][..]);
        assert!(cache.get(&CacheKey::Ticket(vec![1; 32]), t(120)).is_none());
    }

    #[test]
    fn entries_expire() {
        let cache = SessionCache::new(10, Duration::from_secs(60));
        cache.insert(sid(1), CachedSession::new(&[7; 48], 0x009C, 0x0303), t(100));
        cache.insert(sid(2), CachedSession::new(&[8; 48], 0x009C, 0x0303), t(150));
        assert!(cache.get(&sid(1), t(161)).is_none());
        assert_eq!(cache.sweep(t(211)), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache = SessionCache::new(2, Duration::from_secs(60));
        for i in 0..3 {
            cache.insert(sid(i), CachedSession::new(&[i; 48], 0x002F, 0x0303), t(100));
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&sid(0), t(100)).is_none());
        assert!(cache.get(&sid(2), t(100)).is_some());
    }

    #[test]
    fn reinsert_refreshes_position() {
        let cache = SessionCache::new(2, Duration::from_secs(60));
        cache.insert(sid(0), CachedSession::new(&[0; 48], 0x002F, 0x0303), t(100));
        cache.insert(sid(1), CachedSession::new(&[1; 48], 0x002F, 0x0303), t(100));
        cache.insert(sid(0), CachedSession::new(&[9; 48], 0x002F, 0x0303), t(101));
        cache.insert(sid(2), CachedSession::new(&[2; 48], 0x002F, 0x0303), t(102));
        assert!(cache.get(&sid(1), t(102)).is_none());
        assert_eq!(&cache.get(&sid(0), t(102)).unwrap().master[..], &[9u8; 48][..]);
    }
}
