use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::LinkType;

/// Engine tuning knobs. Every field has a default, so a partial JSON file
/// only overrides what it names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub link_type: LinkType,
    /// Fixed number of session table buckets.
    pub bucket_count: usize,
    /// Idle sessions older than this are evicted by the sweep.
    pub session_timeout_secs: u64,
    /// Sweep stale sessions every N-th session insertion.
    pub sweep_interval: u64,
    /// Recover from ack faults instead of failing the session.
    pub recovery: bool,
    /// Per-session reassembly budget in bytes; `None` is unbounded.
    pub max_reassembly_bytes: Option<usize>,
    pub max_record_len: usize,
    pub max_handshake_len: usize,
    pub session_cache_capacity: usize,
    pub session_cache_timeout_secs: u64,
}

pub const DEFAULT_MAX_RECORD_LEN: usize = 16384 + 2048;

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            link_type: LinkType::Ethernet,
            bucket_count: 4093,
            session_timeout_secs: 300,
            sweep_interval: 256,
            recovery: false,
            max_reassembly_bytes: None,
            max_record_len: DEFAULT_MAX_RECORD_LEN,
            max_handshake_len: 256 * 1024,
            session_cache_capacity: 10_000,
            session_cache_timeout_secs: 3600,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket_count == 0 {
            return Err(Error::Config("bucket_count must be non-zero".into()));
        }
        if self.sweep_interval == 0 {
            return Err(Error::Config("sweep_interval must be non-zero".into()));
        }
        if self.max_record_len < 5 || self.max_record_len > u16::MAX as usize {
            return Err(Error::Config(format!(
                "max_record_len {} out of range",
                self.max_record_len
            )));
        }
        if self.max_handshake_len < 4 {
            return Err(Error::Config("max_handshake_len too small".into()));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn session_cache_timeout(&self) -> Duration {
        Duration::from_secs(self.session_cache_timeout_secs)
    }
}
