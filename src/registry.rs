//! Server registry: which `(address, port)` endpoints may be decrypted, and
//! with which private keys.
//!
//! Profiles are immutable once published. Registering another key under an
//! existing endpoint builds a new profile and swaps it in, so a resolver
//! holding the old `Arc` keeps a consistent view.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use openssl::pkey::{Id, PKey, Private};
use openssl::rsa::{Padding, Rsa};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::normalize_ip;

pub const PRE_MASTER_LEN: usize = 48;

/// Encoding of private key bytes passed to registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFormat {
    #[default]
    Pem,
    Der,
}

/// An RSA server private key used to recover pre-master secrets.
pub struct PrivateKey {
    rsa: Rsa<Private>,
}

impl PrivateKey {
    /// Load a key. PEM accepts PKCS#1 and PKCS#8 (optionally encrypted with
    /// `password`); DER accepts unencrypted PKCS#1 and PKCS#8.
    pub fn load(bytes: &[u8], format: KeyFormat, password: Option<&[u8]>) -> Result<Self> {
        let pkey = match format {
            KeyFormat::Pem => match password {
                Some(pass) => PKey::private_key_from_pem_passphrase(bytes, pass),
                None => PKey::private_key_from_pem(bytes),
            },
            KeyFormat::Der => {
                PKey::private_key_from_der(bytes).or_else(|_| PKey::private_key_from_pkcs8(bytes))
            }
        }
        .map_err(|e| Error::InvalidKey(e.to_string()))?;
        Self::from_pkey(pkey)
    }

    pub fn from_pkey(pkey: PKey<Private>) -> Result<Self> {
        if pkey.id() != Id::RSA {
            return Err(Error::UnsupportedKey(format!("{:?}", pkey.id())));
        }
        let rsa = pkey.rsa().map_err(|e| Error::InvalidKey(e.to_string()))?;
        Ok(PrivateKey { rsa })
    }

    pub fn bits(&self) -> u32 {
        self.rsa.size() * 8
    }

    /// Decrypt an RSA-encrypted pre-master secret (PKCS#1 v1.5 padding).
    pub fn decrypt_pre_master(&self, encrypted: &[u8]) -> Result<Vec<u8>> {
        if encrypted.len() != self.rsa.size() as usize {
            return Err(Error::PreMasterDecrypt);
        }
        let mut out = vec![0u8; self.rsa.size() as usize];
        let n = self
            .rsa
            .private_decrypt(encrypted, &mut out, Padding::PKCS1)
            .map_err(|_| Error::PreMasterDecrypt)?;
        if n != PRE_MASTER_LEN {
            return Err(Error::PreMasterDecrypt);
        }
        out.truncate(n);
        Ok(out)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey(RSA-{})", self.bits())
    }
}

/// Decryption profile for one listening endpoint.
#[derive(Debug, Clone)]
pub struct ServerProfile {
    pub addr: IpAddr,
    pub port: u16,
    default_key: Option<Arc<PrivateKey>>,
    named_keys: Vec<(String, Arc<PrivateKey>)>,
}

impl ServerProfile {
    fn new(addr: IpAddr, port: u16) -> Self {
        ServerProfile {
            addr,
            port,
            default_key: None,
            named_keys: Vec::new(),
        }
    }

    /// Key for a connection: the key bound to `server_name` if one is
    /// registered, else the endpoint's unnamed key.
    pub fn key_for(&self, server_name: Option<&str>) -> Option<Arc<PrivateKey>> {
        server_name
            .and_then(|name| {
                self.named_keys
                    .iter()
                    .find(|(n, _)| n.eq_ignore_ascii_case(name))
                    .map(|(_, k)| Arc::clone(k))
            })
            .or_else(|| self.default_key.clone())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.named_keys.iter().map(|(n, _)| n.as_str())
    }

    pub fn has_default_key(&self) -> bool {
        self.default_key.is_some()
    }
}

#[derive(Debug, Default)]
pub struct ServerRegistry {
    profiles: RwLock<HashMap<(IpAddr, u16), Arc<ServerProfile>>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key` for `addr:port`. A name binds the key to that SNI host
    /// name; registering under an existing endpoint augments its profile.
    pub fn register(&self, addr: IpAddr, port: u16, key: Arc<PrivateKey>, name: Option<&str>) {
        let addr = normalize_ip(addr);
        let mut profiles = self.profiles.write();
        let mut profile = profiles
            .get(&(addr, port))
            .map(|p| ServerProfile::clone(p))
            .unwrap_or_else(|| ServerProfile::new(addr, port));
        match name {
            Some(name) => {
                profile.named_keys.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
                profile.named_keys.push((name.to_string(), key));
            }
            None => profile.default_key = Some(key),
        }
        debug!(%addr, port, name = ?name, "registered server key");
        profiles.insert((addr, port), Arc::new(profile));
    }

    pub fn is_registered_address(&self, addr: IpAddr) -> bool {
        let addr = normalize_ip(addr);
        self.profiles.read().keys().any(|(a, _)| *a == addr)
    }

    pub fn is_registered_port(&self, port: u16) -> bool {
        self.profiles.read().keys().any(|(_, p)| *p == port)
    }

    /// Exact endpoint match first, then a wildcard registration on the
    /// unspecified address for the same port.
    pub fn resolve(&self, addr: IpAddr, port: u16) -> Option<Arc<ServerProfile>> {
        let addr = normalize_ip(addr);
        let profiles = self.profiles.read();
        if let Some(p) = profiles.get(&(addr, port)) {
            return Some(Arc::clone(p));
        }
        let wildcard = match addr {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        profiles.get(&(wildcard, port)).cloned()
    }

    pub fn len(&self) -> usize {
        self.profiles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
