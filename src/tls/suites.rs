//! Cipher suites and protocol versions the engine can decrypt.

use tls_parser::{TlsCipherKx, TlsCipherSuite};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    Tls10,
    Tls11,
    Tls12,
}

impl ProtocolVersion {
    pub fn from_wire(v: u16) -> Result<Self> {
        match v {
            0x0301 => Ok(ProtocolVersion::Tls10),
            0x0302 => Ok(ProtocolVersion::Tls11),
            0x0303 => Ok(ProtocolVersion::Tls12),
            other => Err(Error::UnsupportedVersion(other)),
        }
    }

    pub fn wire(self) -> u16 {
        match self {
            ProtocolVersion::Tls10 => 0x0301,
            ProtocolVersion::Tls11 => 0x0302,
            ProtocolVersion::Tls12 => 0x0303,
        }
    }

    /// TLS 1.0 and 1.1 use the MD5/SHA-1 PRF and transcript hash.
    pub fn uses_legacy_prf(self) -> bool {
        self < ProtocolVersion::Tls12
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkCipher {
    TripleDesCbc,
    Aes128Cbc,
    Aes256Cbc,
    Aes128Gcm,
    Aes256Gcm,
}

impl BulkCipher {
    pub fn key_len(self) -> usize {
        match self {
            BulkCipher::TripleDesCbc => 24,
            BulkCipher::Aes128Cbc | BulkCipher::Aes128Gcm => 16,
            BulkCipher::Aes256Cbc | BulkCipher::Aes256Gcm => 32,
        }
    }

    pub fn is_aead(self) -> bool {
        matches!(self, BulkCipher::Aes128Gcm | BulkCipher::Aes256Gcm)
    }

    /// Cipher block size for CBC modes; zero for AEAD.
    pub fn block_len(self) -> usize {
        match self {
            BulkCipher::TripleDesCbc => 8,
            BulkCipher::Aes128Cbc | BulkCipher::Aes256Cbc => 16,
            BulkCipher::Aes128Gcm | BulkCipher::Aes256Gcm => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    Sha1,
    Sha256,
    Sha384,
}

impl MacAlgorithm {
    pub fn len(self) -> usize {
        match self {
            MacAlgorithm::Sha1 => 20,
            MacAlgorithm::Sha256 => 32,
            MacAlgorithm::Sha384 => 48,
        }
    }
}

/// Hash behind the TLS 1.2 PRF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrfHash {
    Sha256,
    Sha384,
}

#[derive(Debug, PartialEq, Eq)]
pub struct CipherSuite {
    pub id: u16,
    pub name: &'static str,
    pub bulk: BulkCipher,
    /// Record MAC; `None` for AEAD suites.
    pub mac: Option<MacAlgorithm>,
    pub prf: PrfHash,
}

pub const AEAD_EXPLICIT_NONCE_LEN: usize = 8;
pub const AEAD_TAG_LEN: usize = 16;
pub const AEAD_FIXED_IV_LEN: usize = 4;

impl CipherSuite {
    pub fn mac_len(&self) -> usize {
        self.mac.map_or(0, |m| m.len())
    }

    /// Bytes of IV taken from the key block for `version`.
    ///
    /// GCM takes its 4-byte salt, TLS 1.0 CBC takes the first chained IV,
    /// TLS 1.1+ CBC carries its IV in every record.
    pub fn fixed_iv_len(&self, version: ProtocolVersion) -> usize {
        if self.bulk.is_aead() {
            AEAD_FIXED_IV_LEN
        } else if version == ProtocolVersion::Tls10 {
            self.bulk.block_len()
        } else {
            0
        }
    }

    /// Per-record IV/nonce bytes preceding the ciphertext.
    pub fn record_iv_len(&self, version: ProtocolVersion) -> usize {
        if self.bulk.is_aead() {
            AEAD_EXPLICIT_NONCE_LEN
        } else if version == ProtocolVersion::Tls10 {
            0
        } else {
            self.bulk.block_len()
        }
    }

    pub fn key_block_len(&self, version: ProtocolVersion) -> usize {
        2 * (self.mac_len() + self.bulk.key_len() + self.fixed_iv_len(version))
    }

    /// Smallest well-formed encrypted fragment.
    pub fn min_fragment_len(&self, version: ProtocolVersion) -> usize {
        if self.bulk.is_aead() {
            AEAD_EXPLICIT_NONCE_LEN + AEAD_TAG_LEN
        } else {
            let block = self.bulk.block_len();
            let body = (self.mac_len() + 1).div_ceil(block) * block;
            self.record_iv_len(version) + body
        }
    }

    /// GCM suites require TLS 1.2.
    pub fn allowed_with(&self, version: ProtocolVersion) -> bool {
        match self.bulk {
            BulkCipher::Aes128Gcm | BulkCipher::Aes256Gcm => version == ProtocolVersion::Tls12,
            _ => !matches!(self.mac, Some(MacAlgorithm::Sha256 | MacAlgorithm::Sha384))
                || version == ProtocolVersion::Tls12,
        }
    }
}

static SUITES: &[CipherSuite] = &[
    CipherSuite {
        id: 0x000A,
        name: "TLS_RSA_WITH_3DES_EDE_CBC_SHA",
        bulk: BulkCipher::TripleDesCbc,
        mac: Some(MacAlgorithm::Sha1),
        prf: PrfHash::Sha256,
    },
    CipherSuite {
        id: 0x002F,
        name: "TLS_RSA_WITH_AES_128_CBC_SHA",
        bulk: BulkCipher::Aes128Cbc,
        mac: Some(MacAlgorithm::Sha1),
        prf: PrfHash::Sha256,
    },
    CipherSuite {
        id: 0x0035,
        name: "TLS_RSA_WITH_AES_256_CBC_SHA",
        bulk: BulkCipher::Aes256Cbc,
        mac: Some(MacAlgorithm::Sha1),
        prf: PrfHash::Sha256,
    },
    CipherSuite {
        id: 0x003C,
        name: "TLS_RSA_WITH_AES_128_CBC_SHA256",
        bulk: BulkCipher::Aes128Cbc,
        mac: Some(MacAlgorithm::Sha256),
        prf: PrfHash::Sha256,
    },
    CipherSuite {
        id: 0x003D,
        name: "TLS_RSA_WITH_AES_256_CBC_SHA256",
        bulk: BulkCipher::Aes256Cbc,
        mac: Some(MacAlgorithm::Sha256),
        prf: PrfHash::Sha256,
    },
    CipherSuite {
        id: 0x009C,
        name: "TLS_RSA_WITH_AES_128_GCM_SHA256",
        bulk: BulkCipher::Aes128Gcm,
        mac: None,
        prf: PrfHash::Sha256,
    },
    CipherSuite {
        id: 0x009D,
        name: "TLS_RSA_WITH_AES_256_GCM_SHA384",
        bulk: BulkCipher::Aes256Gcm,
        mac: None,
        prf: PrfHash::Sha384,
    },
];

/// Look up a negotiated suite. Suites whose key exchange cannot be undone
/// with the server's RSA key fail with `EphemeralKeyExchange`.
pub fn lookup(id: u16) -> Result<&'static CipherSuite> {
    if let Some(suite) = SUITES.iter().find(|s| s.id == id) {
        return Ok(suite);
    }
    match TlsCipherSuite::from_id(id).map(|s| &s.kx) {
        Some(TlsCipherKx::Dhe | TlsCipherKx::Ecdhe | TlsCipherKx::Dh | TlsCipherKx::Ecdh) => {
            Err(Error::EphemeralKeyExchange(id))
        }
        _ => Err(Error::UnsupportedCipherSuite(id)),
    }
}

pub fn supported() -> impl Iterator<Item = &'static CipherSuite> {
    SUITES.iter()
}
