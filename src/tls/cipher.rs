//! Per-direction record protection state.
//!
//! One [`RecordCipher`] decrypts one direction of a connection. AEAD suites
//! go through `ring::aead`; CBC suites decrypt with `openssl` and verify the
//! record MAC with `ring::hmac`.

use openssl::symm::{Cipher, Crypter, Mode};
use ring::aead::{self, LessSafeKey, UnboundKey};
use ring::hmac;
use zeroize::{Zeroize, Zeroizing};

use super::suites::{
    BulkCipher, CipherSuite, MacAlgorithm, ProtocolVersion, AEAD_EXPLICIT_NONCE_LEN,
    AEAD_FIXED_IV_LEN, AEAD_TAG_LEN,
};
use crate::error::{Error, Result};

/// How many sequence numbers past the last known one are tried when the
/// stream was resynchronized after loss.
pub const RESYNC_WINDOW: u64 = 512;

pub struct RecordCipher {
    state: CipherState,
    version: ProtocolVersion,
    seq: u64,
    /// Sequence number is unknown after a repair-mode jump.
    resync: bool,
}

enum CipherState {
    Aead(AeadKeys),
    Cbc(CbcKeys),
}

struct AeadKeys {
    key: LessSafeKey,
    salt: [u8; AEAD_FIXED_IV_LEN],
}

struct CbcKeys {
    cipher: Cipher,
    key: Zeroizing<Vec<u8>>,
    mac_key: hmac::Key,
    mac_len: usize,
    block_len: usize,
    /// Chained IV (TLS 1.0 only).
    chained_iv: Option<Vec<u8>>,
}

impl Drop for AeadKeys {
    fn drop(&mut self) {
        self.salt.zeroize();
    }
}

fn mac_algorithm(mac: MacAlgorithm) -> hmac::Algorithm {
    match mac {
        MacAlgorithm::Sha1 => hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
        MacAlgorithm::Sha256 => hmac::HMAC_SHA256,
        MacAlgorithm::Sha384 => hmac::HMAC_SHA384,
    }
}

fn cbc_cipher(bulk: BulkCipher) -> Result<Cipher> {
    match bulk {
        BulkCipher::TripleDesCbc => Ok(Cipher::des_ede3_cbc()),
        BulkCipher::Aes128Cbc => Ok(Cipher::aes_128_cbc()),
        BulkCipher::Aes256Cbc => Ok(Cipher::aes_256_cbc()),
        BulkCipher::Aes128Gcm | BulkCipher::Aes256Gcm => {
            Err(Error::Crypto("AEAD cipher used as CBC".into()))
        }
    }
}

/// seq(8) + type(1) + version(2) + length(2)
fn additional_data(seq: u64, content_type: u8, version: u16, len: usize) -> [u8; 13] {
    let mut ad = [0u8; 13];
    ad[..8].copy_from_slice(&seq.to_be_bytes());
    ad[8] = content_type;
    ad[9..11].copy_from_slice(&version.to_be_bytes());
    ad[11..].copy_from_slice(&(len as u16).to_be_bytes());
    ad
}

impl RecordCipher {
    pub fn new(
        suite: &CipherSuite,
        version: ProtocolVersion,
        mac_key: &[u8],
        key: &[u8],
        iv: &[u8],
    ) -> Result<Self> {
        let state = match suite.mac {
            None => {
                let algo = match suite.bulk {
                    BulkCipher::Aes128Gcm => &aead::AES_128_GCM,
                    BulkCipher::Aes256Gcm => &aead::AES_256_GCM,
                    _ => return Err(Error::Crypto("CBC cipher used as AEAD".into())),
                };
                let unbound = UnboundKey::new(algo, key)
                    .map_err(|_| Error::Crypto("invalid AEAD key".into()))?;
                let mut salt = [0u8; AEAD_FIXED_IV_LEN];
                if iv.len() != AEAD_FIXED_IV_LEN {
                    return Err(Error::Crypto("invalid AEAD salt".into()));
                }
                salt.copy_from_slice(iv);
                CipherState::Aead(AeadKeys {
                    key: LessSafeKey::new(unbound),
                    salt,
                })
            }
            Some(mac) => {
                let block_len = suite.bulk.block_len();
                let chained_iv = if version == ProtocolVersion::Tls10 {
                    if iv.len() != block_len {
                        return Err(Error::Crypto("invalid CBC IV".into()));
                    }
                    Some(iv.to_vec())
                } else {
                    None
                };
                CipherState::Cbc(CbcKeys {
                    cipher: cbc_cipher(suite.bulk)?,
                    key: Zeroizing::new(key.to_vec()),
                    mac_key: hmac::Key::new(mac_algorithm(mac), mac_key),
                    mac_len: mac.len(),
                    block_len,
                    chained_iv,
                })
            }
        };
        Ok(RecordCipher {
            state,
            version,
            seq: 0,
            resync: false,
        })
    }

    pub fn seq_num(&self) -> u64 {
        self.seq
    }

    pub fn is_resyncing(&self) -> bool {
        self.resync
    }

    /// Forget the record sequence position. The next records search a
    /// window of sequence numbers instead of failing on the first mismatch.
    pub fn begin_resync(&mut self) {
        self.resync = true;
        if let CipherState::Cbc(cbc) = &mut self.state {
            if cbc.chained_iv.is_some() {
                // The chained IV is lost with the data; it is recovered from
                // the next record's last ciphertext block.
                cbc.chained_iv = Some(Vec::new());
            }
        }
    }

    /// Decrypt one record fragment and verify its integrity.
    ///
    /// While resynchronizing, records that cannot be placed return
    /// `Error::ResyncPending` instead of an authentication failure.
    pub fn decrypt(&mut self, content_type: u8, version: u16, fragment: &[u8]) -> Result<Vec<u8>> {
        if self.seq == u64::MAX {
            return Err(Error::Crypto("TLS sequence number overflow".into()));
        }
        let result = match &mut self.state {
            CipherState::Aead(keys) => {
                decrypt_aead(keys, self.seq, self.resync, content_type, version, fragment)
            }
            CipherState::Cbc(keys) => decrypt_cbc(
                keys,
                self.version,
                self.seq,
                self.resync,
                content_type,
                version,
                fragment,
            ),
        };
        match result {
            Ok((plaintext, used_seq)) => {
                self.seq = used_seq + 1;
                self.resync = false;
                Ok(plaintext)
            }
            Err(Error::BadRecordMac | Error::BadPadding) if self.resync => Err(Error::ResyncPending),
            Err(e) => Err(e),
        }
    }
}

fn decrypt_aead(
    keys: &AeadKeys,
    seq: u64,
    resync: bool,
    content_type: u8,
    version: u16,
    fragment: &[u8],
) -> Result<(Vec<u8>, u64)> {
    if fragment.len() < AEAD_EXPLICIT_NONCE_LEN + AEAD_TAG_LEN {
        return Err(Error::BadRecordMac);
    }
    // nonce = implicit salt(4) || explicit nonce(8)
    let (explicit, sealed) = fragment.split_at(AEAD_EXPLICIT_NONCE_LEN);
    let mut nonce = [0u8; 12];
    nonce[..AEAD_FIXED_IV_LEN].copy_from_slice(&keys.salt);
    nonce[AEAD_FIXED_IV_LEN..].copy_from_slice(explicit);
    let plain_len = sealed.len() - AEAD_TAG_LEN;

    let candidates = if resync { RESYNC_WINDOW } else { 1 };
    for candidate in seq..seq.saturating_add(candidates) {
        let ad = additional_data(candidate, content_type, version, plain_len);
        let mut buf = sealed.to_vec();
        let nonce = aead::Nonce::assume_unique_for_key(nonce);
        if let Ok(plain) = keys.key.open_in_place(nonce, aead::Aad::from(ad), &mut buf) {
            let len = plain.len();
            buf.truncate(len);
            return Ok((buf, candidate));
        }
    }
    Err(Error::BadRecordMac)
}

fn decrypt_cbc(
    keys: &mut CbcKeys,
    version: ProtocolVersion,
    seq: u64,
    resync: bool,
    content_type: u8,
    wire_version: u16,
    fragment: &[u8],
) -> Result<(Vec<u8>, u64)> {
    let block = keys.block_len;
    let (iv, body) = match &keys.chained_iv {
        Some(chained) => (chained.clone(), fragment),
        None => {
            if fragment.len() < block {
                return Err(Error::BadRecordMac);
            }
            let (iv, body) = fragment.split_at(block);
            (iv.to_vec(), body)
        }
    };
    if body.is_empty() || body.len() % block != 0 || body.len() < keys.mac_len + 1 {
        return Err(Error::BadRecordMac);
    }

    if version == ProtocolVersion::Tls10 {
        // The next record chains from this record's last ciphertext block,
        // whether or not this one decrypts.
        keys.chained_iv = Some(body[body.len() - block..].to_vec());
        if iv.is_empty() {
            return Err(Error::ResyncPending);
        }
    }

    let mut crypter = Crypter::new(keys.cipher, Mode::Decrypt, &keys.key, Some(&iv))?;
    crypter.pad(false);
    let mut plain = Zeroizing::new(vec![0u8; body.len() + block]);
    let mut n = crypter.update(body, &mut plain)?;
    n += crypter.finalize(&mut plain[n..])?;
    plain.truncate(n);

    let pad = *plain.last().ok_or(Error::BadPadding)? as usize;
    if pad + 1 + keys.mac_len > plain.len() {
        return Err(Error::BadPadding);
    }
    let content_len = plain.len() - pad - 1 - keys.mac_len;
    if plain[content_len + keys.mac_len..].iter().any(|&b| b as usize != pad) {
        return Err(Error::BadPadding);
    }
    let content = &plain[..content_len];
    let tag = &plain[content_len..content_len + keys.mac_len];

    let candidates = if resync { RESYNC_WINDOW } else { 1 };
    for candidate in seq..seq.saturating_add(candidates) {
        let ad = additional_data(candidate, content_type, wire_version, content_len);
        let mut ctx = hmac::Context::with_key(&keys.mac_key);
        ctx.update(&ad);
        ctx.update(content);
        if ctx.sign().as_ref() == tag {
            return Ok((content.to_vec(), candidate));
        }
    }
    Err(Error::BadRecordMac)
}
