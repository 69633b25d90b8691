//! TLS 1.0-1.2 key derivation: PRF, master secret, key block, Finished.

use openssl::hash::{hash, MessageDigest};
use openssl::pkey::PKey;
use openssl::sign::Signer;
use ring::{digest, hmac};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::suites::{CipherSuite, PrfHash, ProtocolVersion};
use crate::error::Result;

pub const MASTER_SECRET_LEN: usize = 48;
pub const VERIFY_DATA_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HmacHash {
    Md5,
    Sha1,
    Sha256,
    Sha384,
}

fn hmac_sign(alg: HmacHash, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let ring_alg = match alg {
        HmacHash::Md5 => {
            // ring has no MD5; the legacy PRF half goes through openssl.
            let pkey = PKey::hmac(key)?;
            let mut signer = Signer::new(MessageDigest::md5(), &pkey)?;
            signer.update(data)?;
            return Ok(signer.sign_to_vec()?);
        }
        HmacHash::Sha1 => hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
        HmacHash::Sha256 => hmac::HMAC_SHA256,
        HmacHash::Sha384 => hmac::HMAC_SHA384,
    };
    let key = hmac::Key::new(ring_alg, key);
    Ok(hmac::sign(&key, data).as_ref().to_vec())
}

/// P_hash from RFC 5246 section 5.
fn p_hash(alg: HmacHash, secret: &[u8], label_seed: &[u8], out_len: usize) -> Result<Vec<u8>> {
    // A(0) = label_seed, A(i) = HMAC(secret, A(i-1))
    let mut a = hmac_sign(alg, secret, label_seed)?;
    let mut result = Vec::with_capacity(out_len);

    while result.len() < out_len {
        let mut input = Vec::with_capacity(a.len() + label_seed.len());
        input.extend_from_slice(&a);
        input.extend_from_slice(label_seed);
        result.extend_from_slice(&hmac_sign(alg, secret, &input)?);
        let next = hmac_sign(alg, secret, &a)?;
        a.zeroize();
        a = next;
        input.zeroize();
    }

    a.zeroize();
    result.truncate(out_len);
    Ok(result)
}

/// The TLS PRF for `version`. TLS 1.2 uses P_SHA256 or P_SHA384 as the
/// suite dictates; TLS 1.0/1.1 XOR P_MD5 over the first half of the secret
/// with P_SHA1 over the second half.
pub fn prf(
    version: ProtocolVersion,
    hash: PrfHash,
    secret: &[u8],
    label: &[u8],
    seed: &[u8],
    out_len: usize,
) -> Result<Vec<u8>> {
    let mut label_seed = Zeroizing::new(Vec::with_capacity(label.len() + seed.len()));
    label_seed.extend_from_slice(label);
    label_seed.extend_from_slice(seed);

    if !version.uses_legacy_prf() {
        let alg = match hash {
            PrfHash::Sha256 => HmacHash::Sha256,
            PrfHash::Sha384 => HmacHash::Sha384,
        };
        return p_hash(alg, secret, &label_seed, out_len);
    }

    let half = secret.len().div_ceil(2);
    let s1 = &secret[..half];
    let s2 = &secret[secret.len() - half..];
    let mut md5 = p_hash(HmacHash::Md5, s1, &label_seed, out_len)?;
    let mut sha1 = p_hash(HmacHash::Sha1, s2, &label_seed, out_len)?;
    let out = md5.iter().zip(sha1.iter()).map(|(a, b)| a ^ b).collect();
    md5.zeroize();
    sha1.zeroize();
    Ok(out)
}

/// Hash of the handshake messages, as used by Finished and the extended
/// master secret session hash.
pub fn transcript_hash(
    version: ProtocolVersion,
    hash_alg: PrfHash,
    transcript: &[u8],
) -> Result<Vec<u8>> {
    if version.uses_legacy_prf() {
        let mut out = hash(MessageDigest::md5(), transcript)?.to_vec();
        out.extend_from_slice(digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, transcript).as_ref());
        return Ok(out);
    }
    let alg = match hash_alg {
        PrfHash::Sha256 => &digest::SHA256,
        PrfHash::Sha384 => &digest::SHA384,
    };
    Ok(digest::digest(alg, transcript).as_ref().to_vec())
}

pub fn master_secret(
    version: ProtocolVersion,
    suite: &CipherSuite,
    pre_master: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> Result<Zeroizing<Vec<u8>>> {
    let mut seed = [0u8; 64];
    seed[..32].copy_from_slice(client_random);
    seed[32..].copy_from_slice(server_random);
    let out = prf(
        version,
        suite.prf,
        pre_master,
        b"master secret",
        &seed,
        MASTER_SECRET_LEN,
    )?;
    Ok(Zeroizing::new(out))
}

/// RFC 7627 master secret over the session hash.
pub fn extended_master_secret(
    version: ProtocolVersion,
    suite: &CipherSuite,
    pre_master: &[u8],
    transcript: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let session_hash = transcript_hash(version, suite.prf, transcript)?;
    let out = prf(
        version,
        suite.prf,
        pre_master,
        b"extended master secret",
        &session_hash,
        MASTER_SECRET_LEN,
    )?;
    Ok(Zeroizing::new(out))
}

/// Working keys split out of the key block, in wire order.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyBlock {
    pub client_mac: Vec<u8>,
    pub server_mac: Vec<u8>,
    pub client_key: Vec<u8>,
    pub server_key: Vec<u8>,
    pub client_iv: Vec<u8>,
    pub server_iv: Vec<u8>,
}

pub fn key_block(
    version: ProtocolVersion,
    suite: &CipherSuite,
    master: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> Result<KeyBlock> {
    // key_block = PRF(master_secret, "key expansion", server_random + client_random)
    let mut seed = [0u8; 64];
    seed[..32].copy_from_slice(server_random);
    seed[32..].copy_from_slice(client_random);
    let block = Zeroizing::new(prf(
        version,
        suite.prf,
        master,
        b"key expansion",
        &seed,
        suite.key_block_len(version),
    )?);

    let mac = suite.mac_len();
    let key = suite.bulk.key_len();
    let iv = suite.fixed_iv_len(version);
    let mut offset = 0;
    let mut take = |n: usize| {
        let part = block[offset..offset + n].to_vec();
        offset += n;
        part
    };
    Ok(KeyBlock {
        client_mac: take(mac),
        server_mac: take(mac),
        client_key: take(key),
        server_key: take(key),
        client_iv: take(iv),
        server_iv: take(iv),
    })
}

/// verify_data = PRF(master, label, Hash(handshake_messages))[..12]
pub fn finished_verify_data(
    version: ProtocolVersion,
    suite: &CipherSuite,
    master: &[u8],
    label: &[u8],
    transcript: &[u8],
) -> Result<Vec<u8>> {
    let hash = transcript_hash(version, suite.prf, transcript)?;
    prf(version, suite.prf, master, label, &hash, VERIFY_DATA_LEN)
}
