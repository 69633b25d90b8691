//! The cryptographic collaborator behind the record parser.
//!
//! A session owns two engines, one per direction. Both see the same
//! handshake parameters and derive the same master secret; each only ever
//! decrypts the records travelling in its own direction.

use zeroize::Zeroizing;

use super::cipher::RecordCipher;
use super::kdf::{self, MASTER_SECRET_LEN};
use super::suites::{self, CipherSuite, ProtocolVersion};
use crate::error::{Error, Result};
use crate::protocol::Direction;

/// Where the master secret comes from.
pub enum SecretSource<'a> {
    /// Full handshake. `session_transcript` is set when the extended master
    /// secret was negotiated and holds the handshake messages up to and
    /// including ClientKeyExchange.
    PreMaster {
        secret: &'a [u8],
        session_transcript: Option<&'a [u8]>,
    },
    /// Abbreviated handshake resuming a cached master secret.
    Resumed(&'a [u8]),
}

pub trait TlsEngine: Send {
    /// Direction whose records this engine decrypts.
    fn direction(&self) -> Direction;

    fn set_randoms(&mut self, client: &[u8; 32], server: &[u8; 32]);
    fn client_random(&self) -> Option<&[u8; 32]>;
    fn server_random(&self) -> Option<&[u8; 32]>;

    /// Select the negotiated suite and protocol version for the pending state.
    fn set_cipher_spec(&mut self, suite: u16, version: u16) -> Result<()>;
    fn version(&self) -> Option<ProtocolVersion>;
    fn suite(&self) -> Option<&'static CipherSuite>;

    fn derive_master_secret(&mut self, source: SecretSource<'_>) -> Result<()>;
    fn master_secret(&self) -> Option<&[u8]>;

    /// Expand the master secret into the pending record keys.
    fn derive_working_keys(&mut self) -> Result<()>;
    fn has_pending_keys(&self) -> bool;

    /// Activate the pending keys; fails when none were derived.
    fn change_cipher_spec(&mut self) -> Result<()>;

    fn decrypt_record(&mut self, content_type: u8, version: u16, fragment: &[u8]) -> Result<Vec<u8>>;

    /// Check a Finished message sent in this engine's direction against the
    /// handshake messages that precede it.
    fn verify_finished(&self, verify_data: &[u8], transcript: &[u8]) -> Result<()>;

    /// The record stream jumped past lost data; the record sequence number
    /// must be rediscovered.
    fn resync(&mut self);

    /// Drop secrets that are only needed until both Finished messages verify.
    fn release_handshake_material(&mut self);
}

/// Builds the engine for one direction of a new session.
pub type EngineFactory = fn(Direction) -> Box<dyn TlsEngine>;

pub fn default_factory(direction: Direction) -> Box<dyn TlsEngine> {
    Box::new(CipherEngine::new(direction))
}

/// Default [`TlsEngine`] built on `ring` and `openssl`.
pub struct CipherEngine {
    direction: Direction,
    client_random: Option<[u8; 32]>,
    server_random: Option<[u8; 32]>,
    suite: Option<&'static CipherSuite>,
    version: Option<ProtocolVersion>,
    master: Option<Zeroizing<Vec<u8>>>,
    pending: Option<RecordCipher>,
    current: Option<RecordCipher>,
}

impl CipherEngine {
    pub fn new(direction: Direction) -> Self {
        CipherEngine {
            direction,
            client_random: None,
            server_random: None,
            suite: None,
            version: None,
            master: None,
            pending: None,
            current: None,
        }
    }

    fn params(&self) -> Result<(&'static CipherSuite, ProtocolVersion)> {
        match (self.suite, self.version) {
            (Some(s), Some(v)) => Ok((s, v)),
            _ => Err(Error::KeysNotDerived),
        }
    }

    fn randoms(&self) -> Result<(&[u8; 32], &[u8; 32])> {
        match (&self.client_random, &self.server_random) {
            (Some(c), Some(s)) => Ok((c, s)),
            _ => Err(Error::UnexpectedMessage("key derivation before both hellos")),
        }
    }
}

impl TlsEngine for CipherEngine {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn set_randoms(&mut self, client: &[u8; 32], server: &[u8; 32]) {
        self.client_random = Some(*client);
        self.server_random = Some(*server);
    }

    fn client_random(&self) -> Option<&[u8; 32]> {
        self.client_random.as_ref()
    }

    fn server_random(&self) -> Option<&[u8; 32]> {
        self.server_random.as_ref()
    }

    fn set_cipher_spec(&mut self, suite: u16, version: u16) -> Result<()> {
        let version = ProtocolVersion::from_wire(version)?;
        let suite = suites::lookup(suite)?;
        if !suite.allowed_with(version) {
            return Err(Error::UnsupportedCipherSuite(suite.id));
        }
        self.suite = Some(suite);
        self.version = Some(version);
        self.master = None;
        self.pending = None;
        Ok(())
    }

    fn version(&self) -> Option<ProtocolVersion> {
        self.version
    }

    fn suite(&self) -> Option<&'static CipherSuite> {
        self.suite
    }

    fn derive_master_secret(&mut self, source: SecretSource<'_>) -> Result<()> {
        let (suite, version) = self.params()?;
        let master = match source {
            SecretSource::PreMaster {
                secret,
                session_transcript: Some(transcript),
            } => kdf::extended_master_secret(version, suite, secret, transcript)?,
            SecretSource::PreMaster {
                secret,
                session_transcript: None,
            } => {
                let (cr, sr) = self.randoms()?;
                kdf::master_secret(version, suite, secret, cr, sr)?
            }
            SecretSource::Resumed(master) => {
                if master.len() != MASTER_SECRET_LEN {
                    return Err(Error::Crypto("cached master secret has wrong length".into()));
                }
                Zeroizing::new(master.to_vec())
            }
        };
        self.master = Some(master);
        Ok(())
    }

    fn master_secret(&self) -> Option<&[u8]> {
        self.master.as_ref().map(|m| m.as_slice())
    }

    fn derive_working_keys(&mut self) -> Result<()> {
        let (suite, version) = self.params()?;
        let master = self.master.as_ref().ok_or(Error::KeysNotDerived)?;
        let (cr, sr) = self.randoms()?;
        let kb = kdf::key_block(version, suite, master, cr, sr)?;
        let cipher = match self.direction {
            Direction::ClientToServer => {
                RecordCipher::new(suite, version, &kb.client_mac, &kb.client_key, &kb.client_iv)?
            }
            Direction::ServerToClient => {
                RecordCipher::new(suite, version, &kb.server_mac, &kb.server_key, &kb.server_iv)?
            }
        };
        self.pending = Some(cipher);
        Ok(())
    }

    fn has_pending_keys(&self) -> bool {
        self.pending.is_some()
    }

    fn change_cipher_spec(&mut self) -> Result<()> {
        let pending = self.pending.take().ok_or(Error::KeysNotDerived)?;
        self.current = Some(pending);
        Ok(())
    }

    fn decrypt_record(&mut self, content_type: u8, version: u16, fragment: &[u8]) -> Result<Vec<u8>> {
        let current = self.current.as_mut().ok_or(Error::KeysNotDerived)?;
        current.decrypt(content_type, version, fragment)
    }

    fn verify_finished(&self, verify_data: &[u8], transcript: &[u8]) -> Result<()> {
        let (suite, version) = self.params()?;
        let master = self.master.as_ref().ok_or(Error::KeysNotDerived)?;
        let label: &[u8] = match self.direction {
            Direction::ClientToServer => b"client finished",
            Direction::ServerToClient => b"server finished",
        };
        let expected = kdf::finished_verify_data(version, suite, master, label, transcript)?;
        if expected.as_slice() == verify_data {
            Ok(())
        } else {
            Err(Error::BadFinished)
        }
    }

    fn resync(&mut self) {
        if let Some(current) = self.current.as_mut() {
            current.begin_resync();
        }
    }

    fn release_handshake_material(&mut self) {
        self.master = None;
        self.pending = None;
    }
}
