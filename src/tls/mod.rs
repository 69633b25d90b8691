//! TLS record layer framing and the cryptographic engine behind it.

pub mod cache;
pub mod cipher;
pub mod engine;
pub mod handshake;
pub mod kdf;
pub mod suites;

use tls_parser::TlsRecordType;

use crate::error::{Error, Result};

pub const RECORD_HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
    Heartbeat,
}

impl ContentType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match TlsRecordType(value) {
            TlsRecordType::ChangeCipherSpec => Some(ContentType::ChangeCipherSpec),
            TlsRecordType::Alert => Some(ContentType::Alert),
            TlsRecordType::Handshake => Some(ContentType::Handshake),
            TlsRecordType::ApplicationData => Some(ContentType::ApplicationData),
            TlsRecordType::Heartbeat => Some(ContentType::Heartbeat),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ContentType::ChangeCipherSpec => 20,
            ContentType::Alert => 21,
            ContentType::Handshake => 22,
            ContentType::ApplicationData => 23,
            ContentType::Heartbeat => 24,
        }
    }
}

/// One framed record; `fragment` is still encrypted when the direction's
/// cipher is active.
#[derive(Debug)]
pub struct Record {
    pub content_type: ContentType,
    pub version: u16,
    pub fragment: Vec<u8>,
}

/// Validate a record header: known content type, SSL 3.x version, and a
/// declared length within `max_len`.
fn check_header(header: &[u8], max_len: usize) -> Result<(ContentType, u16, usize)> {
    let version = u16::from_be_bytes([header[1], header[2]]);
    let content_type = ContentType::from_u8(header[0])
        .filter(|_| header[1] == 3)
        .ok_or(Error::BadRecordHeader {
            content_type: header[0],
            version,
        })?;
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if len > max_len {
        return Err(Error::RecordTooLarge { len, max: max_len });
    }
    Ok((content_type, version, len))
}

/// Whether `data` plausibly begins a record. Used to pick the
/// resynchronization point after lost data.
pub fn looks_like_record_start(data: &[u8], max_len: usize) -> bool {
    data.len() >= RECORD_HEADER_LEN
        && check_header(data, max_len).is_ok_and(|(_, version, len)| {
            (0x0300..=0x0303).contains(&version) && (len > 0 || data[0] == 23)
        })
}

/// Stricter form of [`looks_like_record_start`] for scanning inside lost
/// data: every header reachable by following declared lengths within
/// `data` must also be plausible. A trailing header cut short by the end
/// of `data` only has to agree on the bytes present.
pub fn is_record_boundary(data: &[u8], max_len: usize) -> bool {
    let mut pos = 0;
    loop {
        let rest = &data[pos..];
        if pos > 0 && rest.len() < RECORD_HEADER_LEN {
            return rest.first().map_or(true, |t| ContentType::from_u8(*t).is_some())
                && rest.get(1).map_or(true, |major| *major == 3);
        }
        if !looks_like_record_start(rest, max_len) {
            return false;
        }
        let len = u16::from_be_bytes([rest[3], rest[4]]) as usize;
        pos += RECORD_HEADER_LEN + len;
        if pos >= data.len() {
            return true;
        }
    }
}

/// Cuts an in-order byte stream into records, holding partial records
/// until the rest arrives.
#[derive(Debug, Default)]
pub struct RecordReader {
    buf: Vec<u8>,
    offset: usize,
}

impl RecordReader {
    pub fn push(&mut self, data: &[u8]) {
        if self.offset > 0 {
            self.buf.drain(..self.offset);
            self.offset = 0;
        }
        self.buf.extend_from_slice(data);
    }

    pub fn pending(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.offset = 0;
    }

    pub fn next_record(&mut self, max_len: usize) -> Result<Option<Record>> {
        let remaining = &self.buf[self.offset..];

        // Need at least 5 bytes for a TLS record header
        if remaining.len() < RECORD_HEADER_LEN {
            return Ok(None);
        }
        let (content_type, version, len) = check_header(remaining, max_len)?;
        if remaining.len() < RECORD_HEADER_LEN + len {
            return Ok(None);
        }

        let record = Record {
            content_type,
            version,
            fragment: remaining[RECORD_HEADER_LEN..RECORD_HEADER_LEN + len].to_vec(),
        };
        self.offset += RECORD_HEADER_LEN + len;
        if self.offset == self.buf.len() {
            self.reset();
        }
        Ok(Some(record))
    }
}
