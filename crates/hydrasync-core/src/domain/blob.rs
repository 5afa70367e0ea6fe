//! Placeholder custom blob codec
//!
//! Every placeholder carries a small opaque blob owned by the sync core. It
//! stores the fingerprint of the last successful sync, the original path,
//! the current lock record and the conflict flag, so that this state
//! survives a process restart.
//!
//! ## Format
//!
//! Version 1 (the only format written):
//!
//! ```text
//! "HSB" | version: u8 = 1 | field*
//! field = tag: u8 | len: u16 LE | bytes[len]
//! ```
//!
//! | Tag | Field          | Encoding                     |
//! |-----|----------------|------------------------------|
//! | 1   | fingerprint    | UTF-8                        |
//! | 2   | original path  | UTF-8                        |
//! | 3   | lock record    | JSON                         |
//! | 4   | auxiliary      | raw bytes                    |
//! | 5   | conflicted     | one byte, present when set   |
//!
//! Unknown tags are skipped. Blobs without the magic prefix are read with
//! the legacy layout: two 7-bit varint length-prefixed UTF-8 strings
//! (fingerprint, original path), then an `i32` LE length and that many
//! auxiliary bytes. The legacy layout is never written.

use thiserror::Error;

use super::lock::LockRecord;
use super::newtypes::Fingerprint;

const MAGIC: &[u8; 3] = b"HSB";
const VERSION: u8 = 1;

const TAG_FINGERPRINT: u8 = 1;
const TAG_ORIGINAL_PATH: u8 = 2;
const TAG_LOCK: u8 = 3;
const TAG_AUXILIARY: u8 = 4;
const TAG_CONFLICTED: u8 = 5;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("blob truncated while reading {0}")]
    Truncated(&'static str),

    #[error("unsupported blob version {0}")]
    UnsupportedVersion(u8),

    #[error("blob field {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("blob fingerprint is invalid: {0}")]
    InvalidFingerprint(String),

    #[error("blob lock record is invalid: {0}")]
    InvalidLock(#[from] serde_json::Error),
}

/// Decoded contents of a placeholder blob
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaceholderBlob {
    pub fingerprint: Option<Fingerprint>,
    pub original_path: String,
    pub lock: Option<LockRecord>,
    pub conflicted: bool,
    pub auxiliary: Vec<u8>,
}

impl PlaceholderBlob {
    /// Size limit imposed by the materialization layer
    pub const MAX_SIZE: usize = 4096;

    pub fn new(original_path: impl Into<String>) -> Self {
        Self {
            original_path: original_path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_fingerprint(mut self, fp: Fingerprint) -> Self {
        self.fingerprint = Some(fp);
        self
    }

    /// Lock record, ignoring an expired one
    pub fn active_lock(&self) -> Option<&LockRecord> {
        self.lock.as_ref().filter(|l| !l.is_expired())
    }

    /// Encode in the current tagged format
    ///
    /// # Errors
    /// `BlobError::TooLarge` if the encoding exceeds [`Self::MAX_SIZE`]
    pub fn encode(&self) -> Result<Vec<u8>, BlobError> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(MAGIC);
        out.push(VERSION);

        if let Some(fp) = &self.fingerprint {
            push_field(&mut out, TAG_FINGERPRINT, fp.as_str().as_bytes())?;
        }
        if !self.original_path.is_empty() {
            push_field(&mut out, TAG_ORIGINAL_PATH, self.original_path.as_bytes())?;
        }
        if let Some(lock) = &self.lock {
            push_field(&mut out, TAG_LOCK, &serde_json::to_vec(lock)?)?;
        }
        if !self.auxiliary.is_empty() {
            push_field(&mut out, TAG_AUXILIARY, &self.auxiliary)?;
        }
        if self.conflicted {
            push_field(&mut out, TAG_CONFLICTED, &[1])?;
        }

        if out.len() > Self::MAX_SIZE {
            return Err(BlobError::TooLarge {
                size: out.len(),
                limit: Self::MAX_SIZE,
            });
        }
        Ok(out)
    }

    /// Decode a blob in either the tagged or the legacy layout
    ///
    /// An empty blob decodes to the default (never synced) state.
    pub fn decode(bytes: &[u8]) -> Result<Self, BlobError> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        if bytes.len() > Self::MAX_SIZE {
            return Err(BlobError::TooLarge {
                size: bytes.len(),
                limit: Self::MAX_SIZE,
            });
        }
        match bytes.strip_prefix(MAGIC.as_slice()) {
            Some(rest) => Self::decode_tagged(rest),
            None => Self::decode_legacy(bytes),
        }
    }

    fn decode_tagged(bytes: &[u8]) -> Result<Self, BlobError> {
        let mut reader = Reader::new(bytes);
        let version = reader.u8("version")?;
        if version < VERSION {
            return Err(BlobError::UnsupportedVersion(version));
        }

        let mut blob = Self::default();
        while !reader.is_empty() {
            let tag = reader.u8("field tag")?;
            let len = usize::from(reader.u16_le("field length")?);
            let value = reader.take(len, "field value")?;
            match tag {
                TAG_FINGERPRINT => blob.fingerprint = Some(parse_fingerprint(value)?),
                TAG_ORIGINAL_PATH => blob.original_path = utf8(value, "original path")?,
                TAG_LOCK => blob.lock = Some(serde_json::from_slice(value)?),
                TAG_AUXILIARY => blob.auxiliary = value.to_vec(),
                TAG_CONFLICTED => blob.conflicted = value.first().is_some_and(|b| *b != 0),
                _ => {}
            }
        }
        Ok(blob)
    }

    fn decode_legacy(bytes: &[u8]) -> Result<Self, BlobError> {
        let mut reader = Reader::new(bytes);
        let fingerprint = reader.varint_string("fingerprint")?;
        let original_path = reader.varint_string("original path")?;
        let aux_len = reader.i32_le("auxiliary length")?;
        let aux_len = usize::try_from(aux_len).map_err(|_| BlobError::Truncated("auxiliary"))?;
        let auxiliary = reader.take(aux_len, "auxiliary")?.to_vec();

        let fingerprint = if fingerprint.is_empty() {
            None
        } else {
            Some(parse_fingerprint(fingerprint.as_bytes())?)
        };

        Ok(Self {
            fingerprint,
            original_path,
            lock: None,
            conflicted: false,
            auxiliary,
        })
    }
}

fn push_field(out: &mut Vec<u8>, tag: u8, value: &[u8]) -> Result<(), BlobError> {
    let len = u16::try_from(value.len()).map_err(|_| BlobError::TooLarge {
        size: value.len(),
        limit: PlaceholderBlob::MAX_SIZE,
    })?;
    out.push(tag);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(value);
    Ok(())
}

fn utf8(bytes: &[u8], field: &'static str) -> Result<String, BlobError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| BlobError::InvalidUtf8(field))
}

fn parse_fingerprint(bytes: &[u8]) -> Result<Fingerprint, BlobError> {
    let s = utf8(bytes, "fingerprint")?;
    Fingerprint::new(s).map_err(|e| BlobError::InvalidFingerprint(e.to_string()))
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], BlobError> {
        if self.buf.len() < n {
            return Err(BlobError::Truncated(what));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, BlobError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16_le(&mut self, what: &'static str) -> Result<u16, BlobError> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn i32_le(&mut self, what: &'static str) -> Result<i32, BlobError> {
        let b = self.take(4, what)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Length prefix in 7-bit groups, low group first
    fn varint(&mut self, what: &'static str) -> Result<usize, BlobError> {
        let mut value: usize = 0;
        for shift in (0..35).step_by(7) {
            let byte = self.u8(what)?;
            value |= usize::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(BlobError::Truncated(what))
    }

    fn varint_string(&mut self, what: &'static str) -> Result<String, BlobError> {
        let len = self.varint(what)?;
        let bytes = self.take(len, what)?;
        utf8(bytes, what)
    }
}
