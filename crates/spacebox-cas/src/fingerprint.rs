//! Content fingerprints ("BETag").
//!
//! A fingerprint is `[size_class:1][digest:16]`, hex encoded to 34 chars.
//! The digest is windowed so it can be computed incrementally while parts
//! of an upload land in any order:
//!
//! ```text
//! size <= W : md5(bytes)
//! size >  W : md5(md5(w0) || md5(w1) || ... || md5(wn))
//! ```
//!
//! where `W` is [`WINDOW_SIZE`] and `wi` is the i-th window of the object
//! (the last one truncated to the object size).

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Alignment window size (4 MiB). Also the advertised part size.
pub const WINDOW_SIZE: u64 = 4 * 1024 * 1024;

/// Length of a window digest in bytes.
pub const DIGEST_LEN: usize = 16;

/// Hex length of a fingerprint without the size-class byte.
pub const SHORT_HEX_LEN: usize = DIGEST_LEN * 2;

/// Hex length of a canonical fingerprint.
pub const FULL_HEX_LEN: usize = SHORT_HEX_LEN + 2;

/// Raw window digest.
pub type Digest = [u8; DIGEST_LEN];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("fingerprint must be 32 or 34 hex chars, got {0}")]
    InvalidLength(usize),

    #[error("fingerprint is not valid hex: {0}")]
    InvalidHex(String),

    #[error("size class mismatch: fingerprint says {declared}, size {size} implies {expected}")]
    SizeClassMismatch { declared: u8, expected: u8, size: u64 },
}

/// `floor(log2(size))`, with `0` for an empty object.
#[inline]
pub fn size_class(size: u64) -> u8 {
    if size == 0 {
        0
    } else {
        (63 - size.leading_zeros()) as u8
    }
}

/// Number of alignment windows covering `size` bytes.
#[inline]
pub fn window_count(size: u64) -> u64 {
    size.div_ceil(WINDOW_SIZE)
}

/// Byte range `[start, end)` of window `index` in an object of `size` bytes.
#[inline]
pub fn window_bounds(index: u64, size: u64) -> (u64, u64) {
    let start = index * WINDOW_SIZE;
    (start, (start + WINDOW_SIZE).min(size))
}

/// Digest of a byte slice.
#[inline]
pub fn digest_bytes(data: &[u8]) -> Digest {
    md5::compute(data).0
}

/// Parse a 32-char hex MD5 (as sent alongside an upload part).
pub fn parse_digest(hex_str: &str) -> Result<Digest, FingerprintError> {
    if hex_str.len() != SHORT_HEX_LEN {
        return Err(FingerprintError::InvalidLength(hex_str.len()));
    }
    let mut digest = [0u8; DIGEST_LEN];
    hex::decode_to_slice(hex_str, &mut digest)
        .map_err(|_| FingerprintError::InvalidHex(hex_str.to_string()))?;
    Ok(digest)
}

/// Streaming digest.
pub struct WindowHasher {
    ctx: md5::Context,
}

impl WindowHasher {
    pub fn new() -> Self {
        Self {
            ctx: md5::Context::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.ctx.consume(data);
    }

    pub fn finish(self) -> Digest {
        self.ctx.compute().0
    }
}

impl Default for WindowHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Writer that feeds everything it forwards into up to two hashers.
///
/// `window` is the in-memory hash of an aligned window; `range` covers the
/// whole part body (used for the per-part checksum).
pub struct HashingWriter<'a, W: Write> {
    inner: W,
    window: Option<&'a mut WindowHasher>,
    range: Option<&'a mut WindowHasher>,
}

impl<'a, W: Write> HashingWriter<'a, W> {
    pub fn new(
        inner: W,
        window: Option<&'a mut WindowHasher>,
        range: Option<&'a mut WindowHasher>,
    ) -> Self {
        Self {
            inner,
            window,
            range,
        }
    }
}

impl<W: Write> Write for HashingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if let Some(h) = self.window.as_deref_mut() {
            h.update(&buf[..n]);
        }
        if let Some(h) = self.range.as_deref_mut() {
            h.update(&buf[..n]);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Self-describing content fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint {
    size_class: u8,
    digest: Digest,
}

impl Fingerprint {
    pub fn new(size_class: u8, digest: Digest) -> Self {
        Self { size_class, digest }
    }

    /// Combine per-window digests into the object fingerprint.
    ///
    /// For objects of at most one window the single window digest is the
    /// content digest; larger objects hash the concatenated window digests.
    pub fn from_windows(size: u64, windows: &[Digest]) -> Self {
        let digest = if size <= WINDOW_SIZE && windows.len() == 1 {
            windows[0]
        } else {
            let mut outer = WindowHasher::new();
            for w in windows {
                outer.update(w);
            }
            outer.finish()
        };
        Self::new(size_class(size), digest)
    }

    /// Accept a 32 or 34 char fingerprint for an object of `size` bytes and
    /// return the canonical form.
    pub fn normalize(hex_str: &str, size: u64) -> Result<Self, FingerprintError> {
        let expected = size_class(size);
        match hex_str.len() {
            SHORT_HEX_LEN => Ok(Self::new(expected, parse_digest(hex_str)?)),
            FULL_HEX_LEN => {
                let fp = Self::parse(hex_str)?;
                if fp.size_class != expected {
                    return Err(FingerprintError::SizeClassMismatch {
                        declared: fp.size_class,
                        expected,
                        size,
                    });
                }
                Ok(fp)
            }
            n => Err(FingerprintError::InvalidLength(n)),
        }
    }

    /// Parse a canonical 34-char fingerprint.
    pub fn parse(hex_str: &str) -> Result<Self, FingerprintError> {
        if hex_str.len() != FULL_HEX_LEN {
            return Err(FingerprintError::InvalidLength(hex_str.len()));
        }
        let mut raw = [0u8; DIGEST_LEN + 1];
        hex::decode_to_slice(hex_str, &mut raw)
            .map_err(|_| FingerprintError::InvalidHex(hex_str.to_string()))?;
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&raw[1..]);
        Ok(Self::new(raw[0], digest))
    }

    pub fn size_class(&self) -> u8 {
        self.size_class
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn to_hex(&self) -> String {
        let mut raw = Vec::with_capacity(DIGEST_LEN + 1);
        raw.push(self.size_class);
        raw.extend_from_slice(&self.digest);
        hex::encode(raw)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = FingerprintError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.to_hex()
    }
}

/// Fingerprint an in-memory object.
pub fn fingerprint_bytes(data: &[u8]) -> Fingerprint {
    let size = data.len() as u64;
    let windows: Vec<Digest> = if data.is_empty() {
        vec![digest_bytes(data)]
    } else {
        data.chunks(WINDOW_SIZE as usize).map(digest_bytes).collect()
    };
    Fingerprint::from_windows(size, &windows)
}

/// Fingerprint `size` bytes read from `reader`, one window at a time.
pub fn fingerprint_reader<R: Read>(reader: R, size: u64) -> io::Result<Fingerprint> {
    let mut reader = reader;
    let count = window_count(size).max(1);
    let mut windows = Vec::with_capacity(count as usize);
    let mut buf = vec![0u8; 64 * 1024];

    for index in 0..count {
        let (start, end) = window_bounds(index, size);
        let mut remaining = end - start;
        let mut hasher = WindowHasher::new();
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = reader.read(&mut buf[..want])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("object ended {} bytes early", remaining),
                ));
            }
            hasher.update(&buf[..n]);
            remaining -= n as u64;
        }
        windows.push(hasher.finish());
    }

    Ok(Fingerprint::from_windows(size, &windows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_class() {
        assert_eq!(size_class(0), 0);
        assert_eq!(size_class(1), 0);
        assert_eq!(size_class(2), 1);
        assert_eq!(size_class(3), 1);
        assert_eq!(size_class(1024), 10);
        assert_eq!(size_class(WINDOW_SIZE), 22);
        assert_eq!(size_class(8 * 1024 * 1024), 23);
        assert_eq!(size_class(u64::MAX), 63);
    }

    #[test]
    fn test_window_math() {
        assert_eq!(window_count(0), 0);
        assert_eq!(window_count(1), 1);
        assert_eq!(window_count(WINDOW_SIZE), 1);
        assert_eq!(window_count(WINDOW_SIZE + 1), 2);
        assert_eq!(window_bounds(1, WINDOW_SIZE + 10), (WINDOW_SIZE, WINDOW_SIZE + 10));
    }

    #[test]
    fn test_small_object_is_plain_digest() {
        let data = b"hello spacebox";
        let fp = fingerprint_bytes(data);
        assert_eq!(fp.size_class(), size_class(data.len() as u64));
        assert_eq!(fp.digest(), &md5::compute(data).0);
        assert_eq!(fp.to_hex().len(), FULL_HEX_LEN);
    }

    #[test]
    fn test_large_object_hashes_window_digests() {
        let data: Vec<u8> = (0..(WINDOW_SIZE as usize * 2)).map(|i| (i % 251) as u8).collect();
        let w0 = md5::compute(&data[..WINDOW_SIZE as usize]).0;
        let w1 = md5::compute(&data[WINDOW_SIZE as usize..]).0;
        let mut concat = Vec::new();
        concat.extend_from_slice(&w0);
        concat.extend_from_slice(&w1);

        let fp = fingerprint_bytes(&data);
        assert_eq!(fp.size_class(), 23);
        assert_eq!(fp.digest(), &md5::compute(&concat).0);
    }

    #[test]
    fn test_reader_matches_bytes() {
        let data: Vec<u8> = (0..(WINDOW_SIZE as usize + 12345)).map(|i| (i * 7) as u8).collect();
        let from_reader = fingerprint_reader(&data[..], data.len() as u64).unwrap();
        assert_eq!(from_reader, fingerprint_bytes(&data));
    }

    #[test]
    fn test_reader_short_input() {
        let err = fingerprint_reader(&b"abc"[..], 10).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_normalize_accepts_both_forms() {
        let data = b"normalize me";
        let fp = fingerprint_bytes(data);
        let full = fp.to_hex();
        let short = &full[2..];

        assert_eq!(Fingerprint::normalize(&full, data.len() as u64).unwrap(), fp);
        assert_eq!(Fingerprint::normalize(short, data.len() as u64).unwrap(), fp);
        assert_eq!(
            Fingerprint::normalize(&full.to_uppercase(), data.len() as u64).unwrap(),
            fp
        );
    }

    #[test]
    fn test_normalize_rejects_bad_input() {
        let fp = fingerprint_bytes(b"x");
        assert!(matches!(
            Fingerprint::normalize(&fp.to_hex(), 1 << 20),
            Err(FingerprintError::SizeClassMismatch { .. })
        ));
        assert!(matches!(
            Fingerprint::normalize("abc", 1),
            Err(FingerprintError::InvalidLength(3))
        ));
        assert!(matches!(
            Fingerprint::normalize(&"zz".repeat(16), 1),
            Err(FingerprintError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let fp = fingerprint_bytes(b"serde");
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{}\"", fp.to_hex()));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }

    #[test]
    fn test_hashing_writer_feeds_both_hashers() {
        let mut window = WindowHasher::new();
        let mut range = WindowHasher::new();
        let mut out = Vec::new();
        {
            let mut w = HashingWriter::new(&mut out, Some(&mut window), Some(&mut range));
            w.write_all(b"abcdef").unwrap();
        }
        assert_eq!(out, b"abcdef");
        assert_eq!(window.finish(), md5::compute(b"abcdef").0);
        assert_eq!(range.finish(), md5::compute(b"abcdef").0);
    }
}
