//! The swap-file metadata prefix.
//!
//! Every object spooled to disk starts with a small metadata header that
//! identifies which entry the bytes belong to. The prefix is a marker
//! byte, a declared total header size, and a chain of TLVs that are
//! validated against the entry before any body byte is trusted:
//!
//! ```text
//! byte  0      marker (0x03)
//! bytes 1..5   u32 LE total header size, preamble included
//! then         tag u8, len u32 LE, value ... until the header size is consumed
//! ```

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use thiserror::Error;
use tracing::debug;

use crate::entry::StoreEntry;

/// Marker byte that opens a well-formed metadata prefix.
pub const SWAP_META_OK: u8 = 0x03;

/// Size of the fixed preamble (marker + declared size).
const PREAMBLE_SIZE: usize = 5;

/// Size of a TLV's tag and length fields.
const TLV_HEADER_SIZE: usize = 5;

/// Upper bound on a credible header size.
const MAX_HEADER_SIZE: usize = 64 * 1024;

/// TLV tag for the entry key.
const TAG_KEY: u8 = 1;

/// TLV tag for the request URL.
const TAG_URL: u8 = 2;

/// TLV tag for the object size.
const TAG_OBJSIZE: u8 = 3;

/// An error unpacking or validating the metadata prefix.
#[derive(Debug, Error)]
pub enum MetaError {
    /// The buffer ended before the declared header did.
    #[error("metadata header inconsistent with available data")]
    Truncated,

    /// The first byte was not the header marker.
    #[error("bad metadata marker byte {0:#04x}")]
    BadMarker(u8),

    /// The declared header size was not credible.
    #[error("bad metadata header size {0}")]
    BadHeaderSize(usize),

    /// A TLV carried a tag this implementation does not know.
    #[error("unknown metadata tag {0}")]
    UnknownTag(u8),

    /// A TLV's length did not fit its tag.
    #[error("bad length {len} for metadata tag {tag}")]
    BadTlvLength {
        /// The offending tag.
        tag: u8,
        /// The length it carried.
        len: usize,
    },

    /// A TLV did not match the entry being read.
    #[error("metadata {what} does not match the entry")]
    Mismatch {
        /// Which TLV disagreed.
        what: &'static str,
    },
}

/// One decoded metadata TLV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapTlv {
    /// The key of the entry the object was spooled for.
    Key([u8; 32]),
    /// The URL the object was fetched from.
    Url(Vec<u8>),
    /// The object's size, headers included, metadata excluded.
    ObjectSize(u64),
}

impl SwapTlv {
    /// Validates this TLV against the entry being swapped in.
    ///
    /// Reading an object that belongs to a different entry (a stale or
    /// recycled swap file) must fail before any byte is delivered.
    pub fn check_consistency(&self, entry: &StoreEntry) -> Result<(), MetaError> {
        match self {
            Self::Key(key) => {
                if *key != entry.key() {
                    return Err(MetaError::Mismatch { what: "key" });
                }
            }
            Self::Url(url) => {
                if entry
                    .url()
                    .is_some_and(|expected| expected.as_bytes() != url.as_slice())
                {
                    return Err(MetaError::Mismatch { what: "url" });
                }
            }
            Self::ObjectSize(size) => {
                if entry.object_len().is_some_and(|expected| expected != *size) {
                    return Err(MetaError::Mismatch { what: "object size" });
                }
            }
        }
        Ok(())
    }
}

/// A decoded metadata prefix.
#[derive(Debug, Clone)]
pub struct SwapMeta {
    /// Total size of the on-disk header; the body starts here.
    pub hdr_sz: usize,
    /// The decoded TLV chain.
    pub tlvs: Vec<SwapTlv>,
}

/// Unpacks a metadata prefix from the front of a disk read.
pub struct SwapMetaUnpacker<'a> {
    /// The bytes read from the start of the swap file.
    buf: &'a [u8],
}

impl<'a> SwapMetaUnpacker<'a> {
    /// Wraps the first bytes of a swap file.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Checks that the preamble is plausible and fully covered by `buf`.
    pub fn is_buffer_sane(&self) -> bool {
        self.sanity().is_ok()
    }

    /// Validates the preamble, returning the declared header size.
    fn sanity(&self) -> Result<usize, MetaError> {
        if self.buf.len() < PREAMBLE_SIZE {
            return Err(MetaError::Truncated);
        }
        if self.buf[0] != SWAP_META_OK {
            return Err(MetaError::BadMarker(self.buf[0]));
        }
        let hdr_sz = u32::from_le_bytes(self.buf[1..PREAMBLE_SIZE].try_into().expect(
            "preamble size checked above",
        )) as usize;
        if hdr_sz < PREAMBLE_SIZE || hdr_sz > MAX_HEADER_SIZE {
            return Err(MetaError::BadHeaderSize(hdr_sz));
        }
        if hdr_sz > self.buf.len() {
            return Err(MetaError::Truncated);
        }
        Ok(hdr_sz)
    }

    /// Decodes the TLV chain.
    pub fn unpack(&self) -> Result<SwapMeta, MetaError> {
        let hdr_sz = self.sanity()?;

        let mut cursor = &self.buf[PREAMBLE_SIZE..hdr_sz];
        let mut tlvs = Vec::new();
        while cursor.has_remaining() {
            if cursor.remaining() < TLV_HEADER_SIZE {
                return Err(MetaError::Truncated);
            }
            let tag = cursor.get_u8();
            let len = cursor.get_u32_le() as usize;
            if cursor.remaining() < len {
                return Err(MetaError::Truncated);
            }

            match tag {
                TAG_KEY => {
                    let mut key = [0u8; 32];
                    if len != key.len() {
                        return Err(MetaError::BadTlvLength { tag, len });
                    }
                    cursor.copy_to_slice(&mut key);
                    tlvs.push(SwapTlv::Key(key));
                }
                TAG_URL => {
                    let mut url = vec![0u8; len];
                    cursor.copy_to_slice(&mut url);
                    tlvs.push(SwapTlv::Url(url));
                }
                TAG_OBJSIZE => {
                    if len != 8 {
                        return Err(MetaError::BadTlvLength { tag, len });
                    }
                    tlvs.push(SwapTlv::ObjectSize(cursor.get_u64_le()));
                }
                tag => return Err(MetaError::UnknownTag(tag)),
            }
        }

        debug!(hdr_sz, tlvs = tlvs.len(), "unpacked swap metadata");
        Ok(SwapMeta { hdr_sz, tlvs })
    }
}

/// Encodes the metadata prefix the unpacker expects.
///
/// The swap-out producer writes this at offset zero before the object
/// body; the unpacker validates it on the way back in.
pub fn pack_swap_header(key: &[u8; 32], url: &str, object_size: u64) -> Bytes {
    let total = PREAMBLE_SIZE
        + (TLV_HEADER_SIZE + key.len())
        + (TLV_HEADER_SIZE + url.len())
        + (TLV_HEADER_SIZE + 8);

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u8(SWAP_META_OK);
    buf.put_u32_le(total as u32);

    buf.put_u8(TAG_KEY);
    buf.put_u32_le(key.len() as u32);
    buf.put_slice(key);

    buf.put_u8(TAG_URL);
    buf.put_u32_le(url.len() as u32);
    buf.put_slice(url.as_bytes());

    buf.put_u8(TAG_OBJSIZE);
    buf.put_u32_le(8);
    buf.put_u64_le(object_size);

    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A packed header for a fixed key and URL.
    fn sample() -> (Bytes, [u8; 32]) {
        let key = [7u8; 32];
        (pack_swap_header(&key, "http://example.com/x", 880), key)
    }

    #[test]
    fn pack_then_unpack() {
        let (header, key) = sample();
        let unpacker = SwapMetaUnpacker::new(&header);
        assert!(unpacker.is_buffer_sane());

        let meta = unpacker.unpack().unwrap();
        assert_eq!(meta.hdr_sz, header.len());
        assert_eq!(
            meta.tlvs,
            vec![
                SwapTlv::Key(key),
                SwapTlv::Url(b"http://example.com/x".to_vec()),
                SwapTlv::ObjectSize(880),
            ]
        );
    }

    #[test]
    fn trailing_body_bytes_are_ignored() {
        let (header, _) = sample();
        let mut buf = header.to_vec();
        buf.extend_from_slice(b"HTTP/1.1 200 OK\r\n\r\n");

        let meta = SwapMetaUnpacker::new(&buf).unpack().unwrap();
        assert_eq!(meta.hdr_sz, header.len());
    }

    #[test]
    fn short_buffer_is_not_sane() {
        let (header, _) = sample();
        let unpacker = SwapMetaUnpacker::new(&header[..header.len() - 1]);
        assert!(!unpacker.is_buffer_sane());
        assert!(matches!(unpacker.unpack(), Err(MetaError::Truncated)));
    }

    #[test]
    fn bad_marker_is_rejected() {
        let (header, _) = sample();
        let mut buf = header.to_vec();
        buf[0] = 0x05;
        assert!(matches!(
            SwapMetaUnpacker::new(&buf).unpack(),
            Err(MetaError::BadMarker(0x05))
        ));
    }

    #[test]
    fn absurd_header_size_is_rejected() {
        let (header, _) = sample();
        let mut buf = header.to_vec();
        buf[1..5].copy_from_slice(&(u32::MAX).to_le_bytes());
        assert!(matches!(
            SwapMetaUnpacker::new(&buf).unpack(),
            Err(MetaError::BadHeaderSize(_))
        ));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let (header, _) = sample();
        let mut buf = header.to_vec();
        // The first TLV's tag byte sits right after the preamble.
        buf[5] = 0x77;
        assert!(matches!(
            SwapMetaUnpacker::new(&buf).unpack(),
            Err(MetaError::UnknownTag(0x77))
        ));
    }

    #[test]
    fn tlv_running_past_header_is_truncated() {
        let (header, _) = sample();
        let mut buf = header.to_vec();
        // Inflate the first TLV's length so it runs past the header end.
        buf[6..10].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(
            SwapMetaUnpacker::new(&buf).unpack(),
            Err(MetaError::Truncated)
        ));
    }
}
