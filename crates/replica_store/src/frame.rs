//! Journal frame format and recovery scan.
//!
//! Every committed transaction is written as exactly one frame:
//!
//! ```text
//! | magic (4) | version (2) | kind (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! ## Recovery policy
//!
//! Tolerated, treated as a clean end of log:
//! - fewer than a full header left at the tail
//! - a payload or checksum that runs past the end of the log
//!
//! Both are a crash mid-append before the commit was acknowledged, so the
//! tail is dropped.
//!
//! Fatal, the store refuses to open:
//! - checksum mismatch on a complete frame
//! - wrong magic, unknown kind or a newer format version

use crate::error::{StoreError, StoreResult};

/// Magic bytes opening every journal frame.
pub const JOURNAL_MAGIC: [u8; 4] = *b"RJNL";

/// Magic bytes opening a snapshot image.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"RSNP";

/// Current frame format version.
pub const FORMAT_VERSION: u16 = 1;

/// magic (4) + version (2) + kind (1) + length (4)
const HEADER_SIZE: usize = 11;
const CRC_SIZE: usize = 4;

/// Kind of journal frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// A committed transaction's change set.
    Commit = 1,
    /// A full checkpoint image (snapshot slot only).
    Image = 2,
}

impl FrameKind {
    /// Converts a byte to a frame kind.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Commit),
            2 => Some(Self::Image),
            _ => None,
        }
    }
}

/// A complete frame read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Offset of the frame's first byte.
    pub offset: u64,
    /// Frame kind.
    pub kind: FrameKind,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// Result of scanning a log.
#[derive(Debug, Clone, Default)]
pub struct Scan {
    /// Every complete, checksummed frame in order.
    pub frames: Vec<Frame>,
    /// Length of the log prefix made of complete frames.
    pub valid_len: u64,
    /// Number of trailing bytes belonging to a torn frame.
    pub torn_bytes: u64,
}

/// Wraps a payload into a frame.
///
/// # Errors
///
/// Returns an error if the payload exceeds the 4 GiB length field.
pub fn encode_frame(magic: [u8; 4], kind: FrameKind, payload: &[u8]) -> StoreResult<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| StoreError::codec("journal payload exceeds 4 GiB"))?;

    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    data.extend_from_slice(&magic);
    data.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    data.push(kind as u8);
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(payload);

    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

/// Scans journal bytes starting at log offset `base`.
///
/// # Errors
///
/// Returns a corruption error for any fatal condition listed in the module
/// docs.
pub fn scan(bytes: &[u8], base: u64) -> StoreResult<Scan> {
    let mut scan = Scan::default();
    let mut cursor = 0usize;

    loop {
        let remaining = bytes.len() - cursor;
        if remaining == 0 {
            break;
        }
        if remaining < HEADER_SIZE {
            scan.torn_bytes = remaining as u64;
            break;
        }

        let offset = base + cursor as u64;
        let (kind, len) = read_header(&bytes[cursor..cursor + HEADER_SIZE], JOURNAL_MAGIC, offset)?;
        let total = HEADER_SIZE + len + CRC_SIZE;
        if remaining < total {
            scan.torn_bytes = remaining as u64;
            break;
        }

        let body = &bytes[cursor..cursor + HEADER_SIZE + len];
        verify_crc(body, &bytes[cursor + HEADER_SIZE + len..cursor + total], offset)?;

        scan.frames.push(Frame {
            offset,
            kind,
            payload: body[HEADER_SIZE..].to_vec(),
        });
        cursor += total;
        scan.valid_len = base + cursor as u64;
    }

    if scan.frames.is_empty() {
        scan.valid_len = base;
    }
    Ok(scan)
}

/// Decodes a standalone frame, such as a snapshot image. Unlike the journal
/// scan, a short image is corruption: images are replaced atomically.
pub fn decode_single(bytes: &[u8], magic: [u8; 4]) -> StoreResult<Frame> {
    if bytes.len() < HEADER_SIZE + CRC_SIZE {
        return Err(StoreError::corrupted("image shorter than a frame header"));
    }
    let (kind, len) = read_header(&bytes[..HEADER_SIZE], magic, 0)?;
    if bytes.len() != HEADER_SIZE + len + CRC_SIZE {
        return Err(StoreError::corrupted(format!(
            "image length {} does not match header length {len}",
            bytes.len()
        )));
    }
    verify_crc(&bytes[..HEADER_SIZE + len], &bytes[HEADER_SIZE + len..], 0)?;
    Ok(Frame {
        offset: 0,
        kind,
        payload: bytes[HEADER_SIZE..HEADER_SIZE + len].to_vec(),
    })
}

fn read_header(header: &[u8], magic: [u8; 4], offset: u64) -> StoreResult<(FrameKind, usize)> {
    if header[0..4] != magic {
        return Err(StoreError::corrupted(format!("bad frame magic at offset {offset}")));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version > FORMAT_VERSION {
        return Err(StoreError::corrupted(format!(
            "frame at offset {offset} has unsupported version {version}"
        )));
    }
    let kind = FrameKind::from_byte(header[6]).ok_or_else(|| {
        StoreError::corrupted(format!("unknown frame kind {} at offset {offset}", header[6]))
    })?;
    let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
    Ok((kind, len))
}

fn verify_crc(body: &[u8], stored: &[u8], offset: u64) -> StoreResult<()> {
    let expected = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
    let actual = compute_crc32(body);
    if expected != actual {
        return Err(StoreError::ChecksumMismatch {
            offset,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Computes the IEEE CRC32 of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(payload: &[u8]) -> Vec<u8> {
        encode_frame(JOURNAL_MAGIC, FrameKind::Commit, payload).unwrap()
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn scan_reads_all_frames() {
        let mut log = commit(b"one");
        log.extend(commit(b"two"));

        let scan = scan(&log, 0).unwrap();
        assert_eq!(scan.frames.len(), 2);
        assert_eq!(scan.frames[1].payload, b"two");
        assert_eq!(scan.valid_len, log.len() as u64);
        assert_eq!(scan.torn_bytes, 0);
    }

    #[test]
    fn torn_header_is_clean_end() {
        let mut log = commit(b"kept");
        let valid = log.len() as u64;
        log.extend_from_slice(&JOURNAL_MAGIC[..3]);

        let scan = scan(&log, 0).unwrap();
        assert_eq!(scan.frames.len(), 1);
        assert_eq!(scan.valid_len, valid);
        assert_eq!(scan.torn_bytes, 3);
    }

    #[test]
    fn torn_payload_is_clean_end() {
        let mut log = commit(b"kept");
        let second = commit(b"lost in crash");
        log.extend_from_slice(&second[..second.len() - 6]);

        let scan = scan(&log, 0).unwrap();
        assert_eq!(scan.frames.len(), 1);
        assert!(scan.torn_bytes > 0);
    }

    #[test]
    fn flipped_bit_is_fatal() {
        let mut log = commit(b"payload");
        log[HEADER_SIZE + 2] ^= 0x01;
        assert!(matches!(
            scan(&log, 0),
            Err(StoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut log = commit(b"payload");
        log[0] = b'X';
        assert!(scan(&log, 0).unwrap_err().is_corruption());
    }

    #[test]
    fn scan_reports_absolute_offsets() {
        let log = commit(b"tail");
        let scan = scan(&log, 100).unwrap();
        assert_eq!(scan.frames[0].offset, 100);
        assert_eq!(scan.valid_len, 100 + log.len() as u64);
    }

    #[test]
    fn single_image_roundtrip_and_truncation() {
        let image = encode_frame(SNAPSHOT_MAGIC, FrameKind::Image, b"rows").unwrap();
        let frame = decode_single(&image, SNAPSHOT_MAGIC).unwrap();
        assert_eq!(frame.payload, b"rows");
        assert!(decode_single(&image[..image.len() - 1], SNAPSHOT_MAGIC).is_err());
        assert!(decode_single(&image, JOURNAL_MAGIC).is_err());
    }

    proptest::proptest! {
        #[test]
        fn any_cut_keeps_a_prefix_of_frames(
            payloads in proptest::collection::vec(proptest::collection::vec(proptest::prelude::any::<u8>(), 0..64), 1..6),
            cut in proptest::prelude::any::<proptest::sample::Index>(),
        ) {
            let mut log = Vec::new();
            let mut ends = vec![0u64];
            for payload in &payloads {
                log.extend(commit(payload));
                ends.push(log.len() as u64);
            }
            let cut = cut.index(log.len() + 1);

            let scan = scan(&log[..cut], 0).unwrap();
            let kept = scan.frames.len();
            proptest::prop_assert_eq!(scan.valid_len, ends[kept]);
            proptest::prop_assert!(ends[kept] <= cut as u64);
            proptest::prop_assert!(kept == payloads.len() || ends[kept + 1] > cut as u64);
            for (frame, payload) in scan.frames.iter().zip(&payloads) {
                proptest::prop_assert_eq!(&frame.payload, payload);
            }
        }
    }
}
