//! Journal record types and framing.

use crate::error::{SyncError, SyncResult};
use mirrorsync_protocol::{ActionId, Inode, Link, PendingAction, Timestamp};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Magic bytes identifying a journal frame.
pub const JOURNAL_MAGIC: [u8; 4] = *b"MSJ1";

/// magic (4) + type (1) + length (4) = 9 bytes
const HEADER_SIZE: usize = 9;

const CRC_SIZE: usize = 4;

/// Largest payload a frame may declare. Actions and links are small.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Type of journal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// An action appended to the queue.
    Append = 1,
    /// A queued action rewritten in place.
    Replace = 2,
    /// A queued action removed.
    Remove = 3,
    /// An identity link recorded.
    Link = 4,
    /// An identity link dropped.
    Unlink = 5,
    /// The catch-up watermark moved.
    LastSynced = 6,
}

impl RecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Append),
            2 => Some(Self::Replace),
            3 => Some(Self::Remove),
            4 => Some(Self::Link),
            5 => Some(Self::Unlink),
            6 => Some(Self::LastSynced),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One durable mutation of engine state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    /// Append an action at the end of the queue.
    Append(PendingAction),
    /// Rewrite a queued action, keeping its position.
    Replace(PendingAction),
    /// Remove a queued action.
    Remove(ActionId),
    /// Record a link.
    Link(Link),
    /// Drop the link for an inode.
    Unlink(Inode),
    /// Move the catch-up watermark.
    LastSynced(Timestamp),
}

impl JournalRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::Append(_) => RecordType::Append,
            Self::Replace(_) => RecordType::Replace,
            Self::Remove(_) => RecordType::Remove,
            Self::Link(_) => RecordType::Link,
            Self::Unlink(_) => RecordType::Unlink,
            Self::LastSynced(_) => RecordType::LastSynced,
        }
    }

    /// Encodes the record as a complete frame.
    ///
    /// Format: `magic | type | payload length (LE u32) | CBOR payload | crc32 (LE)`,
    /// with the checksum covering everything before it.
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        let payload = match self {
            Self::Append(action) | Self::Replace(action) => to_cbor(action)?,
            Self::Remove(id) => to_cbor(id)?,
            Self::Link(link) => to_cbor(link)?,
            Self::Unlink(inode) => to_cbor(inode)?,
            Self::LastSynced(at) => to_cbor(at)?,
        };
        let len = u32::try_from(payload.len())
            .map_err(|_| SyncError::queue("journal record too large"))?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        frame.extend_from_slice(&JOURNAL_MAGIC);
        frame.push(self.record_type().as_byte());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        let crc = compute_crc32(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }

    fn decode_payload(record_type: RecordType, payload: &[u8]) -> Result<Self, String> {
        Ok(match record_type {
            RecordType::Append => Self::Append(from_cbor(payload)?),
            RecordType::Replace => Self::Replace(from_cbor(payload)?),
            RecordType::Remove => Self::Remove(from_cbor(payload)?),
            RecordType::Link => Self::Link(from_cbor(payload)?),
            RecordType::Unlink => Self::Unlink(from_cbor(payload)?),
            RecordType::LastSynced => Self::LastSynced(from_cbor(payload)?),
        })
    }
}

fn to_cbor<T: Serialize>(value: &T) -> SyncResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| SyncError::queue(format!("journal encode failed: {e}")))?;
    Ok(buf)
}

fn from_cbor<T: DeserializeOwned>(payload: &[u8]) -> Result<T, String> {
    ciborium::from_reader(payload).map_err(|e| format!("invalid payload: {e}"))
}

/// How a journal scan ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEnd {
    /// Every byte belonged to a valid frame.
    Clean,
    /// The last frame was cut short, typically by a crash mid-append.
    TornTail {
        /// Where the incomplete frame starts.
        offset: u64,
    },
    /// A complete frame failed validation.
    Corrupt {
        /// Where the bad frame starts.
        offset: u64,
        /// What was wrong with it.
        reason: String,
    },
}

/// Result of scanning a journal.
#[derive(Debug, Clone)]
pub struct JournalScan {
    /// Valid records with the offset of their frame.
    pub records: Vec<(u64, JournalRecord)>,
    /// How the scan ended.
    pub end: ScanEnd,
    /// Length of the valid prefix.
    pub valid_len: u64,
}

impl JournalScan {
    /// Returns true if the scan found no corruption.
    ///
    /// A torn tail is not corruption: it is what an interrupted append
    /// leaves behind and is truncated on open.
    pub fn is_intact(&self) -> bool {
        !matches!(self.end, ScanEnd::Corrupt { .. })
    }
}

/// Scans journal bytes frame by frame.
///
/// An incomplete trailing frame ends the scan as a torn tail. Bad magic,
/// an unknown record type, an oversized or overlapping length, a checksum
/// mismatch or an undecodable payload ends it as corruption.
pub fn scan(bytes: &[u8]) -> JournalScan {
    let mut records = Vec::new();
    let mut pos = 0usize;

    let end = loop {
        if pos == bytes.len() {
            break ScanEnd::Clean;
        }
        let offset = pos as u64;
        let rest = &bytes[pos..];
        if rest.len() < HEADER_SIZE {
            break ScanEnd::TornTail { offset };
        }
        if rest[0..4] != JOURNAL_MAGIC {
            break ScanEnd::Corrupt {
                offset,
                reason: "bad magic".into(),
            };
        }
        let Some(record_type) = RecordType::from_byte(rest[4]) else {
            break ScanEnd::Corrupt {
                offset,
                reason: format!("unknown record type {}", rest[4]),
            };
        };
        let len = u32::from_le_bytes([rest[5], rest[6], rest[7], rest[8]]) as usize;
        if len > MAX_PAYLOAD_SIZE {
            break ScanEnd::Corrupt {
                offset,
                reason: format!("declared payload length {len} exceeds {MAX_PAYLOAD_SIZE}"),
            };
        }
        let frame_len = HEADER_SIZE + len + CRC_SIZE;
        if rest.len() < frame_len {
            // Only the last frame can be torn. A valid frame further on
            // means this one has a damaged length.
            if let Some(next) = next_valid_frame(&rest[1..]) {
                break ScanEnd::Corrupt {
                    offset,
                    reason: format!(
                        "frame length runs past a valid frame at offset {}",
                        offset + 1 + next as u64
                    ),
                };
            }
            break ScanEnd::TornTail { offset };
        }

        let body = &rest[..HEADER_SIZE + len];
        if let Err(reason) = check_crc(body, &rest[HEADER_SIZE + len..frame_len]) {
            break ScanEnd::Corrupt { offset, reason };
        }

        match JournalRecord::decode_payload(record_type, &body[HEADER_SIZE..]) {
            Ok(record) => records.push((offset, record)),
            Err(reason) => break ScanEnd::Corrupt { offset, reason },
        }
        pos += frame_len;
    };

    JournalScan {
        records,
        end,
        valid_len: pos as u64,
    }
}

fn check_crc(body: &[u8], stored: &[u8]) -> Result<(), String> {
    let stored_crc = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
    let computed_crc = compute_crc32(body);
    if stored_crc == computed_crc {
        Ok(())
    } else {
        Err(format!(
            "checksum mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
        ))
    }
}

/// Finds the start of the first complete, checksummed frame in `bytes`.
fn next_valid_frame(bytes: &[u8]) -> Option<usize> {
    let mut from = 0;
    while let Some(found) = bytes[from..]
        .windows(JOURNAL_MAGIC.len())
        .position(|w| w == JOURNAL_MAGIC)
    {
        let start = from + found;
        let rest = &bytes[start..];
        if rest.len() >= HEADER_SIZE && RecordType::from_byte(rest[4]).is_some() {
            let len = u32::from_le_bytes([rest[5], rest[6], rest[7], rest[8]]) as usize;
            let frame_len = HEADER_SIZE + len + CRC_SIZE;
            if len <= MAX_PAYLOAD_SIZE
                && rest.len() >= frame_len
                && check_crc(&rest[..HEADER_SIZE + len], &rest[HEADER_SIZE + len..frame_len])
                    .is_ok()
            {
                return Some(start);
            }
        }
        from = start + 1;
    }
    None
}

/// Computes a CRC32 checksum (IEEE polynomial).
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
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
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    crc ^ 0xFFFF_FFFF
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorsync_protocol::AssetId;

    fn sample() -> Vec<JournalRecord> {
        vec![
            JournalRecord::Append(PendingAction::move_to("a.txt", "b.txt")),
            JournalRecord::Link(Link::new(
                Inode::new("42"),
                AssetId::new("asset-1"),
                "b.txt",
                Timestamp::from_millis(10),
                Timestamp::from_millis(9),
            )),
            JournalRecord::LastSynced(Timestamp::from_millis(100)),
        ]
    }

    fn frames(records: &[JournalRecord]) -> Vec<u8> {
        records.iter().flat_map(|r| r.encode().unwrap()).collect()
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn clean_scan_returns_records_with_offsets() {
        let records = sample();
        let bytes = frames(&records);
        let scan = scan(&bytes);

        assert_eq!(scan.end, ScanEnd::Clean);
        assert_eq!(scan.valid_len, bytes.len() as u64);
        assert_eq!(scan.records[0].0, 0);
        let decoded: Vec<_> = scan.records.into_iter().map(|(_, r)| r).collect();
        assert_eq!(decoded, records);
    }

    #[test]
    fn truncated_frame_is_a_torn_tail() {
        let records = sample();
        let mut bytes = frames(&records);
        let whole = bytes.len();
        bytes.truncate(whole - 3);

        let scan = scan(&bytes);
        assert_eq!(scan.records.len(), 2);
        assert!(matches!(scan.end, ScanEnd::TornTail { offset } if offset == scan.valid_len));
        assert!(scan.is_intact());
    }

    #[test]
    fn flipped_payload_byte_is_corruption() {
        let mut bytes = frames(&sample());
        bytes[HEADER_SIZE + 2] ^= 0xFF;

        let scan = scan(&bytes);
        assert!(scan.records.is_empty());
        assert!(matches!(scan.end, ScanEnd::Corrupt { offset: 0, .. }));
        assert!(!scan.is_intact());
    }

    #[test]
    fn damaged_length_in_first_frame_is_corruption() {
        let mut bytes = frames(&sample());
        bytes[8] = 0x7f;

        let scan = scan(&bytes);
        assert!(scan.records.is_empty());
        assert!(matches!(scan.end, ScanEnd::Corrupt { offset: 0, .. }));
        assert!(!scan.is_intact());
    }

    #[test]
    fn length_running_past_a_valid_frame_is_corruption() {
        let mut bytes = frames(&sample());
        bytes[7] = 0x01;

        let scan = scan(&bytes);
        assert!(scan.records.is_empty());
        match scan.end {
            ScanEnd::Corrupt { offset, reason } => {
                assert_eq!(offset, 0);
                assert!(reason.contains("valid frame"));
            }
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn oversized_length_is_corruption() {
        let mut bytes = frames(&sample()[..1]);
        bytes[5..9].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(scan(&bytes).end, ScanEnd::Corrupt { offset: 0, .. }));
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut bytes = frames(&sample());
        bytes[0] = b'X';
        assert!(matches!(scan(&bytes).end, ScanEnd::Corrupt { .. }));
    }

    #[test]
    fn record_type_bytes() {
        for b in 1..=6u8 {
            assert_eq!(RecordType::from_byte(b).unwrap().as_byte(), b);
        }
        assert!(RecordType::from_byte(0).is_none());
        assert!(RecordType::from_byte(7).is_none());
    }
}
