//! On-medium record layout and checksum.
//!
//! A record is a flat byte run inside one allocator extent:
//!
//! `(checksum:4 || record_size:4 || timestamp:8 || type:2 || key_size:2 ||
//! value_size:4 || version_prev:8 || key || value [|| prev:8 || next:8])`
//!
//! `version_prev` is the offset of the record this one supersedes, if any
//! (zero for "none"). It is how a snapshot reader reaches a value that has
//! already been overwritten: it is filled in before the checksum is
//! computed, so following it is only ever done after the checksum has
//! already validated the record that holds it. This is deliberately
//! distinct from the trailing `prev`/`next` pair, which is only present for
//! doubly linked collection record types ([`RecordType::is_doubly_linked`])
//! and encodes neighbor order within a collection, not version history --
//! `version_prev` exists on every record type.
//!
//! Write order matters for crash consistency: the fixed fields,
//! `version_prev`, and the key and value payload are stamped first, the
//! checksum is computed over that range and written last of the first
//! phase, and only after the checksum is durable are `prev`/`next`
//! installed. A record whose checksum does not match its payload is
//! treated as though it never existed (§4.6).

use pmemkv_types::RecordType;

pub const CHECKSUM_OFFSET: usize = 0;
pub const RECORD_SIZE_OFFSET: usize = 4;
pub const TIMESTAMP_OFFSET: usize = 8;
pub const TYPE_OFFSET: usize = 16;
pub const KEY_SIZE_OFFSET: usize = 18;
pub const VALUE_SIZE_OFFSET: usize = 20;
pub const VERSION_PREV_OFFSET: usize = 24;
pub const HEADER_LEN: usize = 32;
pub const LINK_LEN: usize = 16;

/// Total on-medium length of a record with the given key/value sizes.
pub fn encoded_len(key_size: usize, value_size: usize, linked: bool) -> usize {
    HEADER_LEN + key_size + value_size + if linked { LINK_LEN } else { 0 }
}

fn crc_region(key_size: usize, value_size: usize) -> std::ops::Range<usize> {
    RECORD_SIZE_OFFSET..(HEADER_LEN + key_size + value_size)
}

fn compute_crc(buf: &[u8], key_size: usize, value_size: usize) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[crc_region(key_size, value_size)]);
    hasher.finalize()
}

/// Stamps a record into `dst`, which must be exactly
/// `encoded_len(key.len(), value.len(), link.is_some())` bytes long and must
/// start out zeroed (as a freshly allocated extent does).
///
/// Returns the offsets (relative to `dst`) of the checksum and, if present,
/// the link fields, purely for test introspection.
pub fn persist(
    dst: &mut [u8],
    record_size_blocks: u32,
    timestamp: u64,
    record_type: RecordType,
    version_prev: u64,
    key: &[u8],
    value: &[u8],
    link: Option<(u64, u64)>,
) {
    let ks = key.len();
    let vs = value.len();
    assert_eq!(dst.len(), encoded_len(ks, vs, link.is_some()));

    dst[RECORD_SIZE_OFFSET..RECORD_SIZE_OFFSET + 4].copy_from_slice(&record_size_blocks.to_le_bytes());
    dst[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8].copy_from_slice(&timestamp.to_le_bytes());
    dst[TYPE_OFFSET..TYPE_OFFSET + 2].copy_from_slice(&(record_type as u16).to_le_bytes());
    dst[KEY_SIZE_OFFSET..KEY_SIZE_OFFSET + 2].copy_from_slice(&(ks as u16).to_le_bytes());
    dst[VALUE_SIZE_OFFSET..VALUE_SIZE_OFFSET + 4].copy_from_slice(&(vs as u32).to_le_bytes());
    dst[VERSION_PREV_OFFSET..VERSION_PREV_OFFSET + 8].copy_from_slice(&version_prev.to_le_bytes());
    dst[HEADER_LEN..HEADER_LEN + ks].copy_from_slice(key);
    dst[HEADER_LEN + ks..HEADER_LEN + ks + vs].copy_from_slice(value);

    let crc = compute_crc(dst, ks, vs);
    dst[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());

    if let Some((prev, next)) = link {
        let link_off = HEADER_LEN + ks + vs;
        dst[link_off..link_off + 8].copy_from_slice(&prev.to_le_bytes());
        dst[link_off + 8..link_off + 16].copy_from_slice(&next.to_le_bytes());
    }
}

/// Re-stamps just the `prev`/`next` link fields of an already-persisted
/// doubly linked record. Used by the cleaner-repair path (§4.6) and by
/// collection insert/remove, which must relink neighbors without disturbing
/// an already-valid checksum.
pub fn install_links(dst: &mut [u8], key_size: usize, value_size: usize, prev: u64, next: u64) {
    let link_off = HEADER_LEN + key_size + value_size;
    assert!(dst.len() >= link_off + LINK_LEN);
    dst[link_off..link_off + 8].copy_from_slice(&prev.to_le_bytes());
    dst[link_off + 8..link_off + 16].copy_from_slice(&next.to_le_bytes());
}

/// A validated, zero-copy view over a persisted record.
#[derive(Clone, Copy)]
pub struct RecordView<'a> {
    buf: &'a [u8],
    key_size: usize,
    value_size: usize,
    linked: bool,
}

impl<'a> RecordView<'a> {
    /// Parses `buf` and validates its checksum. Returns `None` on a short
    /// buffer, an unrecognized type tag, or a checksum mismatch -- any of
    /// which mean the record must be treated as never having existed.
    pub fn parse(buf: &'a [u8]) -> Option<RecordView<'a>> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let key_size = u16::from_le_bytes(buf[KEY_SIZE_OFFSET..KEY_SIZE_OFFSET + 2].try_into().unwrap()) as usize;
        let value_size =
            u32::from_le_bytes(buf[VALUE_SIZE_OFFSET..VALUE_SIZE_OFFSET + 4].try_into().unwrap()) as usize;
        let type_raw = u16::from_le_bytes(buf[TYPE_OFFSET..TYPE_OFFSET + 2].try_into().unwrap());
        let record_type = RecordType::from_u16(type_raw)?;
        let linked = record_type.is_doubly_linked();
        let needed = encoded_len(key_size, value_size, linked);
        if buf.len() < needed {
            return None;
        }
        let view = RecordView { buf: &buf[..needed], key_size, value_size, linked };
        if view.checksum() != compute_crc(view.buf, key_size, value_size) {
            return None;
        }
        Some(view)
    }

    pub fn checksum(&self) -> u32 {
        u32::from_le_bytes(self.buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].try_into().unwrap())
    }

    pub fn record_size_blocks(&self) -> u32 {
        u32::from_le_bytes(self.buf[RECORD_SIZE_OFFSET..RECORD_SIZE_OFFSET + 4].try_into().unwrap())
    }

    pub fn timestamp(&self) -> u64 {
        u64::from_le_bytes(self.buf[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8].try_into().unwrap())
    }

    pub fn record_type(&self) -> RecordType {
        let raw = u16::from_le_bytes(self.buf[TYPE_OFFSET..TYPE_OFFSET + 2].try_into().unwrap());
        RecordType::from_u16(raw).expect("validated on parse")
    }

    /// Offset of the record this one supersedes, or 0 if it is the first
    /// version of its key.
    pub fn version_prev(&self) -> u64 {
        u64::from_le_bytes(self.buf[VERSION_PREV_OFFSET..VERSION_PREV_OFFSET + 8].try_into().unwrap())
    }

    pub fn key(&self) -> &'a [u8] {
        &self.buf[HEADER_LEN..HEADER_LEN + self.key_size]
    }

    pub fn value(&self) -> &'a [u8] {
        &self.buf[HEADER_LEN + self.key_size..HEADER_LEN + self.key_size + self.value_size]
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    pub fn prev(&self) -> Option<u64> {
        self.linked.then(|| {
            let off = HEADER_LEN + self.key_size + self.value_size;
            u64::from_le_bytes(self.buf[off..off + 8].try_into().unwrap())
        })
    }

    pub fn next(&self) -> Option<u64> {
        self.linked.then(|| {
            let off = HEADER_LEN + self.key_size + self.value_size + 8;
            u64::from_le_bytes(self.buf[off..off + 8].try_into().unwrap())
        })
    }

    pub fn encoded_len(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plain_record() {
        let key = b"foo";
        let value = b"bar";
        let len = encoded_len(key.len(), value.len(), false);
        let mut buf = vec![0u8; len];
        persist(&mut buf, 1, 42, RecordType::StringRecord, 0, key, value, None);

        let view = RecordView::parse(&buf).expect("valid record");
        assert_eq!(view.timestamp(), 42);
        assert_eq!(view.record_type(), RecordType::StringRecord);
        assert_eq!(view.key(), key);
        assert_eq!(view.value(), value);
        assert_eq!(view.version_prev(), 0);
        assert!(!view.is_linked());
    }

    #[test]
    fn round_trips_linked_record_and_relink() {
        let key = b"c1";
        let value = b"header-value";
        let len = encoded_len(key.len(), value.len(), true);
        let mut buf = vec![0u8; len];
        persist(
            &mut buf,
            1,
            7,
            RecordType::SortedHeaderRecord,
            0,
            key,
            value,
            Some((0, 0)),
        );
        assert_eq!(RecordView::parse(&buf).unwrap().prev(), Some(0));

        install_links(&mut buf, key.len(), value.len(), 128, 256);
        let view = RecordView::parse(&buf).expect("checksum unaffected by relink");
        assert_eq!(view.prev(), Some(128));
        assert_eq!(view.next(), Some(256));
    }

    #[test]
    fn corrupted_payload_is_rejected() {
        let key = b"k";
        let value = b"v";
        let len = encoded_len(key.len(), value.len(), false);
        let mut buf = vec![0u8; len];
        persist(&mut buf, 1, 1, RecordType::StringRecord, 0, key, value, None);
        buf[HEADER_LEN] ^= 0xff;
        assert!(RecordView::parse(&buf).is_none());
    }

    #[test]
    fn zeroed_extent_is_not_a_record() {
        let buf = vec![0u8; HEADER_LEN];
        assert!(RecordView::parse(&buf).is_none());
    }
}
