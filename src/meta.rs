//! On-disk metadata envelope.
//!
//! Both metadata files share one framing: an 8-byte version marker, the
//! item count, the payload size, a 16-byte MD5 digest of the payload, then
//! a sequence of `(item_id, item_sub_id, size, bytes, canary)` records. The
//! main file carries the header record (format version, logical size, page
//! size, complete flag) and the packed completeness bitmap; the auxiliary
//! file carries a single opaque caller blob.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};

use crate::bitmap::PageBitmap;
use crate::error::MetaError;

const MAGIC: [u8; 8] = *b"FILEMAP\x01";
const CANARY: u8 = 0x5a;

const ENVELOPE_HEADER_LEN: usize = 8 + 4 + 4 + 16;
const RECORD_HEADER_LEN: usize = 4 + 4 + 4;

pub const FORMAT_VERSION: u32 = 1;

pub const ITEM_HEADER: u32 = 1;
pub const ITEM_BITMAP: u32 = 2;
pub const ITEM_AUX: u32 = 16;

const MAIN_RECORD_LEN: usize = 4 + 8 + 4 + 1;

/// Byte length of the fixed prefix of the main file: envelope header plus
/// the header record. Everything past it is the bitmap record, so a loader
/// can issue both reads at fixed offsets without a round trip in between.
pub const LOAD_PREFIX_LEN: usize = ENVELOPE_HEADER_LEN + RECORD_HEADER_LEN + MAIN_RECORD_LEN + 1;

/// The fixed-layout record stored in the main metadata file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MainRecord {
    pub version: u32,
    pub logical_size: u64,
    pub page_size: u32,
    pub complete: bool,
}

fn pack_envelope(items: &[(u32, u32, Bytes)]) -> Bytes {
    let payload_len: usize = items
        .iter()
        .map(|(_, _, data)| RECORD_HEADER_LEN + data.len() + 1)
        .sum();

    let mut payload = BytesMut::with_capacity(payload_len);
    for (id, sub_id, data) in items {
        payload.put_u32_le(*id);
        payload.put_u32_le(*sub_id);
        payload.put_u32_le(data.len() as u32);
        payload.put_slice(data);
        payload.put_u8(CANARY);
    }

    let digest = Md5::digest(&payload);

    let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER_LEN + payload.len());
    buf.put_slice(&MAGIC);
    buf.put_u32_le(items.len() as u32);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&digest);
    buf.put_slice(&payload);
    buf.freeze()
}

fn unpack_envelope(mut data: Bytes) -> Result<Vec<(u32, u32, Bytes)>, MetaError> {
    if data.len() < ENVELOPE_HEADER_LEN {
        return Err(MetaError::Truncated {
            need: ENVELOPE_HEADER_LEN,
            have: data.len(),
        });
    }
    if data[..8] != MAGIC {
        return Err(MetaError::BadMagic);
    }
    data.advance(8);
    let count = data.get_u32_le() as usize;
    let payload_len = data.get_u32_le() as usize;
    let mut expected_digest = [0u8; 16];
    data.copy_to_slice(&mut expected_digest);

    if data.len() < payload_len {
        return Err(MetaError::Truncated {
            need: payload_len,
            have: data.len(),
        });
    }
    let mut payload = data.split_to(payload_len);

    let digest = Md5::digest(&payload);
    if digest.as_slice() != expected_digest {
        return Err(MetaError::DigestMismatch);
    }

    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        if payload.len() < RECORD_HEADER_LEN {
            return Err(MetaError::Truncated {
                need: RECORD_HEADER_LEN,
                have: payload.len(),
            });
        }
        let id = payload.get_u32_le();
        let sub_id = payload.get_u32_le();
        let size = payload.get_u32_le() as usize;
        if payload.len() < size + 1 {
            return Err(MetaError::Truncated {
                need: size + 1,
                have: payload.len(),
            });
        }
        let bytes = payload.split_to(size);
        if payload.get_u8() != CANARY {
            return Err(MetaError::BadCanary { item: id });
        }
        items.push((id, sub_id, bytes));
    }
    Ok(items)
}

fn find_item(items: &[(u32, u32, Bytes)], id: u32) -> Result<Bytes, MetaError> {
    items
        .iter()
        .find(|(item_id, _, _)| *item_id == id)
        .map(|(_, _, data)| data.clone())
        .ok_or(MetaError::MissingItem { item: id })
}

/// Packs the main metadata file: header record plus bitmap record.
pub fn pack_main(record: &MainRecord, bitmap: &PageBitmap) -> Bytes {
    let mut header = BytesMut::with_capacity(MAIN_RECORD_LEN);
    header.put_u32_le(record.version);
    header.put_u64_le(record.logical_size);
    header.put_u32_le(record.page_size);
    header.put_u8(record.complete as u8);

    pack_envelope(&[
        (ITEM_HEADER, 0, header.freeze()),
        (ITEM_BITMAP, 0, bitmap.pack()),
    ])
}

/// Unpacks the main metadata file.
pub fn unpack_main(data: Bytes) -> Result<(MainRecord, PageBitmap), MetaError> {
    let items = unpack_envelope(data)?;

    let mut header = find_item(&items, ITEM_HEADER)?;
    if header.len() != MAIN_RECORD_LEN {
        return Err(MetaError::BadItem {
            item: ITEM_HEADER,
            reason: "unexpected header record size",
        });
    }
    let record = MainRecord {
        version: header.get_u32_le(),
        logical_size: header.get_u64_le(),
        page_size: header.get_u32_le(),
        complete: header.get_u8() != 0,
    };
    if record.version != FORMAT_VERSION {
        return Err(MetaError::BadItem {
            item: ITEM_HEADER,
            reason: "unsupported format version",
        });
    }
    if record.page_size == 0 {
        return Err(MetaError::BadItem {
            item: ITEM_HEADER,
            reason: "zero page size",
        });
    }

    let bitmap = PageBitmap::unpack(find_item(&items, ITEM_BITMAP)?)?;
    Ok((record, bitmap))
}

/// Packs the auxiliary metadata file around one opaque blob.
pub fn pack_aux(blob: Bytes) -> Bytes {
    pack_envelope(&[(ITEM_AUX, 0, blob)])
}

/// Unpacks the auxiliary metadata file, returning the blob verbatim.
pub fn unpack_aux(data: Bytes) -> Result<Bytes, MetaError> {
    let items = unpack_envelope(data)?;
    find_item(&items, ITEM_AUX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (MainRecord, PageBitmap) {
        let mut bitmap = PageBitmap::new();
        bitmap.set(0);
        bitmap.set(5);
        bitmap.set(63);
        let record = MainRecord {
            version: FORMAT_VERSION,
            logical_size: 260_000,
            page_size: 4096,
            complete: false,
        };
        (record, bitmap)
    }

    #[test]
    fn test_main_round_trip() {
        let (record, bitmap) = sample();
        let packed = pack_main(&record, &bitmap);
        let (restored, restored_map) = unpack_main(packed).unwrap();
        assert_eq!(restored, record);
        for i in 0..=70 {
            assert_eq!(bitmap.test(i), restored_map.test(i), "bit {i}");
        }
    }

    #[test]
    fn test_load_prefix_covers_header_record() {
        let (record, bitmap) = sample();
        let packed = pack_main(&record, &bitmap);
        assert!(packed.len() > LOAD_PREFIX_LEN);
        // The bitmap record must start exactly at the fixed prefix.
        let bitmap_record_start = LOAD_PREFIX_LEN;
        let mut tail = packed.slice(bitmap_record_start..);
        assert_eq!(tail.get_u32_le(), ITEM_BITMAP);
    }

    #[test]
    fn test_aux_round_trip() {
        let blob = Bytes::from_static(b"opaque resume state");
        let packed = pack_aux(blob.clone());
        assert_eq!(unpack_aux(packed).unwrap(), blob);
    }

    #[test]
    fn test_digest_mismatch() {
        let (record, bitmap) = sample();
        let mut packed = pack_main(&record, &bitmap).to_vec();
        let last = packed.len() - 2;
        packed[last] ^= 0xff;
        assert!(matches!(
            unpack_main(Bytes::from(packed)),
            Err(MetaError::DigestMismatch)
        ));
    }

    #[test]
    fn test_bad_magic() {
        let (record, bitmap) = sample();
        let mut packed = pack_main(&record, &bitmap).to_vec();
        packed[0] = b'X';
        assert!(matches!(
            unpack_main(Bytes::from(packed)),
            Err(MetaError::BadMagic)
        ));
    }

    #[test]
    fn test_truncated() {
        let (record, bitmap) = sample();
        let packed = pack_main(&record, &bitmap);
        let cut = packed.slice(..packed.len() / 2);
        assert!(unpack_main(cut).is_err());
    }
}
