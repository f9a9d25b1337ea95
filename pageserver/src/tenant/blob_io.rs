//!
//! Functions for reading and writing layer files.
//!
//! A layer file is a header followed by a sequence of records and a trailing
//! checksum:
//!
//! ```text
//! header:  magic u32 | version u16 | key_start [18] | key_end [18]
//!          | lsn_start u64 | lsn_end u64 | record count u64
//! record:  key [18] | lsn u64 | tag u8 | len u32 | value bytes
//! trailer: crc32c u32 over everything before it
//! ```
//!
//! All integers are big-endian. The tag is 0 for images and 1 for WAL records.
//! Image layer records carry the image LSN. The whole file is read and verified
//! at once, a checksum mismatch is reported as [`LayerFileError::Corrupted`].
//!
use std::ops::Range;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use pageserver_api::key::{Key, KEY_SIZE};
use pageserver_api::value::Value;
use utils::lsn::Lsn;

use crate::tenant::storage_layer::LayerFileError;

pub(crate) const DELTA_FILE_MAGIC: u32 = 0x5A61_6E11;
pub(crate) const IMAGE_FILE_MAGIC: u32 = 0x5A60_6D01;

pub(crate) const STORAGE_FORMAT_VERSION: u16 = 1;

const HEADER_SIZE: usize = 4 + 2 + KEY_SIZE * 2 + 8 + 8 + 8;
const KEY_END_OFFSET: usize = 4 + 2 + KEY_SIZE;
const COUNT_OFFSET: usize = HEADER_SIZE - 8;
const RECORD_HEADER_SIZE: usize = KEY_SIZE + 8 + 1 + 4;
const CHECKSUM_SIZE: usize = 4;

const TAG_IMAGE: u8 = 0;
const TAG_WAL_RECORD: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LayerFileHeader {
    pub magic: u32,
    pub key_range: Range<Key>,
    pub lsn_range: Range<Lsn>,
    pub count: u64,
}

/// Accumulates the records of one layer file in memory.
pub(crate) struct BlobWriter {
    buf: BytesMut,
    count: u64,
}

impl BlobWriter {
    /// The end of the key range is only known once all records are in, see [`Self::finish`].
    pub fn new(magic: u32, key_start: Key, lsn_range: &Range<Lsn>) -> Self {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_u32(magic);
        buf.put_u16(STORAGE_FORMAT_VERSION);
        put_key(&mut buf, &key_start);
        // patched in finish()
        put_key(&mut buf, &Key::MIN);
        buf.put_u64(lsn_range.start.0);
        buf.put_u64(lsn_range.end.0);
        // patched in finish()
        buf.put_u64(0);
        debug_assert_eq!(buf.len(), HEADER_SIZE);
        BlobWriter { buf, count: 0 }
    }

    pub fn append(&mut self, key: Key, lsn: Lsn, value: &Value) {
        put_key(&mut self.buf, &key);
        self.buf.put_u64(lsn.0);
        let (tag, bytes) = match value {
            Value::Image(img) => (TAG_IMAGE, img),
            Value::WalRecord(rec) => (TAG_WAL_RECORD, rec),
        };
        self.buf.put_u8(tag);
        self.buf.put_u32(bytes.len() as u32);
        self.buf.put_slice(bytes);
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Size of the file if it was finished now.
    pub fn size(&self) -> u64 {
        (self.buf.len() + CHECKSUM_SIZE) as u64
    }

    pub fn finish(mut self, key_end: Key) -> Bytes {
        let mut raw = [0u8; KEY_SIZE];
        key_end.write_to_byte_slice(&mut raw);
        self.buf[KEY_END_OFFSET..KEY_END_OFFSET + KEY_SIZE].copy_from_slice(&raw);
        self.buf[COUNT_OFFSET..HEADER_SIZE].copy_from_slice(&self.count.to_be_bytes());
        let crc = crc32c::crc32c(&self.buf);
        self.buf.put_u32(crc);
        self.buf.freeze()
    }
}

fn put_key(buf: &mut BytesMut, key: &Key) {
    let mut raw = [0u8; KEY_SIZE];
    key.write_to_byte_slice(&mut raw);
    buf.put_slice(&raw);
}

fn get_key(buf: &mut &[u8]) -> Key {
    let mut raw = [0u8; KEY_SIZE];
    buf.copy_to_slice(&mut raw);
    Key::from_slice(&raw)
}

/// Verifies the checksum and decodes a whole layer file.
pub(crate) fn read_layer_file(
    file: &[u8],
    expected_magic: u32,
) -> Result<(LayerFileHeader, Vec<(Key, Lsn, Value)>), LayerFileError> {
    if file.len() < HEADER_SIZE + CHECKSUM_SIZE {
        return Err(LayerFileError::Corrupted(format!(
            "file too short: {} bytes",
            file.len()
        )));
    }
    let (content, mut trailer) = file.split_at(file.len() - CHECKSUM_SIZE);
    let expected_crc = trailer.get_u32();
    let actual_crc = crc32c::crc32c(content);
    if expected_crc != actual_crc {
        return Err(LayerFileError::Corrupted(format!(
            "checksum mismatch: stored {expected_crc:08x}, computed {actual_crc:08x}"
        )));
    }

    let mut buf = content;
    let magic = buf.get_u32();
    if magic != expected_magic {
        return Err(LayerFileError::Corrupted(format!(
            "unexpected magic {magic:08x}, expected {expected_magic:08x}"
        )));
    }
    let version = buf.get_u16();
    if version != STORAGE_FORMAT_VERSION {
        return Err(LayerFileError::Corrupted(format!(
            "unsupported format version {version}"
        )));
    }
    let key_range = get_key(&mut buf)..get_key(&mut buf);
    let lsn_range = Lsn(buf.get_u64())..Lsn(buf.get_u64());
    let count = buf.get_u64();

    let mut records = Vec::with_capacity(count.min(1 << 16) as usize);
    for i in 0..count {
        if buf.remaining() < RECORD_HEADER_SIZE {
            return Err(LayerFileError::Corrupted(format!(
                "record {i} of {count} is truncated"
            )));
        }
        let key = get_key(&mut buf);
        let lsn = Lsn(buf.get_u64());
        let tag = buf.get_u8();
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(LayerFileError::Corrupted(format!(
                "value of record {i} is truncated"
            )));
        }
        let bytes = Bytes::copy_from_slice(&buf[..len]);
        buf.advance(len);
        let value = match tag {
            TAG_IMAGE => Value::Image(bytes),
            TAG_WAL_RECORD => Value::WalRecord(bytes),
            other => {
                return Err(LayerFileError::Corrupted(format!(
                    "unknown value tag {other} in record {i}"
                )))
            }
        };
        records.push((key, lsn, value));
    }
    if buf.has_remaining() {
        return Err(LayerFileError::Corrupted(format!(
            "{} trailing bytes after {count} records",
            buf.remaining()
        )));
    }

    Ok((
        LayerFileHeader {
            magic,
            key_range,
            lsn_range,
            count,
        },
        records,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Bytes {
        let lsn_range = Lsn(0x10)..Lsn(0x30);
        let mut writer = BlobWriter::new(DELTA_FILE_MAGIC, Key::user(1, 0), &lsn_range);
        writer.append(
            Key::user(1, 1),
            Lsn(0x10),
            &Value::Image(Bytes::from_static(b"base")),
        );
        writer.append(
            Key::user(1, 1),
            Lsn(0x20),
            &Value::WalRecord(Bytes::from_static(b"+delta")),
        );
        let expected_size = writer.size();
        let file = writer.finish(Key::user(1, 10));
        assert_eq!(file.len() as u64, expected_size);
        file
    }

    #[test]
    fn read_back_what_was_written() {
        let file = sample();
        let (header, records) = read_layer_file(&file, DELTA_FILE_MAGIC).unwrap();

        assert_eq!(header.key_range, Key::user(1, 0)..Key::user(1, 10));
        assert_eq!(header.lsn_range, Lsn(0x10)..Lsn(0x30));
        assert_eq!(header.count, 2);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].1, Lsn(0x20));
        assert_eq!(
            records[1].2,
            Value::WalRecord(Bytes::from_static(b"+delta"))
        );
    }

    #[test]
    fn flipped_bit_is_detected() {
        let mut file = sample().to_vec();
        let mid = file.len() / 2;
        file[mid] ^= 0x01;
        let err = read_layer_file(&file, DELTA_FILE_MAGIC).unwrap_err();
        assert!(matches!(err, LayerFileError::Corrupted(_)), "{err}");
    }

    #[test]
    fn wrong_kind_is_detected() {
        let file = sample();
        let err = read_layer_file(&file, IMAGE_FILE_MAGIC).unwrap_err();
        assert!(err.to_string().contains("magic"), "{err}");
    }

    #[test]
    fn truncated_file_is_detected() {
        let file = sample();
        let err = read_layer_file(&file[..10], DELTA_FILE_MAGIC).unwrap_err();
        assert!(matches!(err, LayerFileError::Corrupted(_)));
    }
}
