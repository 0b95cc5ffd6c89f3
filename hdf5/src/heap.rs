//! Local heaps: per-group byte pools holding NUL-terminated link names.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};

use byteorder::ReadBytesExt;

use crate::error::{Hdf5Error, Result};
use crate::raw::{checked_len, Address};
use crate::superblock::Superblock;

pub const HEAP_SIGNATURE: [u8; 4] = *b"HEAP";

/// A decoded local heap: every string reachable by an aligned scan of the
/// data segment, keyed by its heap offset.
#[derive(Debug, Clone)]
pub struct LocalHeap {
    pub segment_address: u64,
    pub segment_size: u64,
    strings: BTreeMap<u64, String>,
}

impl LocalHeap {
    /// Read the heap block at `address` and its data segment.
    ///
    /// `limit` bounds the segment allocation; header-declared sizes above
    /// it are rejected rather than trusted.
    pub fn read<R: Read + Seek>(
        reader: &mut R,
        address: u64,
        sb: &Superblock,
        limit: u64,
    ) -> Result<Self> {
        reader.seek(SeekFrom::Start(address))?;

        let mut signature = [0u8; 4];
        reader.read_exact(&mut signature)?;
        if signature != HEAP_SIGNATURE {
            return Err(Hdf5Error::MalformedHeap {
                offset: address,
                detail: format!("bad local heap signature {signature:02X?}"),
            });
        }

        let version = reader.read_u8()?;
        if version != 0 {
            return Err(Hdf5Error::UnsupportedFormat {
                offset: address,
                detail: format!("local heap version {version}"),
            });
        }
        let mut reserved = [0u8; 3];
        reader.read_exact(&mut reserved)?;
        if reserved != [0, 0, 0] {
            return Err(Hdf5Error::MalformedHeap {
                offset: address,
                detail: "non-zero reserved bytes".into(),
            });
        }

        let segment_size = Address::read(reader, sb.length_width)?.require(address)?;
        let free_list_offset = Address::read(reader, sb.length_width)?.require(address)?;
        let segment_address = sb.resolve(Address::read(reader, sb.offset_width)?, address)?;

        let seg_len = checked_len(segment_size, limit)?;
        reader.seek(SeekFrom::Start(segment_address))?;
        let mut segment = vec![0u8; seg_len];
        reader.read_exact(&mut segment)?;

        // A free-list offset of 1 means no free blocks; the scan then
        // covers the whole segment.
        let stop = if free_list_offset == 1 {
            segment_size
        } else {
            free_list_offset.min(segment_size)
        };

        let mut strings = BTreeMap::new();
        let mut offset = 0u64;
        while offset < stop {
            let start = offset as usize;
            let nul = segment[start..]
                .iter()
                .position(|&b| b == 0)
                .ok_or(Hdf5Error::MalformedHeap {
                    offset: segment_address + offset,
                    detail: "unterminated heap string".into(),
                })?;
            let bytes = &segment[start..start + nul];
            let string =
                std::str::from_utf8(bytes).map_err(|_| Hdf5Error::MalformedString {
                    offset: segment_address + offset,
                })?;
            strings.insert(offset, string.to_string());
            offset += (nul as u64 + 1 + 7) & !7;
        }

        Ok(LocalHeap {
            segment_address,
            segment_size,
            strings,
        })
    }

    pub fn string_at(&self, offset: u64) -> Option<&str> {
        self.strings.get(&offset).map(String::as_str)
    }

    /// Look up a link name the format requires to be present.
    pub fn expect_string(&self, offset: u64) -> Result<&str> {
        self.string_at(offset).ok_or(Hdf5Error::MalformedHeap {
            offset: self.segment_address + offset,
            detail: "no heap string at offset".into(),
        })
    }
}
