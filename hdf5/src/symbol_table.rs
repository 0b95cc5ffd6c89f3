//! Symbol table entries and symbol table nodes, the leaves of the v1
//! group machinery. Entries name an object header and, for groups with a
//! cached index, the group's own B-tree and local heap.

use std::io::{Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Hdf5Error, Result};
use crate::raw::Address;

pub const SNOD_SIGNATURE: [u8; 4] = *b"SNOD";

/// Cached scratch-pad content of a symbol table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SteCache {
    /// Cache type 0: nothing cached, scratch pad is discarded.
    None,
    /// Cache type 1: the entry names a group whose index is cached.
    Group {
        btree_address: Address,
        heap_address: Address,
    },
}

/// A symbol table entry: link-name heap offset, object header address,
/// and optional cached group index.
#[derive(Debug, Clone, Copy)]
pub struct SymbolTableEntry {
    pub link_name_offset: u64,
    pub object_header_address: Address,
    pub cache: SteCache,
    /// File offset the entry was read from.
    pub offset: u64,
}

impl SymbolTableEntry {
    /// Encoded size for a given offset width.
    pub fn encoded_size(offset_width: u8) -> u64 {
        2 * offset_width as u64 + 4 + 4 + 16
    }

    /// Decode one entry at the stream's current position.
    pub fn read<R: Read + Seek>(reader: &mut R, offset_width: u8) -> Result<Self> {
        let offset = reader.stream_position()?;

        let link_name_offset = Address::read(reader, offset_width)?.require(offset)?;
        let object_header_address = Address::read(reader, offset_width)?;
        let cache_type = reader.read_u32::<LittleEndian>()?;
        let _reserved = reader.read_u32::<LittleEndian>()?;

        let mut scratch = [0u8; 16];
        reader.read_exact(&mut scratch)?;

        let cache = match cache_type {
            0 => SteCache::None,
            1 => {
                let mut cur = std::io::Cursor::new(&scratch[..]);
                let btree_address = Address::read(&mut cur, offset_width)?;
                let heap_address = Address::read(&mut cur, offset_width)?;
                SteCache::Group {
                    btree_address,
                    heap_address,
                }
            }
            other => {
                return Err(Hdf5Error::MalformedFile {
                    offset,
                    detail: format!("unsupported symbol table entry cache type {other}"),
                })
            }
        };

        Ok(SymbolTableEntry {
            link_name_offset,
            object_header_address,
            cache,
            offset,
        })
    }
}

/// A symbol table node (`SNOD`): a B-tree leaf holding up to
/// `2 * group_leaf_k` entries.
#[derive(Debug, Clone)]
pub struct SymbolTableNode {
    pub entries: Vec<SymbolTableEntry>,
}

impl SymbolTableNode {
    /// Read the node at `address`. `max_entries` is `2 * group_leaf_k`
    /// from the superblock; a larger count is structural corruption.
    pub fn read<R: Read + Seek>(
        reader: &mut R,
        address: u64,
        offset_width: u8,
        max_entries: u16,
    ) -> Result<Self> {
        reader.seek(SeekFrom::Start(address))?;

        let mut signature = [0u8; 4];
        reader.read_exact(&mut signature)?;
        if signature != SNOD_SIGNATURE {
            return Err(Hdf5Error::MalformedFile {
                offset: address,
                detail: format!("bad symbol table node signature {signature:02X?}"),
            });
        }

        let version = reader.read_u8()?;
        if version != 1 {
            return Err(Hdf5Error::UnsupportedFormat {
                offset: address,
                detail: format!("symbol table node version {version}"),
            });
        }
        let _reserved = reader.read_u8()?;
        let count = reader.read_u16::<LittleEndian>()?;
        if count > max_entries {
            return Err(Hdf5Error::MalformedFile {
                offset: address,
                detail: format!("symbol table node claims {count} entries, limit {max_entries}"),
            });
        }

        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(SymbolTableEntry::read(reader, offset_width)?);
        }

        Ok(SymbolTableNode { entries })
    }
}
