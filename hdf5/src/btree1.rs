//! Version 1 B-trees (`TREE`): node type 0 indexes a group's symbol table
//! nodes, node type 1 indexes the chunks of a chunked dataset.

use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use log::debug;

use crate::error::{Hdf5Error, Result};
use crate::raw::Address;
use crate::superblock::Superblock;

pub const TREE_SIGNATURE: [u8; 4] = *b"TREE";

pub const NODE_TYPE_GROUP: u8 = 0;
pub const NODE_TYPE_CHUNK: u8 = 1;

/// One raw-data chunk named by a type-1 leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    /// Bytes the chunk occupies on disk (after filtering).
    pub size_on_disk: u32,
    /// Bit `i` set means filter `i` of the pipeline was skipped.
    pub filter_mask: u32,
    /// Element-space offset of the chunk, `rank + 1` values; the final
    /// coordinate is always zero (it spans the element-size dimension).
    pub coords: Vec<u64>,
    /// Absolute file address of the chunk data.
    pub address: u64,
}

struct NodeHeader {
    level: u8,
    entries_used: u16,
}

fn read_node_header<R: Read + Seek>(
    reader: &mut R,
    sb: &Superblock,
    address: u64,
    expected_type: u8,
    expected_level: Option<u8>,
) -> Result<NodeHeader> {
    reader.seek(SeekFrom::Start(address))?;

    let mut signature = [0u8; 4];
    reader.read_exact(&mut signature)?;
    if signature != TREE_SIGNATURE {
        return Err(Hdf5Error::MalformedTree {
            offset: address,
            detail: format!("bad v1 B-tree signature {signature:02X?}"),
        });
    }

    let node_type = reader.read_u8()?;
    if node_type != expected_type {
        return Err(Hdf5Error::MalformedTree {
            offset: address,
            detail: format!("node type {node_type}, expected {expected_type}"),
        });
    }
    let level = reader.read_u8()?;
    if let Some(expected) = expected_level {
        if level != expected {
            return Err(Hdf5Error::MalformedTree {
                offset: address,
                detail: format!("node level {level}, expected {expected}"),
            });
        }
    }
    let entries_used = reader.read_u16::<LittleEndian>()?;

    // Sibling pointers form a per-level list; descent does not follow
    // them, and undefined values are a valid end-of-list.
    let _left = Address::read(reader, sb.offset_width)?;
    let _right = Address::read(reader, sb.offset_width)?;

    Ok(NodeHeader {
        level,
        entries_used,
    })
}

/// Walk a group B-tree and return the SNOD addresses of every leaf entry,
/// left to right.
pub fn collect_group_leaves<R: Read + Seek>(
    reader: &mut R,
    sb: &Superblock,
    root_address: u64,
) -> Result<Vec<u64>> {
    let mut visited = HashSet::new();
    let mut leaves = Vec::new();
    walk_group(reader, sb, root_address, None, &mut visited, &mut leaves)?;
    Ok(leaves)
}

fn walk_group<R: Read + Seek>(
    reader: &mut R,
    sb: &Superblock,
    address: u64,
    expected_level: Option<u8>,
    visited: &mut HashSet<u64>,
    leaves: &mut Vec<u64>,
) -> Result<()> {
    if !visited.insert(address) {
        return Err(Hdf5Error::MalformedTree {
            offset: address,
            detail: "cycle in group B-tree".into(),
        });
    }

    let header = read_node_header(reader, sb, address, NODE_TYPE_GROUP, expected_level)?;
    let limit = 2 * sb.group_internal_k;
    if header.entries_used > limit {
        return Err(Hdf5Error::MalformedTree {
            offset: address,
            detail: format!("{} entries exceed 2K = {limit}", header.entries_used),
        });
    }
    debug!(
        "group btree node at {address}: level {}, {} entries",
        header.level, header.entries_used
    );

    // Keys (heap offsets) and child pointers alternate; the trailing key
    // is not needed for a full walk.
    let mut children = Vec::with_capacity(header.entries_used as usize);
    for _ in 0..header.entries_used {
        let _key = Address::read(reader, sb.length_width)?;
        let child = Address::read(reader, sb.offset_width)?.require(address)?;
        children.push(sb.abs(child));
    }

    if header.level == 0 {
        leaves.extend(children);
    } else {
        for child in children {
            walk_group(reader, sb, child, Some(header.level - 1), visited, leaves)?;
        }
    }
    Ok(())
}

/// Walk a chunk B-tree and return every chunk record. `rank` is the
/// dataspace rank; keys carry `rank + 1` coordinates.
pub fn collect_chunks<R: Read + Seek>(
    reader: &mut R,
    sb: &Superblock,
    root_address: u64,
    rank: usize,
) -> Result<Vec<ChunkRecord>> {
    let mut visited = HashSet::new();
    let mut records = Vec::new();
    walk_chunks(reader, sb, root_address, rank, None, &mut visited, &mut records)?;
    Ok(records)
}

fn walk_chunks<R: Read + Seek>(
    reader: &mut R,
    sb: &Superblock,
    address: u64,
    rank: usize,
    expected_level: Option<u8>,
    visited: &mut HashSet<u64>,
    records: &mut Vec<ChunkRecord>,
) -> Result<()> {
    if !visited.insert(address) {
        return Err(Hdf5Error::MalformedTree {
            offset: address,
            detail: "cycle in chunk B-tree".into(),
        });
    }

    let header = read_node_header(reader, sb, address, NODE_TYPE_CHUNK, expected_level)?;

    // Child addresses paired with the key that precedes each of them.
    let mut entries = Vec::with_capacity(header.entries_used as usize);
    for _ in 0..header.entries_used {
        let size_on_disk = reader.read_u32::<LittleEndian>()?;
        let filter_mask = reader.read_u32::<LittleEndian>()?;
        let mut coords = Vec::with_capacity(rank + 1);
        for _ in 0..rank + 1 {
            coords.push(reader.read_u64::<LittleEndian>()?);
        }
        let child = Address::read(reader, sb.offset_width)?.require(address)?;
        entries.push((size_on_disk, filter_mask, coords, sb.abs(child)));
    }

    for (size_on_disk, filter_mask, coords, child) in entries {
        if header.level == 0 {
            records.push(ChunkRecord {
                size_on_disk,
                filter_mask,
                coords,
                address: child,
            });
        } else {
            walk_chunks(
                reader,
                sb,
                child,
                rank,
                Some(header.level - 1),
                visited,
                records,
            )?;
        }
    }
    Ok(())
}
