//! Superblock discovery and parsing.
//!
//! The superblock sits at a 512-byte aligned offset and starts with the
//! 8-byte format signature. Versions 0 and 1 describe the root group via
//! an embedded symbol table entry; versions 2 and 3 name the root object
//! header directly and close with a Jenkins lookup3 checksum.

use std::io::{Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use log::warn;

use crate::checksum::jenkins_lookup3;
use crate::error::{Hdf5Error, Result};
use crate::raw::Address;
use crate::symbol_table::SymbolTableEntry;
use crate::ChecksumPolicy;

pub const SIGNATURE: [u8; 8] = [0x89, 0x48, 0x44, 0x46, 0x0D, 0x0A, 0x1A, 0x0A];

/// Probe step for superblock discovery.
const PROBE_STEP: u64 = 512;

#[derive(Debug, Clone)]
pub struct Superblock {
    pub version: u8,
    /// Width in bytes of every file offset (1, 2, 4, or 8).
    pub offset_width: u8,
    /// Width in bytes of every file length (1, 2, 4, or 8).
    pub length_width: u8,
    pub group_leaf_k: u16,
    pub group_internal_k: u16,
    pub indexed_storage_k: u16,
    /// Resolved base address; stored file addresses are relative to it.
    pub base_address: u64,
    pub free_space_address: Address,
    pub eof_address: Address,
    pub driver_info_address: Address,
    pub superblock_extension: Address,
    /// Root group object header (resolved through the root entry in V0/V1).
    pub root_object_header: Address,
    /// The embedded root symbol table entry (V0/V1 only).
    pub root_entry: Option<SymbolTableEntry>,
    /// File offset the signature was found at.
    pub offset: u64,
}

impl Superblock {
    /// Probe 512-byte aligned offsets for the signature. First match wins.
    pub fn locate<R: Read + Seek>(reader: &mut R) -> Result<u64> {
        let size = reader.seek(SeekFrom::End(0))?;
        let mut offset = 0u64;
        while offset + SIGNATURE.len() as u64 <= size {
            reader.seek(SeekFrom::Start(offset))?;
            let mut sig = [0u8; 8];
            reader.read_exact(&mut sig)?;
            if sig == SIGNATURE {
                return Ok(offset);
            }
            offset += PROBE_STEP;
        }
        Err(Hdf5Error::MalformedFile {
            offset: size,
            detail: "no superblock signature found".into(),
        })
    }

    /// Locate and parse in one step.
    pub fn find_and_parse<R: Read + Seek>(
        reader: &mut R,
        policy: ChecksumPolicy,
    ) -> Result<Superblock> {
        let offset = Self::locate(reader)?;
        Self::parse(reader, offset, policy)
    }

    /// Parse the superblock whose signature sits at `offset`.
    pub fn parse<R: Read + Seek>(
        reader: &mut R,
        offset: u64,
        policy: ChecksumPolicy,
    ) -> Result<Superblock> {
        reader.seek(SeekFrom::Start(offset + SIGNATURE.len() as u64))?;
        let version = reader.read_u8()?;
        match version {
            0 | 1 => Self::parse_v0_v1(reader, offset, version),
            2 | 3 => Self::parse_v2_v3(reader, offset, version, policy),
            v => Err(Hdf5Error::UnsupportedFormat {
                offset,
                detail: format!("superblock version {v}"),
            }),
        }
    }

    fn parse_v0_v1<R: Read + Seek>(reader: &mut R, offset: u64, version: u8) -> Result<Superblock> {
        let free_space_version = reader.read_u8()?;
        let root_group_version = reader.read_u8()?;
        let _reserved = reader.read_u8()?;
        let shared_header_version = reader.read_u8()?;
        if free_space_version != 0 || root_group_version != 0 || shared_header_version != 0 {
            return Err(Hdf5Error::UnsupportedFormat {
                offset,
                detail: format!(
                    "sub-component versions {free_space_version}/{root_group_version}/{shared_header_version}"
                ),
            });
        }

        let offset_width = read_width(reader, offset)?;
        let length_width = read_width(reader, offset)?;
        let _reserved = reader.read_u8()?;

        let group_leaf_k = reader.read_u16::<LittleEndian>()?;
        let group_internal_k = reader.read_u16::<LittleEndian>()?;
        if group_leaf_k == 0 || group_internal_k == 0 {
            return Err(Hdf5Error::MalformedFile {
                offset,
                detail: "zero B-tree K value".into(),
            });
        }
        let _consistency_flags = reader.read_u32::<LittleEndian>()?;

        let indexed_storage_k = if version == 1 {
            let k = reader.read_u16::<LittleEndian>()?;
            let _reserved = reader.read_u16::<LittleEndian>()?;
            k
        } else {
            32
        };

        let base = Address::read(reader, offset_width)?;
        let free_space_address = Address::read(reader, offset_width)?;
        let eof_address = Address::read(reader, offset_width)?;
        let driver_info_address = Address::read(reader, offset_width)?;
        let root_entry = SymbolTableEntry::read(reader, offset_width)?;

        Ok(Superblock {
            version,
            offset_width,
            length_width,
            group_leaf_k,
            group_internal_k,
            indexed_storage_k,
            base_address: base.get().unwrap_or(offset),
            free_space_address,
            eof_address,
            driver_info_address,
            superblock_extension: Address::UNDEFINED,
            root_object_header: root_entry.object_header_address,
            root_entry: Some(root_entry),
            offset,
        })
    }

    fn parse_v2_v3<R: Read + Seek>(
        reader: &mut R,
        offset: u64,
        version: u8,
        policy: ChecksumPolicy,
    ) -> Result<Superblock> {
        let offset_width = read_width(reader, offset)?;
        let length_width = read_width(reader, offset)?;
        let _consistency_flags = reader.read_u8()?;

        let base = Address::read(reader, offset_width)?;
        let superblock_extension = Address::read(reader, offset_width)?;
        let eof_address = Address::read(reader, offset_width)?;
        let root_object_header = Address::read(reader, offset_width)?;
        let stored = reader.read_u32::<LittleEndian>()?;

        // The checksum covers everything between the signature's first
        // byte and the checksum field itself.
        let span = 12 + 4 * offset_width as usize;
        reader.seek(SeekFrom::Start(offset))?;
        let mut prefix = vec![0u8; span];
        reader.read_exact(&mut prefix)?;
        let computed = jenkins_lookup3(&prefix, 0);
        if stored != computed {
            let err = Hdf5Error::ChecksumMismatch {
                offset: offset + span as u64,
                stored,
                computed,
            };
            match policy {
                ChecksumPolicy::Strict => return Err(err),
                ChecksumPolicy::Warn => warn!("{err}"),
            }
        }

        Ok(Superblock {
            version,
            offset_width,
            length_width,
            group_leaf_k: 4,
            group_internal_k: 16,
            indexed_storage_k: 32,
            base_address: base.get().unwrap_or(offset),
            free_space_address: Address::UNDEFINED,
            eof_address,
            driver_info_address: Address::UNDEFINED,
            superblock_extension,
            root_object_header,
            root_entry: None,
            offset,
        })
    }

    /// Turn a stored (base-relative) address into a file offset.
    pub fn abs(&self, stored: u64) -> u64 {
        self.base_address + stored
    }

    /// Resolve an `Address` that the format requires to be defined.
    /// `at` is the offset of the structure that named it.
    pub fn resolve(&self, address: Address, at: u64) -> Result<u64> {
        Ok(self.abs(address.require(at)?))
    }
}

fn read_width<R: Read>(reader: &mut R, offset: u64) -> Result<u8> {
    let width = reader.read_u8()?;
    if !matches!(width, 1 | 2 | 4 | 8) {
        return Err(Hdf5Error::UnsupportedFormat {
            offset,
            detail: format!("offset/length width {width}"),
        });
    }
    Ok(width)
}
