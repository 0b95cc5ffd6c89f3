//! Global heap collections (`GCOL`): shared storage for variable-length
//! data referenced from datasets. Collections are materialized lazily by
//! the file view and cached per address.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Hdf5Error, Result};
use crate::raw::{checked_len, Address};
use crate::superblock::Superblock;

pub const GCOL_SIGNATURE: [u8; 4] = *b"GCOL";

#[derive(Debug, Clone)]
pub struct GlobalHeapCollection {
    pub address: u64,
    objects: HashMap<u16, Vec<u8>>,
}

impl GlobalHeapCollection {
    /// Read the collection at `address`.
    pub fn read<R: Read + Seek>(
        reader: &mut R,
        address: u64,
        sb: &Superblock,
        limit: u64,
    ) -> Result<Self> {
        reader.seek(SeekFrom::Start(address))?;

        let mut signature = [0u8; 4];
        reader.read_exact(&mut signature)?;
        if signature != GCOL_SIGNATURE {
            return Err(Hdf5Error::MalformedHeap {
                offset: address,
                detail: format!("bad global heap signature {signature:02X?}"),
            });
        }
        let version = reader.read_u8()?;
        if version != 1 {
            return Err(Hdf5Error::UnsupportedFormat {
                offset: address,
                detail: format!("global heap version {version}"),
            });
        }
        let mut reserved = [0u8; 3];
        reader.read_exact(&mut reserved)?;

        let collection_size = Address::read(reader, sb.length_width)?.require(address)?;
        checked_len(collection_size, limit)?;

        let header_len = 8 + sb.length_width as u64;
        let object_header_len = 8 + sb.length_width as u64;

        let mut objects = HashMap::new();
        let mut consumed = header_len;
        while consumed + object_header_len <= collection_size {
            let index = reader.read_u16::<LittleEndian>()?;
            let _reference_count = reader.read_u16::<LittleEndian>()?;
            let _reserved = reader.read_u32::<LittleEndian>()?;
            let size = Address::read(reader, sb.length_width)?.require(address)?;

            // Index 0 is the free-space object terminating the collection.
            if index == 0 {
                break;
            }

            let data_len = checked_len(size, limit)?;
            let mut data = vec![0u8; data_len];
            reader.read_exact(&mut data)?;
            let padded = (size + 7) & !7;
            if padded > size {
                reader.seek(SeekFrom::Current((padded - size) as i64))?;
            }

            objects.insert(index, data);
            consumed += object_header_len + padded;
        }

        Ok(GlobalHeapCollection { address, objects })
    }

    pub fn object(&self, index: u16) -> Option<&[u8]> {
        self.objects.get(&index).map(Vec::as_slice)
    }
}
