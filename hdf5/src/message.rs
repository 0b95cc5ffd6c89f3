//! Object header messages: a tagged variant per message kind. Unknown
//! kinds are kept as raw bytes so header iteration never gets stuck.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::datatype::Datatype;
use crate::error::{Hdf5Error, Result};
use crate::raw::Address;
use crate::superblock::Superblock;

pub const TYPE_NIL: u16 = 0;
pub const TYPE_DATASPACE: u16 = 1;
pub const TYPE_LINK_INFO: u16 = 2;
pub const TYPE_DATATYPE: u16 = 3;
pub const TYPE_FILL_VALUE_OLD: u16 = 4;
pub const TYPE_FILL_VALUE: u16 = 5;
pub const TYPE_LINK: u16 = 6;
pub const TYPE_DATA_LAYOUT: u16 = 8;
pub const TYPE_FILTER_PIPELINE: u16 = 11;
pub const TYPE_ATTRIBUTE: u16 = 12;
pub const TYPE_CONTINUATION: u16 = 16;
pub const TYPE_SYMBOL_TABLE: u16 = 17;
pub const TYPE_MODIFICATION_TIME: u16 = 18;
pub const TYPE_BTREE_K_VALUES: u16 = 19;
pub const TYPE_ATTRIBUTE_INFO: u16 = 21;

fn malformed(kind: &'static str, offset: u64, detail: impl Into<String>) -> Hdf5Error {
    Hdf5Error::MalformedMessage {
        kind,
        offset,
        detail: detail.into(),
    }
}

/// Read a u32-prefixed byte run, rejecting sizes the message cannot hold.
fn read_sized(
    cur: &mut Cursor<&[u8]>,
    body_len: usize,
    kind: &'static str,
    at: u64,
) -> Result<Vec<u8>> {
    let size = cur.read_u32::<LittleEndian>()? as usize;
    if size > body_len {
        return Err(malformed(kind, at, format!("{size}-byte payload")));
    }
    let mut data = vec![0u8; size];
    cur.read_exact(&mut data)?;
    Ok(data)
}

/// The shape of a dataset or attribute. Rank 0 is scalar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataspace {
    pub dimensions: Vec<u64>,
    pub max_dimensions: Option<Vec<u64>>,
}

impl Dataspace {
    pub fn scalar() -> Self {
        Dataspace {
            dimensions: Vec::new(),
            max_dimensions: None,
        }
    }

    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    pub fn total_elements(&self) -> u64 {
        self.dimensions.iter().product()
    }

    pub fn decode(body: &[u8], at: u64, sb: &Superblock) -> Result<Dataspace> {
        let mut cur = Cursor::new(body);
        let version = cur.read_u8()?;
        let rank = cur.read_u8()? as usize;
        let flags = cur.read_u8()?;
        match version {
            1 => {
                let _reserved = cur.read_u8()?;
                let _reserved = cur.read_u32::<LittleEndian>()?;
            }
            2 => {
                let _space_type = cur.read_u8()?;
            }
            v => return Err(malformed("dataspace", at, format!("version {v}"))),
        }

        let mut dimensions = Vec::with_capacity(rank);
        for _ in 0..rank {
            dimensions.push(Address::read(&mut cur, sb.length_width)?.require(at)?);
        }
        let max_dimensions = if flags & 0x01 != 0 {
            let mut max = Vec::with_capacity(rank);
            for _ in 0..rank {
                // An unlimited dimension is stored as the sentinel.
                let dim = Address::read(&mut cur, sb.length_width)?;
                max.push(dim.get().unwrap_or(u64::MAX));
            }
            Some(max)
        } else {
            None
        };
        if version == 1 && flags & 0x02 != 0 {
            for _ in 0..rank {
                let _permutation = Address::read(&mut cur, sb.length_width)?;
            }
        }

        Ok(Dataspace {
            dimensions,
            max_dimensions,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub max_creation_index: Option<u64>,
    pub fractal_heap_address: Address,
    pub name_index_address: Address,
    pub creation_order_index_address: Option<Address>,
}

impl LinkInfo {
    pub fn decode(body: &[u8], at: u64, sb: &Superblock) -> Result<LinkInfo> {
        let mut cur = Cursor::new(body);
        let version = cur.read_u8()?;
        if version != 0 {
            return Err(malformed("link info", at, format!("version {version}")));
        }
        let flags = cur.read_u8()?;
        let max_creation_index = if flags & 0x01 != 0 {
            Some(cur.read_u64::<LittleEndian>()?)
        } else {
            None
        };
        let fractal_heap_address = Address::read(&mut cur, sb.offset_width)?;
        let name_index_address = Address::read(&mut cur, sb.offset_width)?;
        let creation_order_index_address = if flags & 0x02 != 0 {
            Some(Address::read(&mut cur, sb.offset_width)?)
        } else {
            None
        };
        Ok(LinkInfo {
            max_creation_index,
            fractal_heap_address,
            name_index_address,
            creation_order_index_address,
        })
    }
}

/// Old-style (message 4) fill value: raw bytes, no metadata.
#[derive(Debug, Clone)]
pub struct FillValueOld {
    pub data: Vec<u8>,
}

impl FillValueOld {
    pub fn decode(body: &[u8], at: u64) -> Result<FillValueOld> {
        let mut cur = Cursor::new(body);
        let size = cur.read_u32::<LittleEndian>()? as usize;
        if size > body.len() {
            return Err(malformed("old fill value", at, format!("{size}-byte value")));
        }
        let mut data = vec![0u8; size];
        cur.read_exact(&mut data)?;
        Ok(FillValueOld { data })
    }
}

#[derive(Debug, Clone)]
pub struct FillValue {
    pub defined: bool,
    pub data: Option<Vec<u8>>,
}

impl FillValue {
    pub fn decode(body: &[u8], at: u64) -> Result<FillValue> {
        let mut cur = Cursor::new(body);
        let version = cur.read_u8()?;
        match version {
            1 | 2 => {
                let _alloc_time = cur.read_u8()?;
                let _write_time = cur.read_u8()?;
                let defined = cur.read_u8()? != 0;
                let data = if version == 1 || defined {
                    Some(read_sized(&mut cur, body.len(), "fill value", at)?)
                } else {
                    None
                };
                Ok(FillValue { defined, data })
            }
            3 => {
                let flags = cur.read_u8()?;
                let defined = flags & 0x20 != 0;
                let data = if defined {
                    Some(read_sized(&mut cur, body.len(), "fill value", at)?)
                } else {
                    None
                };
                Ok(FillValue { defined, data })
            }
            v => Err(malformed("fill value", at, format!("version {v}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub enum LinkTarget {
    Hard { address: Address },
    Soft { target: String },
    Other { link_type: u8, data: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct Link {
    pub name: String,
    pub creation_order: Option<u64>,
    pub target: LinkTarget,
}

impl Link {
    pub fn decode(body: &[u8], at: u64, sb: &Superblock) -> Result<Link> {
        let mut cur = Cursor::new(body);
        let version = cur.read_u8()?;
        if version != 1 {
            return Err(malformed("link", at, format!("version {version}")));
        }
        let flags = cur.read_u8()?;
        let link_type = if flags & 0x08 != 0 { cur.read_u8()? } else { 0 };
        let creation_order = if flags & 0x04 != 0 {
            Some(cur.read_u64::<LittleEndian>()?)
        } else {
            None
        };
        if flags & 0x10 != 0 {
            let _charset = cur.read_u8()?;
        }
        let name_len_width = 1u8 << (flags & 0x03);
        let name_len = crate::raw::read_uint_le(&mut cur, name_len_width)? as usize;
        if name_len > body.len() {
            return Err(malformed("link", at, format!("{name_len}-byte name")));
        }
        let mut name_bytes = vec![0u8; name_len];
        cur.read_exact(&mut name_bytes)?;
        let name = String::from_utf8(name_bytes)
            .map_err(|_| Hdf5Error::MalformedString { offset: at })?;

        let target = match link_type {
            0 => LinkTarget::Hard {
                address: Address::read(&mut cur, sb.offset_width)?,
            },
            1 => {
                let len = cur.read_u16::<LittleEndian>()? as usize;
                let mut target = vec![0u8; len];
                cur.read_exact(&mut target)?;
                LinkTarget::Soft {
                    target: String::from_utf8(target)
                        .map_err(|_| Hdf5Error::MalformedString { offset: at })?,
                }
            }
            other => {
                let mut data = Vec::new();
                cur.read_to_end(&mut data)?;
                LinkTarget::Other {
                    link_type: other,
                    data,
                }
            }
        };

        Ok(Link {
            name,
            creation_order,
            target,
        })
    }
}

#[derive(Debug, Clone)]
pub enum DataLayout {
    Compact {
        data: Vec<u8>,
    },
    Contiguous {
        address: Address,
        size: u64,
    },
    Chunked {
        /// Chunk extent per dataspace dimension (the element-size
        /// dimension is split off into `element_size`).
        chunk_dims: Vec<u32>,
        element_size: u32,
        btree_address: Address,
    },
}

impl DataLayout {
    pub fn decode(body: &[u8], at: u64, sb: &Superblock) -> Result<DataLayout> {
        let mut cur = Cursor::new(body);
        let version = cur.read_u8()?;
        match version {
            1 | 2 => Self::decode_v1_v2(&mut cur, at, sb),
            3 => Self::decode_v3(&mut cur, at, sb),
            4 => Self::decode_v4(&mut cur, at, sb),
            v => Err(malformed("data layout", at, format!("version {v}"))),
        }
    }

    fn decode_v1_v2(cur: &mut Cursor<&[u8]>, at: u64, sb: &Superblock) -> Result<DataLayout> {
        let dimensionality = cur.read_u8()? as usize;
        let class = cur.read_u8()?;
        let mut reserved = [0u8; 5];
        cur.read_exact(&mut reserved)?;

        let address = if class != 0 {
            Some(Address::read(cur, sb.offset_width)?)
        } else {
            None
        };
        let mut dims = Vec::with_capacity(dimensionality);
        for _ in 0..dimensionality {
            dims.push(cur.read_u32::<LittleEndian>()?);
        }

        match class {
            0 => {
                let data = read_sized(cur, cur.get_ref().len(), "data layout", at)?;
                Ok(DataLayout::Compact { data })
            }
            1 => {
                let size = dims.iter().map(|&d| d as u64).product();
                Ok(DataLayout::Contiguous {
                    address: address.unwrap(),
                    size,
                })
            }
            2 => {
                // The element size rides along as the final dimension.
                let mut dims = dims;
                let element_size = dims.pop().ok_or_else(|| {
                    malformed("data layout", at, "chunked with zero rank")
                })?;
                Ok(DataLayout::Chunked {
                    chunk_dims: dims,
                    element_size,
                    btree_address: address.unwrap(),
                })
            }
            c => Err(malformed("data layout", at, format!("layout class {c}"))),
        }
    }

    fn decode_v3(cur: &mut Cursor<&[u8]>, at: u64, sb: &Superblock) -> Result<DataLayout> {
        let class = cur.read_u8()?;
        match class {
            0 => {
                let size = cur.read_u16::<LittleEndian>()? as usize;
                let mut data = vec![0u8; size];
                cur.read_exact(&mut data)?;
                Ok(DataLayout::Compact { data })
            }
            1 => {
                let address = Address::read(cur, sb.offset_width)?;
                let size = Address::read(cur, sb.length_width)?.require(at)?;
                Ok(DataLayout::Contiguous { address, size })
            }
            2 => {
                // Dimensionality counts the element-size dimension too.
                let dimensionality = cur.read_u8()? as usize;
                if dimensionality == 0 {
                    return Err(malformed("data layout", at, "chunked with zero rank"));
                }
                let btree_address = Address::read(cur, sb.offset_width)?;
                let mut dims = Vec::with_capacity(dimensionality);
                for _ in 0..dimensionality {
                    dims.push(cur.read_u32::<LittleEndian>()?);
                }
                let element_size = dims.pop().unwrap();
                Ok(DataLayout::Chunked {
                    chunk_dims: dims,
                    element_size,
                    btree_address,
                })
            }
            c => Err(malformed("data layout", at, format!("layout class {c}"))),
        }
    }

    fn decode_v4(cur: &mut Cursor<&[u8]>, at: u64, sb: &Superblock) -> Result<DataLayout> {
        let class = cur.read_u8()?;
        match class {
            0 | 1 => {
                // Same encodings as version 3.
                cur.set_position(cur.position() - 1);
                Self::decode_v3(cur, at, sb)
            }
            2 => Err(Hdf5Error::UnsupportedFormat {
                offset: at,
                detail: "version 4 chunk indexing".into(),
            }),
            c => Err(malformed("data layout", at, format!("layout class {c}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FilterDescription {
    pub id: u16,
    pub name: String,
    pub flags: u16,
    pub client_data: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct FilterPipelineMessage {
    pub filters: Vec<FilterDescription>,
}

impl FilterPipelineMessage {
    pub fn decode(body: &[u8], at: u64) -> Result<FilterPipelineMessage> {
        let mut cur = Cursor::new(body);
        let version = cur.read_u8()?;
        let count = cur.read_u8()?;
        match version {
            1 => {
                let _reserved = cur.read_u16::<LittleEndian>()?;
                let _reserved = cur.read_u32::<LittleEndian>()?;
            }
            2 => {}
            v => return Err(malformed("filter pipeline", at, format!("version {v}"))),
        }

        let mut filters = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = cur.read_u16::<LittleEndian>()?;
            let name_length = if version == 1 || id >= 256 {
                cur.read_u16::<LittleEndian>()? as usize
            } else {
                0
            };
            let flags = cur.read_u16::<LittleEndian>()?;
            let client_count = cur.read_u16::<LittleEndian>()? as usize;

            let mut name_bytes = vec![0u8; name_length];
            cur.read_exact(&mut name_bytes)?;
            if version == 1 && name_length % 8 != 0 {
                let pad = 8 - name_length % 8;
                for _ in 0..pad {
                    let _ = cur.read_u8()?;
                }
            }
            let nul = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
            let name = String::from_utf8_lossy(&name_bytes[..nul]).into_owned();

            let mut client_data = Vec::with_capacity(client_count);
            for _ in 0..client_count {
                client_data.push(cur.read_u32::<LittleEndian>()?);
            }
            if version == 1 && client_count % 2 == 1 {
                let _pad = cur.read_u32::<LittleEndian>()?;
            }

            filters.push(FilterDescription {
                id,
                name,
                flags,
                client_data,
            });
        }
        Ok(FilterPipelineMessage { filters })
    }
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub datatype: Datatype,
    pub dataspace: Dataspace,
    /// Raw value bytes, `dataspace.total_elements() * datatype.size` long.
    pub data: Vec<u8>,
}

impl Attribute {
    pub fn decode(body: &[u8], at: u64, sb: &Superblock) -> Result<Attribute> {
        let mut cur = Cursor::new(body);
        let version = cur.read_u8()?;
        if !(1..=3).contains(&version) {
            return Err(malformed("attribute", at, format!("version {version}")));
        }
        let flags = cur.read_u8()?;
        if version >= 2 && flags & 0x03 != 0 {
            return Err(Hdf5Error::UnsupportedFormat {
                offset: at,
                detail: "shared attribute datatype/dataspace".into(),
            });
        }
        let name_size = cur.read_u16::<LittleEndian>()? as usize;
        let datatype_size = cur.read_u16::<LittleEndian>()? as usize;
        let dataspace_size = cur.read_u16::<LittleEndian>()? as usize;
        if version == 3 {
            let _charset = cur.read_u8()?;
        }

        let padded = version == 1;
        let name_bytes = read_block(&mut cur, name_size, padded)?;
        let nul = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
        let name = String::from_utf8(name_bytes[..nul].to_vec())
            .map_err(|_| Hdf5Error::MalformedString { offset: at })?;

        let datatype_bytes = read_block(&mut cur, datatype_size, padded)?;
        let datatype = Datatype::decode(&mut Cursor::new(&datatype_bytes[..]), at)?;

        let dataspace_bytes = read_block(&mut cur, dataspace_size, padded)?;
        let dataspace = Dataspace::decode(&dataspace_bytes, at, sb)?;

        let value_len = dataspace.total_elements().saturating_mul(datatype.size);
        if value_len > body.len() as u64 {
            return Err(malformed("attribute", at, format!("{value_len}-byte value")));
        }
        let mut data = vec![0u8; value_len as usize];
        cur.read_exact(&mut data)?;

        Ok(Attribute {
            name,
            datatype,
            dataspace,
            data,
        })
    }
}

fn read_block(cur: &mut Cursor<&[u8]>, size: usize, padded: bool) -> Result<Vec<u8>> {
    let mut block = vec![0u8; size];
    cur.read_exact(&mut block)?;
    if padded && size % 8 != 0 {
        let pad = 8 - size % 8;
        for _ in 0..pad {
            let _ = cur.read_u8()?;
        }
    }
    Ok(block)
}

#[derive(Debug, Clone, Copy)]
pub struct Continuation {
    pub address: Address,
    pub length: u64,
}

impl Continuation {
    pub fn decode(body: &[u8], at: u64, sb: &Superblock) -> Result<Continuation> {
        let mut cur = Cursor::new(body);
        let address = Address::read(&mut cur, sb.offset_width)?;
        let length = Address::read(&mut cur, sb.length_width)?.require(at)?;
        Ok(Continuation { address, length })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SymbolTableMessage {
    pub btree_address: Address,
    pub heap_address: Address,
}

impl SymbolTableMessage {
    pub fn decode(body: &[u8], _at: u64, sb: &Superblock) -> Result<SymbolTableMessage> {
        let mut cur = Cursor::new(body);
        Ok(SymbolTableMessage {
            btree_address: Address::read(&mut cur, sb.offset_width)?,
            heap_address: Address::read(&mut cur, sb.offset_width)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ModificationTime {
    /// Seconds since the Unix epoch.
    pub seconds: u32,
}

impl ModificationTime {
    pub fn decode(body: &[u8], at: u64) -> Result<ModificationTime> {
        let mut cur = Cursor::new(body);
        let version = cur.read_u8()?;
        if version != 1 {
            return Err(malformed("modification time", at, format!("version {version}")));
        }
        let mut reserved = [0u8; 3];
        cur.read_exact(&mut reserved)?;
        Ok(ModificationTime {
            seconds: cur.read_u32::<LittleEndian>()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BTreeKValues {
    pub indexed_storage_k: u16,
    pub group_internal_k: u16,
    pub group_leaf_k: u16,
}

impl BTreeKValues {
    pub fn decode(body: &[u8], at: u64) -> Result<BTreeKValues> {
        let mut cur = Cursor::new(body);
        let version = cur.read_u8()?;
        if version != 0 {
            return Err(malformed("B-tree K values", at, format!("version {version}")));
        }
        Ok(BTreeKValues {
            indexed_storage_k: cur.read_u16::<LittleEndian>()?,
            group_internal_k: cur.read_u16::<LittleEndian>()?,
            group_leaf_k: cur.read_u16::<LittleEndian>()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AttributeInfo {
    pub max_creation_index: Option<u16>,
    pub fractal_heap_address: Address,
    pub name_index_address: Address,
    pub creation_order_index_address: Option<Address>,
}

impl AttributeInfo {
    pub fn decode(body: &[u8], at: u64, sb: &Superblock) -> Result<AttributeInfo> {
        let mut cur = Cursor::new(body);
        let version = cur.read_u8()?;
        if version != 0 {
            return Err(malformed("attribute info", at, format!("version {version}")));
        }
        let flags = cur.read_u8()?;
        let max_creation_index = if flags & 0x01 != 0 {
            Some(cur.read_u16::<LittleEndian>()?)
        } else {
            None
        };
        let fractal_heap_address = Address::read(&mut cur, sb.offset_width)?;
        let name_index_address = Address::read(&mut cur, sb.offset_width)?;
        let creation_order_index_address = if flags & 0x02 != 0 {
            Some(Address::read(&mut cur, sb.offset_width)?)
        } else {
            None
        };
        Ok(AttributeInfo {
            max_creation_index,
            fractal_heap_address,
            name_index_address,
            creation_order_index_address,
        })
    }
}

#[derive(Debug, Clone)]
pub enum Message {
    Nil,
    Dataspace(Dataspace),
    LinkInfo(LinkInfo),
    Datatype(Datatype),
    FillValueOld(FillValueOld),
    FillValue(FillValue),
    Link(Link),
    DataLayout(DataLayout),
    FilterPipeline(FilterPipelineMessage),
    Attribute(Attribute),
    Continuation(Continuation),
    SymbolTable(SymbolTableMessage),
    ModificationTime(ModificationTime),
    BTreeKValues(BTreeKValues),
    AttributeInfo(AttributeInfo),
    Unknown { kind: u16, bytes: Vec<u8> },
}

impl Message {
    /// Decode one message body. `at` is the body's file offset.
    pub fn decode(kind: u16, body: &[u8], at: u64, sb: &Superblock) -> Result<Message> {
        Ok(match kind {
            TYPE_NIL => Message::Nil,
            TYPE_DATASPACE => Message::Dataspace(Dataspace::decode(body, at, sb)?),
            TYPE_LINK_INFO => Message::LinkInfo(LinkInfo::decode(body, at, sb)?),
            TYPE_DATATYPE => {
                Message::Datatype(Datatype::decode(&mut Cursor::new(body), at)?)
            }
            TYPE_FILL_VALUE_OLD => Message::FillValueOld(FillValueOld::decode(body, at)?),
            TYPE_FILL_VALUE => Message::FillValue(FillValue::decode(body, at)?),
            TYPE_LINK => Message::Link(Link::decode(body, at, sb)?),
            TYPE_DATA_LAYOUT => Message::DataLayout(DataLayout::decode(body, at, sb)?),
            TYPE_FILTER_PIPELINE => {
                Message::FilterPipeline(FilterPipelineMessage::decode(body, at)?)
            }
            TYPE_ATTRIBUTE => Message::Attribute(Attribute::decode(body, at, sb)?),
            TYPE_CONTINUATION => Message::Continuation(Continuation::decode(body, at, sb)?),
            TYPE_SYMBOL_TABLE => Message::SymbolTable(SymbolTableMessage::decode(body, at, sb)?),
            TYPE_MODIFICATION_TIME => {
                Message::ModificationTime(ModificationTime::decode(body, at)?)
            }
            TYPE_BTREE_K_VALUES => Message::BTreeKValues(BTreeKValues::decode(body, at)?),
            TYPE_ATTRIBUTE_INFO => Message::AttributeInfo(AttributeInfo::decode(body, at, sb)?),
            other => Message::Unknown {
                kind: other,
                bytes: body.to_vec(),
            },
        })
    }
}
