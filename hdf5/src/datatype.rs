//! Datatype message decoding. Classes the read surface interprets are
//! decoded structurally; everything else is consumed and kept as an
//! opaque tag so the decoder stays total.

use std::io::{Read, Seek};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Hdf5Error, Result};
use crate::raw::Endian;

pub const CLASS_FIXED_POINT: u8 = 0;
pub const CLASS_TIME: u8 = 2;
pub const CLASS_FLOATING_POINT: u8 = 1;
pub const CLASS_STRING: u8 = 3;
pub const CLASS_BIT_FIELD: u8 = 4;
pub const CLASS_OPAQUE: u8 = 5;
pub const CLASS_COMPOUND: u8 = 6;
pub const CLASS_REFERENCE: u8 = 7;
pub const CLASS_ENUM: u8 = 8;
pub const CLASS_VARIABLE_LENGTH: u8 = 9;
pub const CLASS_ARRAY: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringPadding {
    NullTerminated,
    NullPadded,
    SpacePadded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Ascii,
    Utf8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Object,
    DatasetRegion,
    Attribute,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompoundMember {
    pub name: String,
    pub byte_offset: u64,
    pub datatype: Datatype,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DatatypeKind {
    FixedPoint {
        endian: Endian,
        signed: bool,
        lo_pad: bool,
        hi_pad: bool,
        bit_offset: u16,
        bit_precision: u16,
    },
    FloatingPoint {
        endian: Endian,
        bit_offset: u16,
        bit_precision: u16,
        exp_location: u8,
        exp_size: u8,
        mantissa_location: u8,
        mantissa_size: u8,
        exp_bias: u32,
        sign_location: u8,
    },
    String {
        padding: StringPadding,
        charset: Charset,
    },
    Compound {
        members: Vec<CompoundMember>,
    },
    Reference {
        kind: ReferenceKind,
    },
    VariableLength {
        is_string: bool,
        padding: StringPadding,
        charset: Charset,
        base: Box<Datatype>,
    },
    Array {
        dims: Vec<u32>,
        base: Box<Datatype>,
    },
    /// Consumed but not interpreted (time, bit field, opaque, enum).
    Opaque,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Datatype {
    pub version: u8,
    pub class: u8,
    /// Size in bytes of one element of this type.
    pub size: u64,
    pub kind: DatatypeKind,
}

fn malformed<R: Seek>(reader: &mut R, base: u64, detail: impl Into<String>) -> Hdf5Error {
    let offset = base + reader.stream_position().unwrap_or(0);
    Hdf5Error::MalformedMessage {
        kind: "datatype",
        offset,
        detail: detail.into(),
    }
}

impl Datatype {
    /// Byte order of the element data, for classes that carry one.
    pub fn endianness(&self) -> Option<Endian> {
        match &self.kind {
            DatatypeKind::FixedPoint { endian, .. }
            | DatatypeKind::FloatingPoint { endian, .. } => Some(*endian),
            _ => None,
        }
    }

    /// Ordered member list of a compound type.
    pub fn members(&self) -> Option<&[CompoundMember]> {
        match &self.kind {
            DatatypeKind::Compound { members } => Some(members),
            _ => None,
        }
    }

    /// Decode one datatype, consuming exactly its encoded bytes.
    ///
    /// `base` is the file offset of the cursor's origin; it only feeds
    /// error messages.
    pub fn decode<R: Read + Seek>(reader: &mut R, base: u64) -> Result<Datatype> {
        let class_and_version = reader.read_u8()?;
        let class = class_and_version & 0x0F;
        let version = class_and_version >> 4;
        if !(1..=3).contains(&version) {
            return Err(malformed(
                reader,
                base,
                format!("datatype version {version}"),
            ));
        }

        let mut bit_field_bytes = [0u8; 3];
        reader.read_exact(&mut bit_field_bytes)?;
        let bits = bit_field_bytes[0] as u32
            | (bit_field_bytes[1] as u32) << 8
            | (bit_field_bytes[2] as u32) << 16;
        let size = reader.read_u32::<LittleEndian>()? as u64;

        let kind = match class {
            CLASS_FIXED_POINT => {
                let bit_offset = reader.read_u16::<LittleEndian>()?;
                let bit_precision = reader.read_u16::<LittleEndian>()?;
                DatatypeKind::FixedPoint {
                    endian: if bits & 1 == 0 {
                        Endian::Little
                    } else {
                        Endian::Big
                    },
                    lo_pad: bits & 0x02 != 0,
                    hi_pad: bits & 0x04 != 0,
                    signed: bits & 0x08 != 0,
                    bit_offset,
                    bit_precision,
                }
            }
            CLASS_FLOATING_POINT => {
                if bits & 0x40 != 0 {
                    return Err(Hdf5Error::UnsupportedFormat {
                        offset: base,
                        detail: "VAX-ordered floating point".into(),
                    });
                }
                let bit_offset = reader.read_u16::<LittleEndian>()?;
                let bit_precision = reader.read_u16::<LittleEndian>()?;
                let exp_location = reader.read_u8()?;
                let exp_size = reader.read_u8()?;
                let mantissa_location = reader.read_u8()?;
                let mantissa_size = reader.read_u8()?;
                let exp_bias = reader.read_u32::<LittleEndian>()?;
                DatatypeKind::FloatingPoint {
                    endian: if bits & 1 == 0 {
                        Endian::Little
                    } else {
                        Endian::Big
                    },
                    bit_offset,
                    bit_precision,
                    exp_location,
                    exp_size,
                    mantissa_location,
                    mantissa_size,
                    exp_bias,
                    sign_location: ((bits >> 8) & 0xFF) as u8,
                }
            }
            CLASS_STRING => DatatypeKind::String {
                padding: string_padding(reader, base, bits & 0x0F)?,
                charset: charset(reader, base, (bits >> 4) & 0x0F)?,
            },
            CLASS_COMPOUND => {
                let member_count = (bits & 0xFFFF) as usize;
                let mut members = Vec::with_capacity(member_count);
                for _ in 0..member_count {
                    members.push(decode_member(reader, base, version, size)?);
                }
                DatatypeKind::Compound { members }
            }
            CLASS_REFERENCE => {
                let kind = match bits & 0x0F {
                    0 => ReferenceKind::Object,
                    1 => ReferenceKind::DatasetRegion,
                    2 => ReferenceKind::Attribute,
                    other => {
                        return Err(malformed(
                            reader,
                            base,
                            format!("reference subtype {other}"),
                        ))
                    }
                };
                DatatypeKind::Reference { kind }
            }
            CLASS_VARIABLE_LENGTH => {
                let is_string = bits & 0x0F == 1;
                let padding = string_padding(reader, base, (bits >> 4) & 0x0F)?;
                let cs = charset(reader, base, (bits >> 8) & 0x0F)?;
                let base_type = Datatype::decode(reader, base)?;
                DatatypeKind::VariableLength {
                    is_string,
                    padding,
                    charset: cs,
                    base: Box::new(base_type),
                }
            }
            CLASS_ARRAY => {
                let rank = reader.read_u8()? as usize;
                if version == 2 {
                    let mut reserved = [0u8; 3];
                    reader.read_exact(&mut reserved)?;
                }
                let mut dims = Vec::with_capacity(rank);
                for _ in 0..rank {
                    dims.push(reader.read_u32::<LittleEndian>()?);
                }
                if version == 2 {
                    // Permutation indices, stored but never honored.
                    for _ in 0..rank {
                        let _ = reader.read_u32::<LittleEndian>()?;
                    }
                }
                let base_type = Datatype::decode(reader, base)?;
                DatatypeKind::Array {
                    dims,
                    base: Box::new(base_type),
                }
            }
            CLASS_TIME => {
                let _bit_precision = reader.read_u16::<LittleEndian>()?;
                DatatypeKind::Opaque
            }
            CLASS_BIT_FIELD => {
                let _bit_offset = reader.read_u16::<LittleEndian>()?;
                let _bit_precision = reader.read_u16::<LittleEndian>()?;
                DatatypeKind::Opaque
            }
            CLASS_OPAQUE => {
                // The tag's stored length is already padded to 8.
                let tag_len = (bits & 0xFF) as usize;
                let mut tag = vec![0u8; tag_len];
                reader.read_exact(&mut tag)?;
                DatatypeKind::Opaque
            }
            CLASS_ENUM => {
                let base_type = Datatype::decode(reader, base)?;
                let member_count = (bits & 0xFFFF) as usize;
                for _ in 0..member_count {
                    read_name(reader, base, version < 3)?;
                }
                let mut values = vec![0u8; member_count * base_type.size as usize];
                reader.read_exact(&mut values)?;
                DatatypeKind::Opaque
            }
            other => {
                return Err(malformed(reader, base, format!("datatype class {other}")));
            }
        };

        Ok(Datatype {
            version,
            class,
            size,
            kind,
        })
    }
}

fn string_padding<R: Seek>(reader: &mut R, base: u64, value: u32) -> Result<StringPadding> {
    match value {
        0 => Ok(StringPadding::NullTerminated),
        1 => Ok(StringPadding::NullPadded),
        2 => Ok(StringPadding::SpacePadded),
        other => Err(malformed(reader, base, format!("string padding {other}"))),
    }
}

fn charset<R: Seek>(reader: &mut R, base: u64, value: u32) -> Result<Charset> {
    match value {
        0 => Ok(Charset::Ascii),
        1 => Ok(Charset::Utf8),
        other => Err(malformed(reader, base, format!("character set {other}"))),
    }
}

/// Read a NUL-terminated name; version 1/2 encodings pad it to a
/// multiple of 8 bytes.
fn read_name<R: Read + Seek>(reader: &mut R, base: u64, padded: bool) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let b = reader.read_u8()?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    if padded {
        let consumed = bytes.len() + 1;
        let pad = (8 - consumed % 8) % 8;
        for _ in 0..pad {
            let _ = reader.read_u8()?;
        }
    }
    String::from_utf8(bytes).map_err(|_| Hdf5Error::MalformedString {
        offset: base + reader.stream_position().unwrap_or(0),
    })
}

fn bytes_needed(value: u64) -> u8 {
    let mut width = 1u8;
    let mut v = value;
    while v > 0xFF {
        width += 1;
        v >>= 8;
    }
    width
}

fn decode_member<R: Read + Seek>(
    reader: &mut R,
    base: u64,
    version: u8,
    compound_size: u64,
) -> Result<CompoundMember> {
    let name = read_name(reader, base, version < 3)?;
    let byte_offset = match version {
        1 => {
            let offset = reader.read_u32::<LittleEndian>()? as u64;
            let _dimensionality = reader.read_u8()?;
            let mut reserved = [0u8; 3];
            reader.read_exact(&mut reserved)?;
            let _permutation = reader.read_u32::<LittleEndian>()?;
            let _reserved = reader.read_u32::<LittleEndian>()?;
            for _ in 0..4 {
                let _dim = reader.read_u32::<LittleEndian>()?;
            }
            offset
        }
        2 => reader.read_u32::<LittleEndian>()? as u64,
        _ => {
            // Version 3 stores the offset in the fewest bytes that can
            // hold the compound's size.
            let width = bytes_needed(compound_size);
            crate::raw::read_uint_le(reader, width)?
        }
    };
    let datatype = Datatype::decode(reader, base)?;
    if byte_offset + datatype.size > compound_size {
        return Err(malformed(
            reader,
            base,
            format!("member {name:?} extends past the compound's {compound_size} bytes"),
        ));
    }
    Ok(CompoundMember {
        name,
        byte_offset,
        datatype,
    })
}
