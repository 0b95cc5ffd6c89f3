//! Object header decoding, versions 1 and 2. Headers are message
//! streams; continuation messages chain extra chunks, which are parsed
//! iteratively until none remain.

use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, warn};

use crate::checksum::jenkins_lookup3;
use crate::error::{Hdf5Error, Result};
use crate::message::{
    Attribute, DataLayout, Dataspace, FillValue, FillValueOld, FilterPipelineMessage, Link,
    LinkInfo, Message, SymbolTableMessage, TYPE_CONTINUATION,
};
use crate::raw::{checked_len, read_uint_le};
use crate::superblock::Superblock;
use crate::ChecksumPolicy;

pub const OHDR_SIGNATURE: [u8; 4] = *b"OHDR";
pub const OCHK_SIGNATURE: [u8; 4] = *b"OCHK";

/// Messages carry a 2-byte creation order when this V2 flag is set.
const FLAG_TRACK_CREATION_ORDER: u8 = 0x04;
/// Attribute phase-change thresholds are stored when set.
const FLAG_ATTRIBUTE_PHASE_CHANGE: u8 = 0x10;
/// Four 4-byte timestamps are stored when set.
const FLAG_TIMES_STORED: u8 = 0x20;

#[derive(Debug, Clone)]
pub struct ObjectHeader {
    pub address: u64,
    pub version: u8,
    pub messages: Vec<Message>,
}

impl ObjectHeader {
    /// Read the object header at `address` (absolute), following every
    /// continuation chunk.
    pub fn read<R: Read + Seek>(
        reader: &mut R,
        sb: &Superblock,
        address: u64,
        policy: ChecksumPolicy,
        limit: u64,
    ) -> Result<ObjectHeader> {
        reader.seek(SeekFrom::Start(address))?;
        let mut head = [0u8; 4];
        reader.read_exact(&mut head)?;

        if head == OHDR_SIGNATURE {
            Self::read_v2(reader, sb, address, policy, limit)
        } else if head[0] == 1 && head[1] == 0 {
            Self::read_v1(reader, sb, address, head, limit)
        } else {
            Err(Hdf5Error::UnsupportedFormat {
                offset: address,
                detail: format!("object header prefix {head:02X?}"),
            })
        }
    }

    fn read_v1<R: Read + Seek>(
        reader: &mut R,
        sb: &Superblock,
        address: u64,
        head: [u8; 4],
        limit: u64,
    ) -> Result<ObjectHeader> {
        // The message count is advisory; the byte budget decides.
        let message_count = u16::from_le_bytes([head[2], head[3]]);
        let _reference_count = reader.read_u32::<LittleEndian>()?;
        let chunk0_size = reader.read_u32::<LittleEndian>()? as u64;
        let _padding = reader.read_u32::<LittleEndian>()?;
        debug!("v1 object header at {address}: {message_count} messages declared");

        let mut queue = VecDeque::new();
        queue.push_back((reader.stream_position()?, chunk0_size));

        let mut messages = Vec::new();
        let mut visited = std::collections::HashSet::new();
        while let Some((start, length)) = queue.pop_front() {
            if !visited.insert(start) {
                return Err(Hdf5Error::MalformedFile {
                    offset: start,
                    detail: "continuation chunk visited twice".into(),
                });
            }
            let area_len = checked_len(length, limit)?;
            reader.seek(SeekFrom::Start(start))?;
            let mut area = vec![0u8; area_len];
            reader.read_exact(&mut area)?;

            let mut pos = 0usize;
            while pos + 8 <= area.len() {
                let kind = u16::from_le_bytes([area[pos], area[pos + 1]]);
                let size = u16::from_le_bytes([area[pos + 2], area[pos + 3]]) as usize;
                let flags = area[pos + 4];
                let body_start = pos + 8;
                if body_start + size > area.len() {
                    return Err(Hdf5Error::MalformedFile {
                        offset: start + pos as u64,
                        detail: format!("message of {size} bytes overruns its chunk"),
                    });
                }
                check_message_flags(flags, start + pos as u64)?;

                // In version 1 the stored size includes padding to 8.
                let body = &area[body_start..body_start + size];
                let message = Message::decode(kind, body, start + body_start as u64, sb)?;
                if kind == TYPE_CONTINUATION {
                    if let Message::Continuation(c) = &message {
                        queue.push_back((sb.resolve(c.address, start + pos as u64)?, c.length));
                    }
                }
                messages.push(message);
                pos = body_start + size;
            }
        }

        Ok(ObjectHeader {
            address,
            version: 1,
            messages,
        })
    }

    fn read_v2<R: Read + Seek>(
        reader: &mut R,
        sb: &Superblock,
        address: u64,
        policy: ChecksumPolicy,
        limit: u64,
    ) -> Result<ObjectHeader> {
        let version = reader.read_u8()?;
        if version != 2 {
            return Err(Hdf5Error::UnsupportedFormat {
                offset: address,
                detail: format!("object header version {version}"),
            });
        }
        let flags = reader.read_u8()?;

        if flags & FLAG_TIMES_STORED != 0 {
            for _ in 0..4 {
                let _time = reader.read_u32::<LittleEndian>()?;
            }
        }
        if flags & FLAG_ATTRIBUTE_PHASE_CHANGE != 0 {
            let _max_compact = reader.read_u16::<LittleEndian>()?;
            let _min_dense = reader.read_u16::<LittleEndian>()?;
        }

        let size_width = 1u8 << (flags & 0x03);
        let chunk0_size = read_uint_le(reader, size_width)?;
        let tracked = flags & FLAG_TRACK_CREATION_ORDER != 0;

        let area_start = reader.stream_position()?;
        let area_len = checked_len(chunk0_size, limit)?;
        let mut area = vec![0u8; area_len];
        reader.read_exact(&mut area)?;

        // Chunk checksum spans from the signature through the last
        // message byte.
        let stored = reader.read_u32::<LittleEndian>()?;
        let span = (area_start - address) as usize + area_len;
        reader.seek(SeekFrom::Start(address))?;
        let mut chunk = vec![0u8; span];
        reader.read_exact(&mut chunk)?;
        verify_chunk_checksum(address, &chunk, stored, policy)?;

        let mut messages = Vec::new();
        let mut queue = VecDeque::new();
        parse_v2_messages(&area, area_start, tracked, sb, &mut messages, &mut queue)?;

        let mut visited = std::collections::HashSet::new();
        while let Some((start, length)) = queue.pop_front() {
            if !visited.insert(start) {
                return Err(Hdf5Error::MalformedFile {
                    offset: start,
                    detail: "continuation chunk visited twice".into(),
                });
            }
            let block_len = checked_len(length, limit)?;
            if block_len < 8 {
                return Err(Hdf5Error::MalformedFile {
                    offset: start,
                    detail: "continuation block too small".into(),
                });
            }
            reader.seek(SeekFrom::Start(start))?;
            let mut block = vec![0u8; block_len];
            reader.read_exact(&mut block)?;
            if block[..4] != OCHK_SIGNATURE {
                return Err(Hdf5Error::MalformedFile {
                    offset: start,
                    detail: format!("bad continuation signature {:02X?}", &block[..4]),
                });
            }
            let stored =
                u32::from_le_bytes(block[block_len - 4..].try_into().unwrap());
            verify_chunk_checksum(start, &block[..block_len - 4], stored, policy)?;

            parse_v2_messages(
                &block[4..block_len - 4],
                start + 4,
                tracked,
                sb,
                &mut messages,
                &mut queue,
            )?;
        }

        Ok(ObjectHeader {
            address,
            version: 2,
            messages,
        })
    }

    pub fn is_dataset(&self) -> bool {
        self.layout().is_some()
    }

    pub fn dataspace(&self) -> Option<&Dataspace> {
        self.messages.iter().find_map(|m| match m {
            Message::Dataspace(d) => Some(d),
            _ => None,
        })
    }

    pub fn datatype(&self) -> Option<&crate::datatype::Datatype> {
        self.messages.iter().find_map(|m| match m {
            Message::Datatype(d) => Some(d),
            _ => None,
        })
    }

    pub fn layout(&self) -> Option<&DataLayout> {
        self.messages.iter().find_map(|m| match m {
            Message::DataLayout(l) => Some(l),
            _ => None,
        })
    }

    pub fn fill_value(&self) -> Option<&FillValue> {
        self.messages.iter().find_map(|m| match m {
            Message::FillValue(f) => Some(f),
            _ => None,
        })
    }

    pub fn fill_value_old(&self) -> Option<&FillValueOld> {
        self.messages.iter().find_map(|m| match m {
            Message::FillValueOld(f) => Some(f),
            _ => None,
        })
    }

    pub fn filter_pipeline(&self) -> Option<&FilterPipelineMessage> {
        self.messages.iter().find_map(|m| match m {
            Message::FilterPipeline(p) => Some(p),
            _ => None,
        })
    }

    pub fn link_info(&self) -> Option<&LinkInfo> {
        self.messages.iter().find_map(|m| match m {
            Message::LinkInfo(l) => Some(l),
            _ => None,
        })
    }

    pub fn symbol_table(&self) -> Option<&SymbolTableMessage> {
        self.messages.iter().find_map(|m| match m {
            Message::SymbolTable(s) => Some(s),
            _ => None,
        })
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.messages.iter().filter_map(|m| match m {
            Message::Link(l) => Some(l),
            _ => None,
        })
    }

    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.messages.iter().filter_map(|m| match m {
            Message::Attribute(a) => Some(a),
            _ => None,
        })
    }

    pub fn modification_time(&self) -> Option<u32> {
        self.messages.iter().find_map(|m| match m {
            Message::ModificationTime(t) => Some(t.seconds),
            _ => None,
        })
    }
}

fn check_message_flags(flags: u8, at: u64) -> Result<()> {
    if flags & 0x02 != 0 {
        return Err(Hdf5Error::UnsupportedFormat {
            offset: at,
            detail: "shared header message".into(),
        });
    }
    Ok(())
}

fn verify_chunk_checksum(
    address: u64,
    data: &[u8],
    stored: u32,
    policy: ChecksumPolicy,
) -> Result<()> {
    let computed = jenkins_lookup3(data, 0);
    if stored != computed {
        let err = Hdf5Error::ChecksumMismatch {
            offset: address + data.len() as u64,
            stored,
            computed,
        };
        match policy {
            ChecksumPolicy::Strict => return Err(err),
            ChecksumPolicy::Warn => warn!("{err}"),
        }
    }
    Ok(())
}

fn parse_v2_messages(
    area: &[u8],
    area_offset: u64,
    tracked: bool,
    sb: &Superblock,
    messages: &mut Vec<Message>,
    queue: &mut VecDeque<(u64, u64)>,
) -> Result<()> {
    let prefix = if tracked { 6 } else { 4 };
    let mut pos = 0usize;
    while pos + prefix <= area.len() {
        let kind = area[pos] as u16;
        let size = u16::from_le_bytes([area[pos + 1], area[pos + 2]]) as usize;
        let flags = area[pos + 3];
        let body_start = pos + prefix;
        if body_start + size > area.len() {
            return Err(Hdf5Error::MalformedFile {
                offset: area_offset + pos as u64,
                detail: format!("message of {size} bytes overruns its chunk"),
            });
        }
        check_message_flags(flags, area_offset + pos as u64)?;

        let body = &area[body_start..body_start + size];
        let message = Message::decode(kind, body, area_offset + body_start as u64, sb)?;
        if kind == TYPE_CONTINUATION {
            if let Message::Continuation(c) = &message {
                queue.push_back((sb.resolve(c.address, area_offset + pos as u64)?, c.length));
            }
        }
        messages.push(message);
        pos = body_start + size;
    }
    Ok(())
}
