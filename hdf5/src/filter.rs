//! Filter pipeline inversion. Filters are declared in write order; a
//! chunk read applies their inverses in reverse declaration order, and a
//! chunk's filter mask exempts individual stages.

use std::io::Read;

use log::debug;

use crate::checksum::fletcher32;
use crate::error::{Hdf5Error, Result};
use crate::message::{FilterDescription, FilterPipelineMessage};

pub const FILTER_DEFLATE: u16 = 1;
pub const FILTER_SHUFFLE: u16 = 2;
pub const FILTER_FLETCHER32: u16 = 3;
pub const FILTER_SZIP: u16 = 4;
pub const FILTER_NBIT: u16 = 5;
pub const FILTER_SCALE_OFFSET: u16 = 6;

/// Invert the whole pipeline over one chunk's on-disk bytes.
///
/// `expected_len` is the chunk's logical byte size (chunk elements times
/// element size); `fill_value` feeds the scale-offset sentinel.
pub fn decode_chunk(
    pipeline: &FilterPipelineMessage,
    mut data: Vec<u8>,
    filter_mask: u32,
    element_size: usize,
    expected_len: usize,
    fill_value: Option<&[u8]>,
    at: u64,
    limit: u64,
) -> Result<Vec<u8>> {
    for (index, filter) in pipeline.filters.iter().enumerate().rev() {
        if filter_mask & (1 << index) != 0 {
            debug!("chunk at {at}: filter {} skipped by mask", filter.id);
            continue;
        }
        data = match filter.id {
            FILTER_DEFLATE => inflate(&data, at, limit)?,
            FILTER_SHUFFLE => unshuffle(&data, filter, element_size),
            FILTER_FLETCHER32 => verify_and_strip(data, at)?,
            FILTER_NBIT => nbit_unpack(&data, filter, at)?,
            FILTER_SCALE_OFFSET => {
                scale_offset_decode(&data, element_size, expected_len, fill_value, at)?
            }
            FILTER_SZIP => {
                return Err(Hdf5Error::UnsupportedFilter("szip".into()));
            }
            other => {
                return Err(Hdf5Error::UnsupportedFilter(format!(
                    "filter id {other} ({})",
                    filter.name
                )));
            }
        };
    }

    if data.len() != expected_len {
        return Err(Hdf5Error::MalformedFile {
            offset: at,
            detail: format!(
                "chunk decoded to {} bytes, expected {expected_len}",
                data.len()
            ),
        });
    }
    Ok(data)
}

fn inflate(data: &[u8], at: u64, limit: u64) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut decoder = flate2::read::ZlibDecoder::new(data).take(limit + 1);
    decoder.read_to_end(&mut out).map_err(|e| Hdf5Error::MalformedFile {
        offset: at,
        detail: format!("deflate stream: {e}"),
    })?;
    if out.len() as u64 > limit {
        return Err(Hdf5Error::AllocationLimit {
            requested: out.len() as u64,
            limit,
        });
    }
    Ok(out)
}

/// Undo the byte transposition: on disk all first bytes come first, then
/// all second bytes, and so on. Trailing bytes that do not fill a whole
/// element are stored unshuffled.
fn unshuffle(data: &[u8], filter: &FilterDescription, dataset_element_size: usize) -> Vec<u8> {
    let elem = filter
        .client_data
        .first()
        .map(|&v| v as usize)
        .unwrap_or(dataset_element_size);
    if elem <= 1 || data.len() < elem {
        return data.to_vec();
    }

    let count = data.len() / elem;
    let body = count * elem;
    let mut out = vec![0u8; data.len()];
    for byte_index in 0..elem {
        for element in 0..count {
            out[element * elem + byte_index] = data[byte_index * count + element];
        }
    }
    out[body..].copy_from_slice(&data[body..]);
    out
}

fn verify_and_strip(mut data: Vec<u8>, at: u64) -> Result<Vec<u8>> {
    if data.len() < 4 {
        return Err(Hdf5Error::MalformedFile {
            offset: at,
            detail: "chunk too small for its checksum".into(),
        });
    }
    let split = data.len() - 4;
    let stored = u32::from_le_bytes(data[split..].try_into().unwrap());
    let computed = fletcher32(&data[..split]);
    if stored != computed {
        return Err(Hdf5Error::ChecksumMismatch {
            offset: at + split as u64,
            stored,
            computed,
        });
    }
    data.truncate(split);
    Ok(data)
}

fn read_bits(data: &[u8], bit_pos: u64, nbits: u32, at: u64) -> Result<u64> {
    let end = bit_pos + nbits as u64;
    if end > data.len() as u64 * 8 {
        return Err(Hdf5Error::MalformedFile {
            offset: at,
            detail: "bit-packed stream truncated".into(),
        });
    }
    let mut value = 0u64;
    for i in 0..nbits as u64 {
        let p = bit_pos + i;
        let bit = (data[(p / 8) as usize] >> (p % 8)) & 1;
        value |= (bit as u64) << i;
    }
    Ok(value)
}

fn write_le(out: &mut [u8], value: u64) {
    for (i, b) in out.iter_mut().enumerate() {
        *b = (value >> (8 * i)) as u8;
    }
}

/// Unpack bit-aligned integer fields described by the filter's client
/// data: `[version, elements, element size, bit offset, bit precision]`.
fn nbit_unpack(data: &[u8], filter: &FilterDescription, at: u64) -> Result<Vec<u8>> {
    let cd = &filter.client_data;
    if cd.len() < 5 {
        return Err(Hdf5Error::UnsupportedFilter(format!(
            "n-bit with {} client values",
            cd.len()
        )));
    }
    let elements = cd[1] as usize;
    let elem_size = cd[2] as usize;
    let bit_offset = cd[3];
    let precision = cd[4];
    if elem_size == 0 || elem_size > 8 || precision == 0 || bit_offset + precision > 64 {
        return Err(Hdf5Error::UnsupportedFilter(format!(
            "n-bit field of {precision} bits at bit {bit_offset} in {elem_size}-byte elements"
        )));
    }

    let mut out = vec![0u8; elements * elem_size];
    for i in 0..elements {
        let value = read_bits(data, i as u64 * precision as u64, precision, at)?;
        let slot = &mut out[i * elem_size..(i + 1) * elem_size];
        write_le(slot, value << bit_offset);
    }
    Ok(out)
}

/// Scale-offset header is 21 bytes: packed field width in bits, the
/// minimum-value width (always 8 here), the minimum value itself, and
/// padding. Values decode as `packed + minval`; an all-ones packed value
/// is the fill sentinel.
fn scale_offset_decode(
    data: &[u8],
    element_size: usize,
    expected_len: usize,
    fill_value: Option<&[u8]>,
    at: u64,
) -> Result<Vec<u8>> {
    if data.len() < 21 {
        return Err(Hdf5Error::MalformedFile {
            offset: at,
            detail: "scale-offset chunk shorter than its header".into(),
        });
    }
    let minbits = u32::from_le_bytes(data[0..4].try_into().unwrap());
    let minval_width = u32::from_le_bytes(data[4..8].try_into().unwrap());
    if minval_width != 8 {
        return Err(Hdf5Error::UnsupportedFilter(format!(
            "scale-offset minimum-value width {minval_width}"
        )));
    }
    let minval = u64::from_le_bytes(data[8..16].try_into().unwrap());
    if minbits > 64 {
        return Err(Hdf5Error::UnsupportedFilter(format!(
            "scale-offset width {minbits} bits"
        )));
    }
    if element_size == 0 || element_size > 8 {
        return Err(Hdf5Error::UnsupportedFilter(format!(
            "scale-offset over {element_size}-byte elements"
        )));
    }

    let count = expected_len / element_size;
    let packed = &data[21..];
    let mut out = vec![0u8; expected_len];
    let sentinel = if minbits == 64 {
        u64::MAX
    } else {
        (1u64 << minbits) - 1
    };
    for i in 0..count {
        let slot = &mut out[i * element_size..(i + 1) * element_size];
        if minbits == 0 {
            write_le(slot, minval);
            continue;
        }
        let raw = read_bits(packed, i as u64 * minbits as u64, minbits, at)?;
        if raw == sentinel {
            match fill_value {
                Some(fill) if fill.len() == element_size => slot.copy_from_slice(fill),
                _ => write_le(slot, 0),
            }
        } else {
            write_le(slot, raw.wrapping_add(minval));
        }
    }
    Ok(out)
}
