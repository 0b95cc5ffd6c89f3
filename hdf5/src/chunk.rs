//! Chunked read engine: reassembles an element-aligned linear byte range
//! of a dataset from its chunk grid, inverting the filter pipeline per
//! chunk and backfilling uncovered output from the fill value.

use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;

use crate::btree1;
use crate::error::{Hdf5Error, Result};
use crate::filter;
use crate::message::FilterPipelineMessage;
use crate::superblock::Superblock;

/// Everything the engine needs to know about one chunked dataset.
pub struct ChunkedDataset<'a> {
    pub shape: &'a [u64],
    pub chunk_dims: &'a [u32],
    pub element_size: usize,
    /// Absolute address of the chunk index B-tree root.
    pub btree_address: u64,
    pub pipeline: Option<&'a FilterPipelineMessage>,
    pub fill_value: Option<&'a [u8]>,
}

impl ChunkedDataset<'_> {
    fn strides(&self) -> Vec<u64> {
        let mut strides = vec![1u64; self.shape.len()];
        for i in (0..self.shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.shape[i + 1];
        }
        strides
    }

    fn chunk_elements(&self) -> u64 {
        self.chunk_dims.iter().map(|&d| d as u64).product()
    }
}

/// Fill `out` with the decoded bytes of `[byte_offset, byte_offset +
/// out.len())` in the flattened row-major element stream.
///
/// `cancel` is polled between chunks; `tolerate_unreadable` lets chunks
/// that do not intersect the request go unread and unvalidated.
#[allow(clippy::too_many_arguments)]
pub fn read_range<R: Read + Seek>(
    reader: &mut R,
    sb: &Superblock,
    ds: &ChunkedDataset<'_>,
    byte_offset: u64,
    out: &mut [u8],
    cancel: Option<&AtomicBool>,
    tolerate_unreadable: bool,
    limit: u64,
) -> Result<()> {
    let es = ds.element_size as u64;
    let length = out.len() as u64;
    if es == 0 || byte_offset % es != 0 || length % es != 0 {
        return Err(Hdf5Error::MisalignedRead {
            offset: byte_offset,
            length,
            element_size: es,
        });
    }
    let rank = ds.shape.len();
    if rank == 0 || ds.chunk_dims.len() != rank {
        return Err(Hdf5Error::MalformedFile {
            offset: ds.btree_address,
            detail: format!(
                "chunk rank {} does not match dataspace rank {rank}",
                ds.chunk_dims.len()
            ),
        });
    }

    if let Some(fill) = ds.fill_value {
        if fill.len() != ds.element_size {
            return Err(Hdf5Error::UnsupportedFill(format!(
                "fill value of {} bytes for {}-byte elements",
                fill.len(),
                ds.element_size
            )));
        }
        for slot in out.chunks_mut(ds.element_size) {
            slot.copy_from_slice(fill);
        }
    } else {
        out.fill(0);
    }

    // Requested element window.
    let first = byte_offset / es;
    let last = first + length / es;
    let strides = ds.strides();
    let expected_len = (ds.chunk_elements() * es) as usize;

    let records = btree1::collect_chunks(reader, sb, ds.btree_address, rank)?;
    debug!(
        "chunked read [{first}, {last}): {} chunks indexed",
        records.len()
    );

    for record in &records {
        if let Some(flag) = cancel {
            if flag.load(Ordering::Relaxed) {
                return Err(Hdf5Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "chunked read cancelled",
                )));
            }
        }

        let start = &record.coords[..rank];
        for (d, (&s, &c)) in start.iter().zip(ds.chunk_dims).enumerate() {
            if s % c as u64 != 0 {
                return Err(Hdf5Error::MalformedTree {
                    offset: record.address,
                    detail: format!("chunk origin {s} not aligned to grid in dimension {d}"),
                });
            }
        }

        let overlaps = chunk_overlaps(ds, start, &strides, first, last);
        if !overlaps && tolerate_unreadable {
            continue;
        }

        reader.seek(SeekFrom::Start(record.address))?;
        let raw_len = crate::raw::checked_len(record.size_on_disk as u64, limit)?;
        let mut raw = vec![0u8; raw_len];
        reader.read_exact(&mut raw)?;

        let decoded = match ds.pipeline {
            Some(pipeline) => filter::decode_chunk(
                pipeline,
                raw,
                record.filter_mask,
                ds.element_size,
                expected_len,
                ds.fill_value,
                record.address,
                limit,
            )?,
            None => {
                if raw.len() != expected_len {
                    return Err(Hdf5Error::MalformedFile {
                        offset: record.address,
                        detail: format!(
                            "unfiltered chunk of {} bytes, expected {expected_len}",
                            raw.len()
                        ),
                    });
                }
                raw
            }
        };

        if overlaps {
            copy_chunk_elements(ds, start, &strides, &decoded, first, last, out);
        }
    }

    Ok(())
}

/// Conservative bounding-box test in linear element space.
fn chunk_overlaps(
    ds: &ChunkedDataset<'_>,
    start: &[u64],
    strides: &[u64],
    first: u64,
    last: u64,
) -> bool {
    let mut min = 0u64;
    let mut max = 0u64;
    for (d, &s) in start.iter().enumerate() {
        if s >= ds.shape[d] {
            return false;
        }
        let end = (s + ds.chunk_dims[d] as u64).min(ds.shape[d]) - 1;
        min += s * strides[d];
        max += end * strides[d];
    }
    max >= first && min < last
}

/// Copy every chunk element that lands inside the request, one row-major
/// run along the last dimension at a time.
fn copy_chunk_elements(
    ds: &ChunkedDataset<'_>,
    start: &[u64],
    strides: &[u64],
    decoded: &[u8],
    first: u64,
    last: u64,
    out: &mut [u8],
) {
    let rank = ds.shape.len();
    let es = ds.element_size;
    let chunk_last = ds.chunk_dims[rank - 1] as u64;

    // Runs along the last dimension are linear-contiguous in both the
    // chunk and the dataset.
    let run_global = chunk_last.min(ds.shape[rank - 1].saturating_sub(start[rank - 1]));
    if run_global == 0 {
        return;
    }

    let mut local = vec![0u64; rank.saturating_sub(1)];
    'rows: loop {
        let mut in_bounds = true;
        let mut row_base = start[rank - 1] * strides[rank - 1];
        let mut local_row = 0u64;
        for d in 0..rank - 1 {
            let global = start[d] + local[d];
            if global >= ds.shape[d] {
                in_bounds = false;
                break;
            }
            row_base += global * strides[d];
            local_row = local_row * ds.chunk_dims[d] as u64 + local[d];
        }

        if in_bounds {
            let lo = row_base.max(first);
            let hi = (row_base + run_global).min(last);
            if lo < hi {
                let chunk_elem = local_row * chunk_last + (lo - row_base);
                let src = chunk_elem as usize * es;
                let dst = (lo - first) as usize * es;
                let len = (hi - lo) as usize * es;
                out[dst..dst + len].copy_from_slice(&decoded[src..src + len]);
            }
        }

        // Advance the odometer over the leading dimensions.
        for d in (0..rank - 1).rev() {
            local[d] += 1;
            if local[d] < ds.chunk_dims[d] as u64 {
                continue 'rows;
            }
            local[d] = 0;
        }
        break;
    }
}
