//! End-to-end tests over miniature in-memory files, covering both
//! architectural variants of the group machinery, continuation chains,
//! chunked reassembly, and the filter pipeline.

use std::io::{Cursor, Write};

use hdf5::checksum::jenkins_lookup3;
use hdf5::{ChecksumPolicy, DatatypeKind, Hdf5File, OpenOptions};

// ---------------------------------------------------------------------
// Byte-image builders
// ---------------------------------------------------------------------

fn put(image: &mut Vec<u8>, offset: usize, bytes: &[u8]) {
    if image.len() < offset + bytes.len() {
        image.resize(offset + bytes.len(), 0);
    }
    image[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// Version-0 superblock with 8-byte widths; the root entry points at
/// `root_header` with a cached group index when one is given.
fn v0_superblock(root_header: u64, root_cache: Option<(u64, u64)>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&hdf5::superblock::SIGNATURE);
    out.extend_from_slice(&[0, 0, 0, 0, 0]);
    out.push(8);
    out.push(8);
    out.push(0);
    out.extend_from_slice(&4u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes()); // base address
    out.extend_from_slice(&[0xFF; 8]);
    out.extend_from_slice(&(1u64 << 20).to_le_bytes());
    out.extend_from_slice(&[0xFF; 8]);
    // Root symbol table entry.
    out.extend_from_slice(&0u64.to_le_bytes());
    out.extend_from_slice(&root_header.to_le_bytes());
    match root_cache {
        Some((btree, heap)) => {
            out.extend_from_slice(&1u32.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&btree.to_le_bytes());
            out.extend_from_slice(&heap.to_le_bytes());
        }
        None => {
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&[0u8; 16]);
        }
    }
    out
}

fn v3_superblock(root_header: u64, eof: u64) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&hdf5::superblock::SIGNATURE);
    out.push(3);
    out.push(8);
    out.push(8);
    out.push(0);
    out.extend_from_slice(&0u64.to_le_bytes());
    out.extend_from_slice(&[0xFF; 8]);
    out.extend_from_slice(&eof.to_le_bytes());
    out.extend_from_slice(&root_header.to_le_bytes());
    let sum = jenkins_lookup3(&out, 0);
    out.extend_from_slice(&sum.to_le_bytes());
    out
}

/// Version-1 object header: 8-byte-padded messages, byte budget in the
/// prefix.
fn v1_header(messages: &[(u16, Vec<u8>)]) -> Vec<u8> {
    let mut area = Vec::new();
    for (kind, body) in messages {
        let padded = (body.len() + 7) & !7;
        area.extend_from_slice(&kind.to_le_bytes());
        area.extend_from_slice(&(padded as u16).to_le_bytes());
        area.extend_from_slice(&[0; 4]);
        area.extend_from_slice(body);
        area.resize(area.len() + padded - body.len(), 0);
    }
    let mut out = Vec::new();
    out.push(1);
    out.push(0);
    out.extend_from_slice(&(messages.len() as u16).to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&(area.len() as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&area);
    out
}

/// Version-2 object header; `flags` selects chunk-size width and
/// optional timestamps.
fn v2_header(flags: u8, messages: &[(u16, Vec<u8>)]) -> Vec<u8> {
    let mut area = Vec::new();
    for (kind, body) in messages {
        area.push(*kind as u8);
        area.extend_from_slice(&(body.len() as u16).to_le_bytes());
        area.push(0);
        if flags & 0x04 != 0 {
            area.extend_from_slice(&0u16.to_le_bytes());
        }
        area.extend_from_slice(body);
    }
    let mut out = Vec::new();
    out.extend_from_slice(b"OHDR");
    out.push(2);
    out.push(flags);
    if flags & 0x20 != 0 {
        for _ in 0..4 {
            out.extend_from_slice(&0x6000_0000u32.to_le_bytes());
        }
    }
    match flags & 0x03 {
        0 => out.push(area.len() as u8),
        1 => out.extend_from_slice(&(area.len() as u16).to_le_bytes()),
        _ => out.extend_from_slice(&(area.len() as u32).to_le_bytes()),
    }
    out.extend_from_slice(&area);
    let sum = jenkins_lookup3(&out, 0);
    out.extend_from_slice(&sum.to_le_bytes());
    out
}

fn dataspace_body(dims: &[u64]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(1);
    out.push(dims.len() as u8);
    out.push(0);
    out.extend_from_slice(&[0; 5]);
    for d in dims {
        out.extend_from_slice(&d.to_le_bytes());
    }
    out
}

fn fixed_point_type(size: u32, signed: bool) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(0x10);
    out.push(if signed { 0x08 } else { 0x00 });
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&((size * 8) as u16).to_le_bytes());
    out
}

fn ascii_string_type(size: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(0x13);
    out.push(0x00);
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&size.to_le_bytes());
    out
}

fn compound_type(size: u32, members: &[(&str, u32, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(0x16);
    out.push(members.len() as u8);
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&size.to_le_bytes());
    for (name, offset, dt) in members {
        let mut field = Vec::new();
        field.extend_from_slice(name.as_bytes());
        field.push(0);
        while field.len() % 8 != 0 {
            field.push(0);
        }
        field.extend_from_slice(&offset.to_le_bytes());
        field.push(0);
        field.extend_from_slice(&[0; 3]);
        field.extend_from_slice(&[0; 8]); // permutation + reserved
        field.extend_from_slice(&[0; 16]); // dim sizes
        field.extend_from_slice(dt);
        out.extend_from_slice(&field);
    }
    out
}

fn contiguous_layout(address: u64, size: u64) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(3);
    out.push(1);
    out.extend_from_slice(&address.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out
}

fn chunked_layout(btree: u64, chunk_dims: &[u32], element_size: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(3);
    out.push(2);
    out.push((chunk_dims.len() + 1) as u8);
    out.extend_from_slice(&btree.to_le_bytes());
    for d in chunk_dims {
        out.extend_from_slice(&d.to_le_bytes());
    }
    out.extend_from_slice(&element_size.to_le_bytes());
    out
}

fn symbol_table_body(btree: u64, heap: u64) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&btree.to_le_bytes());
    out.extend_from_slice(&heap.to_le_bytes());
    out
}

fn hard_link_body(name: &str, target: u64) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(1);
    out.push(0x00);
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(&target.to_le_bytes());
    out
}

/// Local heap whose segment holds the given strings back to back,
/// 8-byte aligned. Returns the heap block and each string's offset.
fn local_heap(segment_address: u64, names: &[&str]) -> (Vec<u8>, Vec<u64>) {
    let mut segment = Vec::new();
    let mut offsets = Vec::new();
    for name in names {
        offsets.push(segment.len() as u64);
        segment.extend_from_slice(name.as_bytes());
        segment.push(0);
        while segment.len() % 8 != 0 {
            segment.push(0);
        }
    }
    let mut out = Vec::new();
    out.extend_from_slice(b"HEAP");
    out.push(0);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&(segment.len() as u64).to_le_bytes());
    out.extend_from_slice(&1u64.to_le_bytes()); // no free blocks
    out.extend_from_slice(&segment_address.to_le_bytes());
    out.extend_from_slice(&segment);
    (out, offsets)
}

/// Group B-tree leaf (type 0) whose children are SNOD addresses.
fn group_btree_leaf(children: &[(u64, u64)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"TREE");
    out.push(0);
    out.push(0);
    out.extend_from_slice(&(children.len() as u16).to_le_bytes());
    out.extend_from_slice(&[0xFF; 16]);
    for (key, child) in children {
        out.extend_from_slice(&key.to_le_bytes());
        out.extend_from_slice(&child.to_le_bytes());
    }
    out.extend_from_slice(&0u64.to_le_bytes());
    out
}

/// Symbol table node; a `Some` cache marks the entry as a group and
/// names its B-tree and heap.
fn snod(entries: &[(u64, u64, Option<(u64, u64)>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"SNOD");
    out.push(1);
    out.push(0);
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for (name_offset, header, cache) in entries {
        out.extend_from_slice(&name_offset.to_le_bytes());
        out.extend_from_slice(&header.to_le_bytes());
        match cache {
            Some((btree, heap)) => {
                out.extend_from_slice(&1u32.to_le_bytes());
                out.extend_from_slice(&0u32.to_le_bytes());
                out.extend_from_slice(&btree.to_le_bytes());
                out.extend_from_slice(&heap.to_le_bytes());
            }
            None => {
                out.extend_from_slice(&0u32.to_le_bytes());
                out.extend_from_slice(&0u32.to_le_bytes());
                out.extend_from_slice(&[0u8; 16]);
            }
        }
    }
    out
}

fn chunk_btree_leaf(entries: &[(u32, u32, Vec<u64>, u64)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"TREE");
    out.push(1);
    out.push(0);
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    out.extend_from_slice(&[0xFF; 16]);
    for (size, mask, coords, child) in entries {
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&mask.to_le_bytes());
        for c in coords {
            out.extend_from_slice(&c.to_le_bytes());
        }
        out.extend_from_slice(&child.to_le_bytes());
    }
    out
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn shuffle(data: &[u8], elem: usize) -> Vec<u8> {
    let count = data.len() / elem;
    let mut out = vec![0u8; data.len()];
    for element in 0..count {
        for byte in 0..elem {
            out[byte * count + element] = data[element * elem + byte];
        }
    }
    out
}

// ---------------------------------------------------------------------
// Scenario 1: minimal V1 file with a compound contiguous dataset
// ---------------------------------------------------------------------

fn shipment_file() -> Vec<u8> {
    let mut image = Vec::new();

    let datatype = compound_type(
        10,
        &[
            ("Id", 0, fixed_point_type(8, false)),
            ("origCountry", 8, ascii_string_type(2)),
        ],
    );

    // Layout: superblock 0..96, root header at 96, heap at 136,
    // group B-tree at 256, SNOD at 384, dataset header at 600,
    // data at 2208.
    let (heap, offsets) = local_heap(136 + 32, &["", "shipmentData"]);
    put(&mut image, 0, &v0_superblock(96, Some((256, 136))));
    put(
        &mut image,
        96,
        &v1_header(&[(hdf5::message::TYPE_SYMBOL_TABLE, symbol_table_body(256, 136))]),
    );
    put(&mut image, 136, &heap);
    put(&mut image, 256, &group_btree_leaf(&[(offsets[1], 384)]));
    put(&mut image, 384, &snod(&[(offsets[1], 600, None)]));
    put(
        &mut image,
        600,
        &v1_header(&[
            (hdf5::message::TYPE_DATASPACE, dataspace_body(&[1750])),
            (hdf5::message::TYPE_DATATYPE, datatype),
            (hdf5::message::TYPE_DATA_LAYOUT, contiguous_layout(2208, 17500)),
        ]),
    );

    let mut data = Vec::new();
    for i in 0..1750u64 {
        data.extend_from_slice(&i.to_le_bytes());
        data.extend_from_slice(&[b'D', b'E']);
    }
    put(&mut image, 2208, &data);
    image
}

#[test]
fn test_v1_compound_contiguous_dataset() {
    let image = shipment_file();
    let expected_head = image[2208..2218].to_vec();

    let file = Hdf5File::open(Cursor::new(image)).unwrap();
    let ds = file.get_dataset("/shipmentData").unwrap();

    let datatype = ds.datatype().unwrap();
    assert_eq!(datatype.size, 10);
    let members = datatype.members().unwrap();
    assert_eq!(members[0].name, "Id");
    assert_eq!(members[0].byte_offset, 0);
    assert!(matches!(
        members[0].datatype.kind,
        DatatypeKind::FixedPoint { .. }
    ));
    assert_eq!(members[1].name, "origCountry");

    assert_eq!(ds.dataspace().unwrap().dimensions, vec![1750]);

    let mut out = Vec::new();
    ds.read_bytes(0, 10, &mut out).unwrap();
    assert_eq!(out, expected_head);
}

#[test]
fn test_open_from_disk_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shipments.h5");
    std::fs::write(&path, shipment_file()).unwrap();

    let file = Hdf5File::open(std::io::BufReader::new(
        std::fs::File::open(&path).unwrap(),
    ))
    .unwrap();
    assert!(file.get_dataset("/shipmentData").is_some());
}

// ---------------------------------------------------------------------
// Scenario 2: V1 continuation chain
// ---------------------------------------------------------------------

#[test]
fn test_v1_continuation_combines_chunks_in_order() {
    let mut image = Vec::new();

    // First chunk holds exactly one continuation message (24 bytes).
    let mut cont = Vec::new();
    cont.extend_from_slice(&100208u64.to_le_bytes());
    cont.extend_from_slice(&112u64.to_le_bytes());
    let header = v1_header(&[(hdf5::message::TYPE_CONTINUATION, cont)]);

    // Second chunk: symbol table + NILs filling 112 bytes.
    let mut second = Vec::new();
    for (kind, body) in [
        (hdf5::message::TYPE_SYMBOL_TABLE, symbol_table_body(256, 136)),
        (hdf5::message::TYPE_NIL, vec![0u8; 24]),
        (hdf5::message::TYPE_NIL, vec![0u8; 48]),
    ] {
        second.extend_from_slice(&kind.to_le_bytes());
        second.extend_from_slice(&(body.len() as u16).to_le_bytes());
        second.extend_from_slice(&[0; 4]);
        second.extend_from_slice(&body);
    }
    assert_eq!(second.len(), 112);

    let (heap, offsets) = local_heap(136 + 32, &["", "leaf"]);
    // The root entry caches nothing; only the continuation's symbol
    // table message can name the child.
    put(&mut image, 0, &v0_superblock(96, None));
    put(&mut image, 96, &header);
    put(&mut image, 136, &heap);
    put(&mut image, 256, &group_btree_leaf(&[(offsets[1], 384)]));
    put(&mut image, 384, &snod(&[(offsets[1], 600, None)]));

    let mut compact = Vec::new();
    compact.push(3u8);
    compact.push(0); // compact
    compact.extend_from_slice(&4u16.to_le_bytes());
    compact.extend_from_slice(&[7, 8, 9, 10]);
    put(
        &mut image,
        600,
        &v2_header(
            0x01,
            &[
                (hdf5::message::TYPE_DATASPACE, dataspace_body(&[4])),
                (hdf5::message::TYPE_DATATYPE, fixed_point_type(1, false)),
                (hdf5::message::TYPE_DATA_LAYOUT, compact),
            ],
        ),
    );
    put(&mut image, 100208, &second);

    let file = Hdf5File::open(Cursor::new(image)).unwrap();
    // The symbol table only became visible through the continuation; the
    // root has the child it names.
    let ds = file.get_dataset("/leaf").unwrap();
    let mut out = Vec::new();
    ds.read_bytes(0, 4, &mut out).unwrap();
    assert_eq!(out, vec![7, 8, 9, 10]);
}

// ---------------------------------------------------------------------
// Scenario 3: V2 file with inline links
// ---------------------------------------------------------------------

#[test]
fn test_v2_inline_links() {
    let mut image = Vec::new();
    let root = v2_header(
        0b0010_0001, // timestamps + 2-byte chunk size
        &[
            (hdf5::message::TYPE_LINK, hard_link_body("B", 0x900)),
            (hdf5::message::TYPE_LINK, hard_link_body("A", 0x800)),
        ],
    );
    put(&mut image, 0x400, &root);
    put(&mut image, 0x800, &v2_header(0x01, &[]));
    put(&mut image, 0x900, &v2_header(0x01, &[]));
    let sb = v3_superblock(0x400, 1 << 16);
    put(&mut image, 0, &sb);

    let file = Hdf5File::open(Cursor::new(image)).unwrap();
    assert_eq!(file.root().child_names(), vec!["A", "B"]);
    assert!(file.get_group("/A").is_some());
    assert!(file.get_group("/B").is_some());
}

// ---------------------------------------------------------------------
// Scenario 4: V2 file with dense links
// ---------------------------------------------------------------------

fn dense_link_record(name: &str, target: u64) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(1); // version
    out.push(0x04); // creation order present
    out.extend_from_slice(&0u64.to_le_bytes());
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(&target.to_le_bytes());
    out
}

#[test]
fn test_v2_dense_links_sorted() {
    let mut image = Vec::new();

    // Fractal heap header at 0x1000, root direct block at 0x1400.
    let mut frhp = Vec::new();
    frhp.extend_from_slice(b"FRHP");
    frhp.push(0);
    frhp.extend_from_slice(&7u16.to_le_bytes());
    frhp.extend_from_slice(&0u16.to_le_bytes());
    frhp.push(0);
    frhp.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    frhp.extend_from_slice(&0u64.to_le_bytes());
    frhp.extend_from_slice(&[0xFF; 8]);
    frhp.extend_from_slice(&0u64.to_le_bytes());
    frhp.extend_from_slice(&[0xFF; 8]);
    for _ in 0..8 {
        frhp.extend_from_slice(&0u64.to_le_bytes());
    }
    frhp.extend_from_slice(&4u16.to_le_bytes()); // table width
    frhp.extend_from_slice(&512u64.to_le_bytes());
    frhp.extend_from_slice(&4096u64.to_le_bytes());
    frhp.extend_from_slice(&16u16.to_le_bytes()); // heap-space bits
    frhp.extend_from_slice(&1u16.to_le_bytes());
    frhp.extend_from_slice(&0x1400u64.to_le_bytes());
    frhp.extend_from_slice(&0u16.to_le_bytes()); // root is direct
    let sum = jenkins_lookup3(&frhp, 0);
    frhp.extend_from_slice(&sum.to_le_bytes());
    put(&mut image, 0x1000, &frhp);

    // Direct block: records for "c", "a", "b" at fixed offsets.
    let mut block = vec![0u8; 512];
    block[..4].copy_from_slice(b"FHDB");
    block[4] = 0;
    block[5..13].copy_from_slice(&0x1000u64.to_le_bytes());
    block[13..15].copy_from_slice(&0u16.to_le_bytes());
    let names = [("c", 0x800u64), ("a", 0x900), ("b", 0xA00)];
    let mut ids = Vec::new();
    let mut cursor = 32usize;
    for (name, target) in names {
        let record = dense_link_record(name, target);
        block[cursor..cursor + record.len()].copy_from_slice(&record);
        let mut id = vec![0u8];
        id.extend_from_slice(&(cursor as u16).to_le_bytes());
        id.extend_from_slice(&(record.len() as u32).to_le_bytes());
        ids.push(id);
        cursor += 64;
    }
    put(&mut image, 0x1400, &block);

    // Name-index B-tree v2: header at 0x1800, leaf at 0x1900, records
    // ordered by name hash (irrelevant to the materialized order).
    let mut leaf = Vec::new();
    leaf.extend_from_slice(b"BTLF");
    leaf.push(0);
    leaf.push(5);
    for (i, id) in ids.iter().enumerate() {
        leaf.extend_from_slice(&(i as u32).to_le_bytes());
        leaf.extend_from_slice(id);
    }
    let sum = jenkins_lookup3(&leaf, 0);
    leaf.extend_from_slice(&sum.to_le_bytes());
    put(&mut image, 0x1900, &leaf);

    let mut bthd = Vec::new();
    bthd.extend_from_slice(b"BTHD");
    bthd.push(0);
    bthd.push(5);
    bthd.extend_from_slice(&512u32.to_le_bytes());
    bthd.extend_from_slice(&11u16.to_le_bytes());
    bthd.extend_from_slice(&0u16.to_le_bytes());
    bthd.push(100);
    bthd.push(40);
    bthd.extend_from_slice(&0x1900u64.to_le_bytes());
    bthd.extend_from_slice(&3u16.to_le_bytes());
    bthd.extend_from_slice(&3u64.to_le_bytes());
    let sum = jenkins_lookup3(&bthd, 0);
    bthd.extend_from_slice(&sum.to_le_bytes());
    put(&mut image, 0x1800, &bthd);

    // Root header: link info pointing at the dense storage.
    let mut link_info = Vec::new();
    link_info.push(0);
    link_info.push(0);
    link_info.extend_from_slice(&0x1000u64.to_le_bytes());
    link_info.extend_from_slice(&0x1800u64.to_le_bytes());
    let root = v2_header(0x01, &[(hdf5::message::TYPE_LINK_INFO, link_info)]);
    put(&mut image, 0x400, &root);

    for target in [0x800usize, 0x900, 0xA00] {
        put(&mut image, target, &v2_header(0x01, &[]));
    }
    let sb = v3_superblock(0x400, 1 << 16);
    put(&mut image, 0, &sb);

    let file = Hdf5File::open(Cursor::new(image)).unwrap();
    assert_eq!(file.root().child_names(), vec!["a", "b", "c"]);
}

// ---------------------------------------------------------------------
// Scenarios 5 and 6: chunked storage, with and without filters
// ---------------------------------------------------------------------

/// Row-major u32 elements 0..48 in shape [6, 8].
fn grid_data() -> Vec<u8> {
    (0..48u32).flat_map(|v| v.to_le_bytes()).collect()
}

/// Extract one [4, 4] chunk starting at (r0, c0) from the [6, 8] grid,
/// zero-padded past the dataset edge.
fn grid_chunk(r0: u64, c0: u64) -> Vec<u8> {
    let mut out = Vec::new();
    for r in 0..4u64 {
        for c in 0..4u64 {
            let value = if r0 + r < 6 && c0 + c < 8 {
                ((r0 + r) * 8 + (c0 + c)) as u32
            } else {
                0
            };
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    out
}

fn chunked_file(pipeline: Option<(u16, Vec<u8>)>, encode: impl Fn(&[u8]) -> Vec<u8>) -> Vec<u8> {
    let mut image = Vec::new();

    let mut entries = Vec::new();
    let mut address = 0x4000u64;
    for (r0, c0) in [(0u64, 0u64), (0, 4), (4, 0), (4, 4)] {
        let encoded = encode(&grid_chunk(r0, c0));
        put(&mut image, address as usize, &encoded);
        entries.push((encoded.len() as u32, 0u32, vec![r0, c0, 0], address));
        address += 0x400;
    }
    put(&mut image, 0x2000, &chunk_btree_leaf(&entries));

    let mut messages = vec![
        (hdf5::message::TYPE_DATASPACE, dataspace_body(&[6, 8])),
        (hdf5::message::TYPE_DATATYPE, fixed_point_type(4, false)),
        (
            hdf5::message::TYPE_DATA_LAYOUT,
            chunked_layout(0x2000, &[4, 4], 4),
        ),
    ];
    if let Some((_, body)) = &pipeline {
        messages.push((hdf5::message::TYPE_FILTER_PIPELINE, body.clone()));
    }
    put(&mut image, 0x600, &v2_header(0x01, &messages));

    let root = v2_header(
        0x01,
        &[(hdf5::message::TYPE_LINK, hard_link_body("grid", 0x600))],
    );
    put(&mut image, 0x400, &root);
    let sb = v3_superblock(0x400, 1 << 16);
    put(&mut image, 0, &sb);
    image
}

#[test]
fn test_chunked_reassembly() {
    let image = chunked_file(None, |chunk| chunk.to_vec());
    let file = Hdf5File::open(Cursor::new(image)).unwrap();
    let ds = file.get_dataset("/grid").unwrap();

    let mut out = Vec::new();
    ds.read_bytes(0, 192, &mut out).unwrap();
    assert_eq!(out, grid_data());
}

#[test]
fn test_chunked_partial_reads_match_full_read() {
    let image = chunked_file(None, |chunk| chunk.to_vec());
    let file = Hdf5File::open(Cursor::new(image)).unwrap();
    let ds = file.get_dataset("/grid").unwrap();

    let full = grid_data();
    let mut out = Vec::new();
    for (offset, length) in [(0u64, 16u64), (16, 64), (100, 92), (188, 4)] {
        ds.read_bytes(offset, length, &mut out).unwrap();
        assert_eq!(
            out,
            &full[offset as usize..(offset + length) as usize],
            "window [{offset}, {})",
            offset + length
        );
    }
}

/// Pipeline message declaring shuffle(4) then deflate, version 1.
fn shuffle_deflate_pipeline() -> Vec<u8> {
    let mut body = Vec::new();
    body.push(1);
    body.push(2);
    body.extend_from_slice(&[0; 6]);
    for (id, name, cd) in [(2u16, &b"shuffle\0"[..], 4u32), (1, &b"deflate\0"[..], 6)] {
        body.extend_from_slice(&id.to_le_bytes());
        body.extend_from_slice(&8u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(name);
        body.extend_from_slice(&cd.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
    }
    body
}

#[test]
fn test_filter_pipeline_matches_unfiltered_reference() {
    let reference = chunked_file(None, |chunk| chunk.to_vec());
    let filtered = chunked_file(Some((0, shuffle_deflate_pipeline())), |chunk| {
        deflate(&shuffle(chunk, 4))
    });

    let ref_file = Hdf5File::open(Cursor::new(reference)).unwrap();
    let fil_file = Hdf5File::open(Cursor::new(filtered)).unwrap();

    let mut expected = Vec::new();
    ref_file
        .get_dataset("/grid")
        .unwrap()
        .read_bytes(0, 192, &mut expected)
        .unwrap();
    let mut out = Vec::new();
    fil_file
        .get_dataset("/grid")
        .unwrap()
        .read_bytes(0, 192, &mut out)
        .unwrap();
    assert_eq!(out, expected);
}

#[test]
fn test_dropping_unshuffle_is_detectable() {
    // Same bytes on disk, but the pipeline omits the shuffle stage.
    let mut deflate_only = Vec::new();
    deflate_only.push(1u8);
    deflate_only.push(1);
    deflate_only.extend_from_slice(&[0; 6]);
    deflate_only.extend_from_slice(&1u16.to_le_bytes());
    deflate_only.extend_from_slice(&8u16.to_le_bytes());
    deflate_only.extend_from_slice(&0u16.to_le_bytes());
    deflate_only.extend_from_slice(&1u16.to_le_bytes());
    deflate_only.extend_from_slice(b"deflate\0");
    deflate_only.extend_from_slice(&6u32.to_le_bytes());
    deflate_only.extend_from_slice(&0u32.to_le_bytes());

    let broken = chunked_file(Some((0, deflate_only)), |chunk| deflate(&shuffle(chunk, 4)));
    let file = Hdf5File::open(Cursor::new(broken)).unwrap();
    let mut out = Vec::new();
    file.get_dataset("/grid")
        .unwrap()
        .read_bytes(0, 192, &mut out)
        .unwrap();
    assert_ne!(out, grid_data());
}

// ---------------------------------------------------------------------
// Hard links, architectural equivalence, iterators
// ---------------------------------------------------------------------

#[test]
fn test_hard_link_canonical_path() {
    let mut image = Vec::new();
    let dataset = v2_header(
        0x01,
        &[
            (hdf5::message::TYPE_DATASPACE, dataspace_body(&[4])),
            (hdf5::message::TYPE_DATATYPE, fixed_point_type(2, false)),
            (hdf5::message::TYPE_DATA_LAYOUT, contiguous_layout(0x3000, 8)),
        ],
    );
    put(&mut image, 0x600, &dataset);
    put(&mut image, 0x3000, &[1, 0, 2, 0, 3, 0, 4, 0]);

    let root = v2_header(
        0x01,
        &[
            (hdf5::message::TYPE_LINK, hard_link_body("alias", 0x600)),
            (hdf5::message::TYPE_LINK, hard_link_body("data", 0x600)),
        ],
    );
    put(&mut image, 0x400, &root);
    let sb = v3_superblock(0x400, 1 << 16);
    put(&mut image, 0, &sb);

    let file = Hdf5File::open(Cursor::new(image)).unwrap();
    let alias = file.get_dataset("/alias").unwrap();
    let data = file.get_dataset("/data").unwrap();

    // Exactly one of the two names is canonical, and the other names it.
    let paths = [alias.hard_link_path(), data.hard_link_path()];
    assert_eq!(paths.iter().filter(|p| p.is_none()).count(), 1);
    let canonical = paths.iter().flatten().next().unwrap();
    assert!(*canonical == "/alias" || *canonical == "/data");

    // Both names read the same bytes.
    let mut a = Vec::new();
    let mut b = Vec::new();
    alias.read_bytes(0, 8, &mut a).unwrap();
    data.read_bytes(0, 8, &mut b).unwrap();
    assert_eq!(a, b);
}

/// The same logical hierarchy written with both group architectures
/// yields the same (path, dims, element size, bytes) tuples.
#[test]
fn test_v1_v2_equivalence() {
    let payload: Vec<u8> = (0..16u32).flat_map(|v| v.to_le_bytes()).collect();

    // V1: root -> "g" (own heap + B-tree + SNOD) -> "d".
    let mut v1 = Vec::new();
    {
        let (root_heap, root_offsets) = local_heap(136 + 32, &["", "g"]);
        put(&mut v1, 0, &v0_superblock(96, Some((256, 136))));
        put(
            &mut v1,
            96,
            &v1_header(&[(hdf5::message::TYPE_SYMBOL_TABLE, symbol_table_body(256, 136))]),
        );
        put(&mut v1, 136, &root_heap);
        put(&mut v1, 256, &group_btree_leaf(&[(root_offsets[1], 384)]));
        put(&mut v1, 384, &snod(&[(root_offsets[1], 600, Some((900, 700)))]));

        // Group "g" at 600 with its own machinery.
        let (g_heap, g_offsets) = local_heap(700 + 32, &["", "d"]);
        put(
            &mut v1,
            600,
            &v1_header(&[(hdf5::message::TYPE_SYMBOL_TABLE, symbol_table_body(900, 700))]),
        );
        put(&mut v1, 700, &g_heap);
        put(&mut v1, 900, &group_btree_leaf(&[(g_offsets[1], 1024)]));
        put(&mut v1, 1024, &snod(&[(g_offsets[1], 1200, None)]));

        put(
            &mut v1,
            1200,
            &v1_header(&[
                (hdf5::message::TYPE_DATASPACE, dataspace_body(&[16])),
                (hdf5::message::TYPE_DATATYPE, fixed_point_type(4, false)),
                (hdf5::message::TYPE_DATA_LAYOUT, contiguous_layout(0x3000, 64)),
            ]),
        );
        put(&mut v1, 0x3000, &payload);
    }

    // V2: root -> "g" -> "d", all inline links.
    let mut v2 = Vec::new();
    {
        let dataset = v2_header(
            0x01,
            &[
                (hdf5::message::TYPE_DATASPACE, dataspace_body(&[16])),
                (hdf5::message::TYPE_DATATYPE, fixed_point_type(4, false)),
                (hdf5::message::TYPE_DATA_LAYOUT, contiguous_layout(0x3000, 64)),
            ],
        );
        put(&mut v2, 0x700, &dataset);
        let g = v2_header(
            0x01,
            &[(hdf5::message::TYPE_LINK, hard_link_body("d", 0x700))],
        );
        put(&mut v2, 0x600, &g);
        let root = v2_header(
            0x01,
            &[(hdf5::message::TYPE_LINK, hard_link_body("g", 0x600))],
        );
        put(&mut v2, 0x400, &root);
        put(&mut v2, 0x3000, &payload);
        let sb = v3_superblock(0x400, 1 << 16);
        put(&mut v2, 0, &sb);
    }

    let f1 = Hdf5File::open(Cursor::new(v1)).unwrap();
    let f2 = Hdf5File::open(Cursor::new(v2)).unwrap();

    let describe = |file: &Hdf5File<Cursor<Vec<u8>>>| {
        file.datasets()
            .map(|d| {
                let mut bytes = Vec::new();
                let total =
                    d.dataspace().unwrap().total_elements() * d.datatype().unwrap().size;
                d.read_bytes(0, total, &mut bytes).unwrap();
                (
                    d.path(),
                    d.dataspace().unwrap().dimensions.clone(),
                    d.datatype().unwrap().size,
                    bytes,
                )
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(describe(&f1), describe(&f2));
}

#[test]
fn test_iterator_completeness() {
    let image = chunked_file(None, |chunk| chunk.to_vec());
    let file = Hdf5File::open(Cursor::new(image)).unwrap();

    let tree = file.tree();
    let all: Vec<_> = tree.iter().map(|id| tree.path_of(id)).collect();
    assert_eq!(all, vec!["/", "/grid"]);

    let datasets: Vec<_> = file.datasets().map(|d| d.path()).collect();
    assert_eq!(datasets, vec!["/grid"]);
    let groups: Vec<_> = file.groups().map(|g| g.path()).collect();
    assert_eq!(groups, vec!["/"]);
}

#[test]
fn test_checksum_policy_demotes_superblock_mismatch() {
    let mut image = chunked_file(None, |chunk| chunk.to_vec());
    // Corrupt the superblock checksum only.
    let sum_at = 12 + 4 * 8;
    image[sum_at] ^= 0xFF;

    assert!(Hdf5File::open(Cursor::new(image.clone())).is_err());
    let file = Hdf5File::open_with(
        Cursor::new(image),
        OpenOptions::default().checksum_policy(ChecksumPolicy::Warn),
    )
    .unwrap();
    assert!(file.get_dataset("/grid").is_some());
}

// ---------------------------------------------------------------------
// Variable-length data through the global heap
// ---------------------------------------------------------------------

fn vlen_string_type() -> Vec<u8> {
    let mut out = Vec::new();
    out.push(0x19); // version 1, class 9
    out.push(0x01); // variable-length string
    out.push(0x00);
    out.push(0x00);
    out.extend_from_slice(&16u32.to_le_bytes()); // descriptor size
    out.extend_from_slice(&fixed_point_type(1, false));
    out
}

fn gcol(objects: &[(u16, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (index, data) in objects {
        body.extend_from_slice(&index.to_le_bytes());
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&(data.len() as u64).to_le_bytes());
        body.extend_from_slice(data);
        while body.len() % 8 != 0 {
            body.push(0);
        }
    }
    // Terminating free-space object.
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&0u32.to_le_bytes());
    body.extend_from_slice(&64u64.to_le_bytes());

    let total = 16 + body.len() as u64 + 64;
    let mut out = Vec::new();
    out.extend_from_slice(b"GCOL");
    out.push(1);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&total.to_le_bytes());
    out.extend_from_slice(&body);
    out
}

#[test]
fn test_vlen_strings_resolve_through_global_heap() {
    let values: [&[u8]; 3] = [b"alpha", b"b", b"gamma"];
    let mut image = Vec::new();

    put(
        &mut image,
        0x5000,
        &gcol(&[(1, values[0]), (2, values[1]), (3, values[2])]),
    );

    // Contiguous descriptors: length, collection address, object index.
    let mut data = Vec::new();
    for (i, v) in values.iter().enumerate() {
        data.extend_from_slice(&(v.len() as u32).to_le_bytes());
        data.extend_from_slice(&0x5000u64.to_le_bytes());
        data.extend_from_slice(&((i + 1) as u32).to_le_bytes());
    }
    put(&mut image, 0x3000, &data);

    let dataset = v2_header(
        0x01,
        &[
            (hdf5::message::TYPE_DATASPACE, dataspace_body(&[3])),
            (hdf5::message::TYPE_DATATYPE, vlen_string_type()),
            (hdf5::message::TYPE_DATA_LAYOUT, contiguous_layout(0x3000, 48)),
        ],
    );
    put(&mut image, 0x600, &dataset);
    let root = v2_header(
        0x01,
        &[(hdf5::message::TYPE_LINK, hard_link_body("names", 0x600))],
    );
    put(&mut image, 0x400, &root);
    let sb = v3_superblock(0x400, 1 << 16);
    put(&mut image, 0, &sb);

    let file = Hdf5File::open(Cursor::new(image)).unwrap();
    let ds = file.get_dataset("/names").unwrap();
    for (i, expected) in values.iter().enumerate() {
        assert_eq!(ds.read_vlen_element(i as u64).unwrap(), *expected, "element {i}");
    }

    // Past the dataspace extent.
    assert!(ds.read_vlen_element(3).is_err());

    // Only variable-length datasets resolve this way.
    let grid = chunked_file(None, |chunk| chunk.to_vec());
    let grid_file = Hdf5File::open(Cursor::new(grid)).unwrap();
    assert!(grid_file
        .get_dataset("/grid")
        .unwrap()
        .read_vlen_element(0)
        .is_err());
}
