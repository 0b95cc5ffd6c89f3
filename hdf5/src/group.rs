//! Group materialization: walks the on-disk group machinery (V1 symbol
//! tables or V2 link storage) and builds the node tree, deduplicating
//! hard links by object header address.

use std::collections::HashMap;
use std::io::{Read, Seek};

use log::debug;

use crate::btree1;
use crate::btree2::{BTreeV2, LinkNameRecord};
use crate::error::{Hdf5Error, Result};
use crate::fractal_heap::FractalHeap;
use crate::heap::LocalHeap;
use crate::message::LinkTarget;
use crate::object_header::ObjectHeader;
use crate::superblock::Superblock;
use crate::symbol_table::{SteCache, SymbolTableNode};
use crate::tree::{NodeId, NodeKind, Tree};
use crate::OpenOptions;

/// One resolved link out of a group, before the target is read.
enum RawLink {
    Hard {
        name: String,
        address: u64,
        hint: LinkHint,
    },
    Soft {
        name: String,
        target: String,
    },
}

/// How a hard link's target is classified and, for v1 groups, where the
/// target's index lives.
enum LinkHint {
    /// A v2 link: a data layout message makes the target a dataset.
    FromHeader,
    /// A v1 entry with nothing cached: the target is a dataset.
    Dataset,
    /// A v1 entry caching the target group's index; recursion descends
    /// through these addresses.
    Group {
        btree_address: u64,
        heap_address: u64,
    },
}

/// Build the whole tree starting from the superblock's root object
/// header. A single bad group aborts the open; partial trees are never
/// returned.
pub fn materialize<R: Read + Seek>(
    reader: &mut R,
    sb: &Superblock,
    options: &OpenOptions,
) -> Result<Tree> {
    let root_address = sb.resolve(sb.root_object_header, sb.offset)?;
    let root_header = ObjectHeader::read(
        reader,
        sb,
        root_address,
        options.checksum_policy,
        options.max_allocation,
    )?;

    // The root entry may cache the root group's own index.
    let root_index = match sb.root_entry.as_ref() {
        Some(entry) => match entry.cache {
            SteCache::Group {
                btree_address,
                heap_address,
            } => Some((
                sb.resolve(btree_address, entry.offset)?,
                sb.resolve(heap_address, entry.offset)?,
            )),
            SteCache::None => None,
        },
        None => None,
    };

    let (mut tree, root) = Tree::with_root(root_header);
    let mut visited = HashMap::new();
    visited.insert(root_address, root);
    expand_group(reader, sb, &mut tree, root, root_index, &mut visited, options)?;
    Ok(tree)
}

fn classify(header: &ObjectHeader) -> NodeKind {
    if header.is_dataset() {
        NodeKind::Dataset
    } else {
        NodeKind::Group
    }
}

#[allow(clippy::too_many_arguments)]
fn expand_group<R: Read + Seek>(
    reader: &mut R,
    sb: &Superblock,
    tree: &mut Tree,
    id: NodeId,
    index: Option<(u64, u64)>,
    visited: &mut HashMap<u64, NodeId>,
    options: &OpenOptions,
) -> Result<()> {
    let header = tree
        .node(id)
        .header
        .clone()
        .expect("groups always carry a header");
    let links = collect_links(reader, sb, &header, index, options)?;
    debug!("group {}: {} links", tree.path_of(id), links.len());

    for link in links {
        match link {
            RawLink::Soft { name, target } => {
                tree.add_child(id, name, NodeKind::SoftLink { target }, None, None)?;
            }
            RawLink::Hard {
                name,
                address,
                hint,
            } => {
                if let Some(&first) = visited.get(&address) {
                    // Second name for an object we already reached: alias
                    // it and do not recurse.
                    let canonical = tree.path_of(first);
                    let kind = tree.node(first).kind.clone();
                    let header = tree.node(first).header.clone();
                    tree.add_child(id, name, kind, header, Some(canonical))?;
                    continue;
                }

                let child_header = ObjectHeader::read(
                    reader,
                    sb,
                    address,
                    options.checksum_policy,
                    options.max_allocation,
                )?;
                let (kind, child_index) = match hint {
                    LinkHint::Dataset => (NodeKind::Dataset, None),
                    LinkHint::Group {
                        btree_address,
                        heap_address,
                    } => (NodeKind::Group, Some((btree_address, heap_address))),
                    LinkHint::FromHeader => (classify(&child_header), None),
                };
                let child = tree.add_child(id, name, kind.clone(), Some(child_header), None)?;
                visited.insert(address, child);
                if kind == NodeKind::Group {
                    expand_group(reader, sb, tree, child, child_index, visited, options)?;
                }
            }
        }
    }
    Ok(())
}

/// Gather the group's links from whichever storage applies: the V1
/// symbol table index, the V2 dense index, and inline link messages.
///
/// `index` is the B-tree and heap cached by the entry that reached this
/// group; when present it is used directly instead of the header's
/// symbol table message.
fn collect_links<R: Read + Seek>(
    reader: &mut R,
    sb: &Superblock,
    header: &ObjectHeader,
    index: Option<(u64, u64)>,
    options: &OpenOptions,
) -> Result<Vec<RawLink>> {
    let mut links = Vec::new();

    let v1_index = match index {
        Some(pair) => Some(pair),
        None => match header.symbol_table() {
            Some(st) => Some((
                sb.resolve(st.btree_address, header.address)?,
                sb.resolve(st.heap_address, header.address)?,
            )),
            None => None,
        },
    };

    if let Some((btree_address, heap_address)) = v1_index {
        let heap = LocalHeap::read(reader, heap_address, sb, options.max_allocation)?;

        for snod_address in btree1::collect_group_leaves(reader, sb, btree_address)? {
            let node =
                SymbolTableNode::read(reader, snod_address, sb.offset_width, 2 * sb.group_leaf_k)?;
            for entry in &node.entries {
                let name = heap.expect_string(entry.link_name_offset)?.to_string();
                let address = sb.resolve(entry.object_header_address, entry.offset)?;
                let hint = match entry.cache {
                    SteCache::None => LinkHint::Dataset,
                    SteCache::Group {
                        btree_address,
                        heap_address,
                    } => LinkHint::Group {
                        btree_address: sb.resolve(btree_address, entry.offset)?,
                        heap_address: sb.resolve(heap_address, entry.offset)?,
                    },
                };
                links.push(RawLink::Hard {
                    name,
                    address,
                    hint,
                });
            }
        }
    }

    if let Some(info) = header.link_info() {
        if !info.name_index_address.is_undefined() {
            let heap_address = sb.resolve(info.fractal_heap_address, header.address)?;
            let index_address = sb.resolve(info.name_index_address, header.address)?;
            let heap = FractalHeap::read(reader, sb, heap_address, options.checksum_policy)?;
            let name_index = BTreeV2::read(reader, sb, index_address, options.checksum_policy)?;

            for record in name_index.records(reader, sb)? {
                let record = LinkNameRecord::parse(&record, index_address)?;
                let object =
                    heap.get_object(reader, sb, &record.heap_id, options.max_allocation)?;
                links.push(parse_dense_link(&object, heap_address, sb)?);
            }
        }
    }

    for link in header.links() {
        match &link.target {
            LinkTarget::Hard { address } => {
                let address = sb.resolve(*address, header.address)?;
                links.push(RawLink::Hard {
                    name: link.name.clone(),
                    address,
                    hint: LinkHint::FromHeader,
                });
            }
            LinkTarget::Soft { target } => {
                links.push(RawLink::Soft {
                    name: link.name.clone(),
                    target: target.clone(),
                });
            }
            LinkTarget::Other { link_type, .. } => {
                return Err(Hdf5Error::UnsupportedFormat {
                    offset: header.address,
                    detail: format!("link type {link_type}"),
                });
            }
        }
    }

    Ok(links)
}

/// A dense link record as stored in the fractal heap: ten header bytes
/// (version, flags, creation order), a 1-byte name length, the name, and
/// the target object header address.
fn parse_dense_link(object: &[u8], at: u64, sb: &Superblock) -> Result<RawLink> {
    if object.len() < 12 {
        return Err(Hdf5Error::MalformedHeap {
            offset: at,
            detail: format!("dense link record of {} bytes", object.len()),
        });
    }
    let name_len = object[10] as usize;
    let name_end = 11 + name_len;
    if object.len() < name_end + 8 {
        return Err(Hdf5Error::MalformedHeap {
            offset: at,
            detail: "dense link record truncated".into(),
        });
    }
    let name = String::from_utf8(object[11..name_end].to_vec())
        .map_err(|_| Hdf5Error::MalformedString { offset: at })?;
    let address = u64::from_le_bytes(object[name_end..name_end + 8].try_into().unwrap());
    Ok(RawLink::Hard {
        name,
        address: sb.abs(address),
        hint: LinkHint::FromHeader,
    })
}
