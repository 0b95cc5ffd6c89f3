//! Read-only HDF5 file parser.
//!
//! Opens a seekable byte stream, walks the superblock and group
//! machinery into an immutable tree, and decodes dataset bytes on demand
//! through compact, contiguous, or chunked storage with filter
//! inversion.

pub mod btree1;
pub mod btree2;
pub mod checksum;
pub mod chunk;
pub mod datatype;
pub mod error;
pub mod filter;
pub mod fractal_heap;
pub mod global_heap;
pub mod group;
pub mod heap;
pub mod message;
pub mod object_header;
pub mod raw;
pub mod superblock;
pub mod symbol_table;
pub mod tree;

pub use datatype::{CompoundMember, Datatype, DatatypeKind};
pub use error::{Hdf5Error, Result};
pub use message::{Attribute, DataLayout, Dataspace};
pub use raw::{Address, Endian, FixedPoint};
pub use superblock::Superblock;
pub use tree::{NodeId, NodeKind, Tree};

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::AtomicBool;

use byteorder::ReadBytesExt;

use global_heap::GlobalHeapCollection;
use object_header::ObjectHeader;

/// How metadata checksum mismatches are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumPolicy {
    /// Mismatches are fatal to the containing call.
    Strict,
    /// Mismatches are logged and decoding continues.
    Warn,
}

/// Open-time configuration.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub checksum_policy: ChecksumPolicy,
    /// Ceiling for any single allocation a header can demand.
    pub max_allocation: u64,
    /// Let chunks outside a requested range go unread and unvalidated.
    pub tolerate_unreadable_chunks: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            checksum_policy: ChecksumPolicy::Strict,
            max_allocation: 1 << 30,
            tolerate_unreadable_chunks: false,
        }
    }
}

impl OpenOptions {
    pub fn checksum_policy(mut self, policy: ChecksumPolicy) -> Self {
        self.checksum_policy = policy;
        self
    }

    pub fn max_allocation(mut self, bytes: u64) -> Self {
        self.max_allocation = bytes;
        self
    }

    pub fn tolerate_unreadable_chunks(mut self, tolerate: bool) -> Self {
        self.tolerate_unreadable_chunks = tolerate;
        self
    }
}

/// An opened file: superblock, materialized tree, and the shared reader.
///
/// The reader sits behind a `RefCell`; decoding is single-threaded per
/// file handle, and the tree itself is immutable after open.
pub struct Hdf5File<R: Read + Seek> {
    reader: RefCell<R>,
    superblock: Superblock,
    tree: Tree,
    options: OpenOptions,
    global_heaps: RefCell<HashMap<u64, GlobalHeapCollection>>,
}

impl<R: Read + Seek> Hdf5File<R> {
    /// Locate the superblock and materialize the whole hierarchy.
    pub fn open(reader: R) -> Result<Self> {
        Self::open_with(reader, OpenOptions::default())
    }

    pub fn open_with(mut reader: R, options: OpenOptions) -> Result<Self> {
        let superblock = Superblock::find_and_parse(&mut reader, options.checksum_policy)?;
        let tree = group::materialize(&mut reader, &superblock, &options)?;
        Ok(Hdf5File {
            reader: RefCell::new(reader),
            superblock,
            tree,
            options,
            global_heaps: RefCell::new(HashMap::new()),
        })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn root(&self) -> GroupRef<'_, R> {
        GroupRef {
            file: self,
            id: self.tree.root(),
        }
    }

    pub fn get_group(&self, path: &str) -> Option<GroupRef<'_, R>> {
        let id = self.tree.find_by_path(path)?;
        self.tree.node(id).is_group().then_some(GroupRef { file: self, id })
    }

    pub fn get_dataset(&self, path: &str) -> Option<DatasetRef<'_, R>> {
        let id = self.tree.find_by_path(path)?;
        self.tree
            .node(id)
            .is_dataset()
            .then_some(DatasetRef { file: self, id })
    }

    /// Every dataset node, in pre-order traversal order.
    pub fn datasets(&self) -> impl Iterator<Item = DatasetRef<'_, R>> {
        self.tree.datasets().map(move |id| DatasetRef { file: self, id })
    }

    /// Every group node, in pre-order traversal order.
    pub fn groups(&self) -> impl Iterator<Item = GroupRef<'_, R>> {
        self.tree.groups().map(move |id| GroupRef { file: self, id })
    }

    /// Fetch one object from a global heap collection, reading and
    /// caching the collection on first use.
    pub fn global_heap_object(&self, collection_address: u64, index: u16) -> Result<Vec<u8>> {
        let mut heaps = self.global_heaps.borrow_mut();
        if !heaps.contains_key(&collection_address) {
            let mut reader = self.reader.borrow_mut();
            let collection = GlobalHeapCollection::read(
                &mut *reader,
                collection_address,
                &self.superblock,
                self.options.max_allocation,
            )?;
            heaps.insert(collection_address, collection);
        }
        let collection = &heaps[&collection_address];
        collection
            .object(index)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Hdf5Error::MalformedHeap {
                offset: collection_address,
                detail: format!("no global heap object with index {index}"),
            })
    }
}

/// A group node handle.
pub struct GroupRef<'a, R: Read + Seek> {
    file: &'a Hdf5File<R>,
    id: NodeId,
}

impl<'a, R: Read + Seek> GroupRef<'a, R> {
    pub fn name(&self) -> &'a str {
        &self.file.tree.node(self.id).name
    }

    pub fn path(&self) -> String {
        self.file.tree.path_of(self.id)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn hard_link_path(&self) -> Option<&'a str> {
        self.file.tree.node(self.id).hard_link_path.as_deref()
    }

    /// Names of the direct children, already sorted.
    pub fn child_names(&self) -> Vec<&'a str> {
        self.file
            .tree
            .children(self.id)
            .iter()
            .map(|&c| self.file.tree.node(c).name.as_str())
            .collect()
    }

    pub fn attributes(&self) -> impl Iterator<Item = &'a Attribute> {
        self.file
            .tree
            .node(self.id)
            .header
            .iter()
            .flat_map(|h| h.attributes())
    }
}

/// A dataset node handle. Data access goes through the shared reader.
pub struct DatasetRef<'a, R: Read + Seek> {
    file: &'a Hdf5File<R>,
    id: NodeId,
}

impl<'a, R: Read + Seek> DatasetRef<'a, R> {
    fn header(&self) -> &'a ObjectHeader {
        self.file
            .tree
            .node(self.id)
            .header
            .as_ref()
            .expect("dataset nodes always carry a header")
    }

    pub fn name(&self) -> &'a str {
        &self.file.tree.node(self.id).name
    }

    pub fn path(&self) -> String {
        self.file.tree.path_of(self.id)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn datatype(&self) -> Option<&'a Datatype> {
        self.header().datatype()
    }

    pub fn dataspace(&self) -> Option<&'a Dataspace> {
        self.header().dataspace()
    }

    pub fn layout(&self) -> Option<&'a DataLayout> {
        self.header().layout()
    }

    pub fn attributes(&self) -> impl Iterator<Item = &'a Attribute> {
        self.header().attributes()
    }

    pub fn hard_link_path(&self) -> Option<&'a str> {
        self.file.tree.node(self.id).hard_link_path.as_deref()
    }

    /// Whether any storage is allocated for the dataset.
    pub fn has_data(&self) -> bool {
        match self.header().layout() {
            Some(DataLayout::Compact { data }) => !data.is_empty(),
            Some(DataLayout::Contiguous { address, .. }) => !address.is_undefined(),
            Some(DataLayout::Chunked { btree_address, .. }) => !btree_address.is_undefined(),
            None => false,
        }
    }

    /// Fill `out` with decoded element bytes for the linear byte range
    /// `[offset, offset + length)`.
    pub fn read_bytes(&self, offset: u64, length: u64, out: &mut Vec<u8>) -> Result<()> {
        self.read_bytes_with(offset, length, out, None)
    }

    /// Resolve one element of a variable-length dataset through the
    /// global heap.
    ///
    /// The stored element is a descriptor: data length, the address of a
    /// global heap collection, and the object index within it.
    pub fn read_vlen_element(&self, index: u64) -> Result<Vec<u8>> {
        let header = self.header();
        let datatype = self.datatype().ok_or_else(|| Hdf5Error::MalformedFile {
            offset: header.address,
            detail: "dataset without a datatype message".into(),
        })?;
        if !matches!(datatype.kind, DatatypeKind::VariableLength { .. }) {
            return Err(Hdf5Error::UnsupportedFormat {
                offset: header.address,
                detail: "not a variable-length dataset".into(),
            });
        }

        let sb = &self.file.superblock;
        if datatype.size < 8 + sb.offset_width as u64 {
            return Err(Hdf5Error::MalformedFile {
                offset: header.address,
                detail: format!("variable-length descriptor of {} bytes", datatype.size),
            });
        }
        let offset = index.checked_mul(datatype.size).ok_or_else(|| {
            Hdf5Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("element index {index} overflows the byte range"),
            ))
        })?;
        let mut descriptor = Vec::new();
        self.read_bytes(offset, datatype.size, &mut descriptor)?;

        let mut cur = std::io::Cursor::new(&descriptor[..]);
        let length = cur.read_u32::<byteorder::LittleEndian>()? as usize;
        let collection = Address::read(&mut cur, sb.offset_width)?.require(header.address)?;
        let object_index = cur.read_u32::<byteorder::LittleEndian>()?;
        let object_index =
            u16::try_from(object_index).map_err(|_| Hdf5Error::MalformedHeap {
                offset: sb.abs(collection),
                detail: format!("global heap object index {object_index}"),
            })?;

        let mut bytes = self.file.global_heap_object(sb.abs(collection), object_index)?;
        if bytes.len() < length {
            return Err(Hdf5Error::MalformedHeap {
                offset: sb.abs(collection),
                detail: format!(
                    "heap object of {} bytes, descriptor claims {length}",
                    bytes.len()
                ),
            });
        }
        bytes.truncate(length);
        Ok(bytes)
    }

    /// Like `read_bytes`, with a cancellation flag polled between chunks.
    pub fn read_bytes_with(
        &self,
        offset: u64,
        length: u64,
        out: &mut Vec<u8>,
        cancel: Option<&AtomicBool>,
    ) -> Result<()> {
        let header = self.header();
        let missing = |what: &str| Hdf5Error::MalformedFile {
            offset: header.address,
            detail: format!("dataset without a {what} message"),
        };
        let datatype = header.datatype().ok_or_else(|| missing("datatype"))?;
        let dataspace = header.dataspace().ok_or_else(|| missing("dataspace"))?;
        let layout = header.layout().ok_or_else(|| missing("data layout"))?;

        let element_size = datatype.size;
        if element_size == 0 || offset % element_size != 0 || length % element_size != 0 {
            return Err(Hdf5Error::MisalignedRead {
                offset,
                length,
                element_size,
            });
        }
        let total = dataspace.total_elements() * element_size;
        if offset + length > total {
            return Err(Hdf5Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("request [{offset}, {}) past dataset end {total}", offset + length),
            )));
        }

        out.clear();
        out.resize(length as usize, 0);
        if length == 0 {
            return Ok(());
        }

        let sb = &self.file.superblock;
        let options = &self.file.options;
        let mut reader = self.file.reader.borrow_mut();

        match layout {
            DataLayout::Compact { data } => {
                let end = (offset + length) as usize;
                if end > data.len() {
                    return Err(Hdf5Error::MalformedFile {
                        offset: header.address,
                        detail: format!(
                            "compact storage of {} bytes is shorter than the dataset",
                            data.len()
                        ),
                    });
                }
                out.copy_from_slice(&data[offset as usize..end]);
                Ok(())
            }
            DataLayout::Contiguous { address, size } => {
                match address.get() {
                    Some(stored) => {
                        if offset + length > *size {
                            return Err(Hdf5Error::MalformedFile {
                                offset: header.address,
                                detail: format!(
                                    "contiguous storage of {size} bytes is shorter than the dataset"
                                ),
                            });
                        }
                        reader.seek(SeekFrom::Start(sb.abs(stored) + offset))?;
                        reader.read_exact(out)?;
                    }
                    None => {
                        // No storage allocated yet: the fill value, or
                        // zeros, covers the whole extent.
                        fill_buffer(out, header, element_size)?;
                    }
                }
                Ok(())
            }
            DataLayout::Chunked {
                chunk_dims,
                element_size: layout_element_size,
                btree_address,
            } => {
                let fill = effective_fill(header, element_size as usize);
                let es = if *layout_element_size != 0 {
                    *layout_element_size as u64
                } else {
                    element_size
                };
                let ds = chunk::ChunkedDataset {
                    shape: &dataspace.dimensions,
                    chunk_dims,
                    element_size: es as usize,
                    btree_address: sb.resolve(*btree_address, header.address)?,
                    pipeline: header.filter_pipeline(),
                    fill_value: fill,
                };
                chunk::read_range(
                    &mut *reader,
                    sb,
                    &ds,
                    offset,
                    out,
                    cancel,
                    options.tolerate_unreadable_chunks,
                    options.max_allocation,
                )
            }
        }
    }
}

/// The fill bytes a read should use: the new-form message when defined,
/// otherwise a size-matched old-form value.
fn effective_fill(header: &ObjectHeader, element_size: usize) -> Option<&[u8]> {
    if let Some(fv) = header.fill_value() {
        if fv.defined {
            return fv.data.as_deref();
        }
    }
    header
        .fill_value_old()
        .map(|f| f.data.as_slice())
        .filter(|d| d.len() == element_size)
}

fn fill_buffer(out: &mut [u8], header: &ObjectHeader, element_size: u64) -> Result<()> {
    match effective_fill(header, element_size as usize) {
        Some(fill) if fill.len() == element_size as usize => {
            for slot in out.chunks_mut(element_size as usize) {
                slot.copy_from_slice(fill);
            }
            Ok(())
        }
        Some(fill) => Err(Hdf5Error::UnsupportedFill(format!(
            "fill value of {} bytes for {element_size}-byte elements",
            fill.len()
        ))),
        None => {
            out.fill(0);
            Ok(())
        }
    }
}
