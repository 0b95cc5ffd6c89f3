use std::fs::File;
use std::io::{BufReader, Write};
use std::process;

use hdf5::{Datatype, DatatypeKind, Endian, Hdf5File, NodeId, NodeKind};

use crate::style::*;

type Reader = BufReader<File>;

fn open(path: &str) -> Result<Hdf5File<Reader>, Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    Ok(Hdf5File::open(BufReader::new(file))?)
}

/// Human-readable one-liner for a datatype.
pub(crate) fn describe_type(dt: &Datatype) -> String {
    match &dt.kind {
        DatatypeKind::FixedPoint { signed, endian, .. } => {
            let base = if *signed { "int" } else { "uint" };
            let suffix = match endian {
                Endian::Big => " (big-endian)",
                Endian::Little => "",
            };
            format!("{base}{}{suffix}", dt.size * 8)
        }
        DatatypeKind::FloatingPoint { endian, .. } => {
            let suffix = match endian {
                Endian::Big => " (big-endian)",
                Endian::Little => "",
            };
            format!("float{}{suffix}", dt.size * 8)
        }
        DatatypeKind::String { .. } => format!("string[{}]", dt.size),
        DatatypeKind::Compound { members } => {
            let fields: Vec<String> = members
                .iter()
                .map(|m| format!("{}: {}", m.name, describe_type(&m.datatype)))
                .collect();
            format!("compound{{{}}}", fields.join(", "))
        }
        DatatypeKind::Reference { .. } => "reference".to_string(),
        DatatypeKind::VariableLength { is_string, base, .. } => {
            if *is_string {
                "vlen string".to_string()
            } else {
                format!("vlen<{}>", describe_type(base))
            }
        }
        DatatypeKind::Array { dims, base } => {
            format!("{}{:?}", describe_type(base), dims)
        }
        DatatypeKind::Opaque => format!("opaque (class {}, {} bytes)", dt.class, dt.size),
    }
}

pub(crate) fn info(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    if args.is_empty() {
        eprintln!("Usage: hdf5-tool info <file>");
        process::exit(1);
    }
    let file = open(&args[0])?;
    let sb = file.superblock();

    header(&format!("HDF5 file: {}", args[0]));
    section("Superblock");
    kv("Version", &sb.version.to_string());
    kv("Found at offset", &sb.offset.to_string());
    kv("Offset width", &format!("{} bytes", sb.offset_width));
    kv("Length width", &format!("{} bytes", sb.length_width));
    match sb.eof_address.get() {
        Some(eof) => kv("End of file", &format_size(eof)),
        None => kv("End of file", "undefined"),
    }
    if sb.version < 2 {
        kv("Group leaf K", &sb.group_leaf_k.to_string());
        kv("Group internal K", &sb.group_internal_k.to_string());
    }

    section("Hierarchy");
    kv_highlight("Groups", &format_commas(file.groups().count() as u64));
    kv_highlight("Datasets", &format_commas(file.datasets().count() as u64));
    println!();
    Ok(())
}

pub(crate) fn ls(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    if args.is_empty() {
        eprintln!("Usage: hdf5-tool ls <file> [path]");
        process::exit(1);
    }
    let path = args.get(1).map(String::as_str).unwrap_or("/");
    let file = open(&args[0])?;
    let tree = file.tree();
    let id = tree.find_by_path(path).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, format!("no such group: {path}"))
    })?;

    header(&format!("{}:{path}", args[0]));
    println!();
    println!("  {DIM}{:<5} {:>16}  {}{RESET}", "Kind", "Shape", "Name");
    println!("  {DIM}{}{RESET}", "-".repeat(56));

    for &child in tree.children(id) {
        let node = tree.node(child);
        let color = kind_color(&node.kind);
        let icon = kind_icon(&node.kind);
        let shape = node
            .header
            .as_ref()
            .and_then(|h| h.dataspace())
            .map(|ds| shape_string(&ds.dimensions))
            .unwrap_or_else(|| "-".to_string());
        println!("  {DIM}{icon}{RESET}   {shape:>16}  {color}{}{RESET}", node.name);
    }
    println!();
    Ok(())
}

pub(crate) fn tree(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    if args.is_empty() {
        eprintln!("Usage: hdf5-tool tree <file> [path]");
        process::exit(1);
    }
    let path = args.get(1).map(String::as_str).unwrap_or("/");
    let file = open(&args[0])?;
    let tree = file.tree();
    let id = tree.find_by_path(path).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, format!("no such path: {path}"))
    })?;

    header(&format!("{}:{path}", args[0]));
    println!();
    println!("  {BLUE}{path}{RESET}");
    print_subtree(tree, id, "  ");
    println!();
    Ok(())
}

fn print_subtree(tree: &hdf5::Tree, id: NodeId, prefix: &str) {
    let children = tree.children(id);
    for (i, &child) in children.iter().enumerate() {
        let node = tree.node(child);
        let last = i + 1 == children.len();
        let branch = if last { ELBOW } else { TEE };
        let color = kind_color(&node.kind);

        let note = match &node.kind {
            NodeKind::SoftLink { target } => format!(" {DIM}-> {target}{RESET}"),
            _ => match &node.hard_link_path {
                Some(canonical) => format!(" {DIM}=> {canonical}{RESET}"),
                None => node
                    .header
                    .as_ref()
                    .and_then(|h| h.dataspace())
                    .map(|ds| format!(" {DIM}{}{RESET}", shape_string(&ds.dimensions)))
                    .unwrap_or_default(),
            },
        };
        println!("{prefix}{branch} {color}{}{RESET}{note}", node.name);

        if node.is_group() && node.hard_link_path.is_none() {
            let next = if last {
                format!("{prefix}    ")
            } else {
                format!("{prefix}{PIPE}   ")
            };
            print_subtree(tree, child, &next);
        }
    }
}

pub(crate) fn stat(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    if args.len() < 2 {
        eprintln!("Usage: hdf5-tool stat <file> <path>");
        process::exit(1);
    }
    let file = open(&args[0])?;
    let ds = file.get_dataset(&args[1]).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no such dataset: {}", args[1]),
        )
    })?;

    header(&format!("{}:{}", args[0], args[1]));
    section("Dataset");
    if let Some(dt) = ds.datatype() {
        kv("Datatype", &describe_type(dt));
        kv("Element size", &format!("{} bytes", dt.size));
    }
    if let Some(space) = ds.dataspace() {
        kv("Shape", &shape_string(&space.dimensions));
        kv_highlight("Elements", &format_commas(space.total_elements()));
    }
    match ds.layout() {
        Some(hdf5::DataLayout::Compact { data }) => {
            kv("Layout", &format!("compact ({} bytes inline)", data.len()));
        }
        Some(hdf5::DataLayout::Contiguous { address, size }) => {
            let at = address
                .get()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "unallocated".to_string());
            kv("Layout", &format!("contiguous at {at}, {}", format_size(*size)));
        }
        Some(hdf5::DataLayout::Chunked { chunk_dims, .. }) => {
            let dims: Vec<u64> = chunk_dims.iter().map(|&d| d as u64).collect();
            kv("Layout", &format!("chunked {}", shape_string(&dims)));
        }
        None => {}
    }
    if let Some(canonical) = ds.hard_link_path() {
        kv("Hard link to", canonical);
    }
    kv("Has data", if ds.has_data() { "yes" } else { "no" });
    println!();
    Ok(())
}

pub(crate) fn attrs(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    if args.len() < 2 {
        eprintln!("Usage: hdf5-tool attrs <file> <path>");
        process::exit(1);
    }
    let file = open(&args[0])?;
    let tree = file.tree();
    let id = tree.find_by_path(&args[1]).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no such path: {}", args[1]),
        )
    })?;

    header(&format!("{}:{}", args[0], args[1]));
    section("Attributes");
    let node = tree.node(id);
    let mut count = 0;
    if let Some(h) = &node.header {
        for attr in h.attributes() {
            count += 1;
            kv(
                &attr.name,
                &format!(
                    "{} {} ({} bytes)",
                    describe_type(&attr.datatype),
                    shape_string(&attr.dataspace.dimensions),
                    attr.data.len()
                ),
            );
        }
    }
    if count == 0 {
        println!("  {DIM}none{RESET}");
    }
    println!();
    Ok(())
}

pub(crate) fn cat(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    if args.len() < 2 {
        eprintln!("Usage: hdf5-tool cat <file> <path>");
        process::exit(1);
    }
    let file = open(&args[0])?;
    let ds = file.get_dataset(&args[1]).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no such dataset: {}", args[1]),
        )
    })?;

    let (Some(dt), Some(space)) = (ds.datatype(), ds.dataspace()) else {
        return Err("dataset is missing datatype or dataspace".into());
    };
    let total = space.total_elements() * dt.size;
    let mut bytes = Vec::new();
    ds.read_bytes(0, total, &mut bytes)?;

    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    lock.write_all(&bytes)?;
    lock.flush()?;
    Ok(())
}
