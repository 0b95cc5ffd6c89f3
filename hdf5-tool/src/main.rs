//! hdf5-tool — CLI to explore HDF5 files
//!
//! # Usage
//!
//! ```text
//! hdf5-tool info  <file>            Superblock and hierarchy summary
//! hdf5-tool ls    <file> [path]     List children of a group
//! hdf5-tool tree  <file> [path]     Browse the hierarchy
//! hdf5-tool stat  <file> <path>     Dataset type, shape, layout
//! hdf5-tool attrs <file> <path>     Attributes of a group or dataset
//! hdf5-tool cat   <file> <path>     Raw decoded dataset bytes to stdout
//! ```

mod commands;
mod style;

use std::env;
use std::process;

use style::{BOLD, DIM, GREEN, RED, RESET};

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "info" => commands::info(&args[2..]),
        "ls" => commands::ls(&args[2..]),
        "tree" => commands::tree(&args[2..]),
        "stat" => commands::stat(&args[2..]),
        "attrs" => commands::attrs(&args[2..]),
        "cat" => commands::cat(&args[2..]),
        "-h" | "--help" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            eprintln!("{RED}Unknown command: {}{RESET}", args[1]);
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("{RED}error:{RESET} {e}");
        process::exit(1);
    }
}

fn print_usage() {
    eprintln!(
        r#"
{BOLD}hdf5-tool{RESET} — HDF5 file explorer

{DIM}Walk the hierarchy, inspect datasets, dump raw element data{RESET}

{BOLD}USAGE:{RESET}
    hdf5-tool <COMMAND> <file> [args]

{BOLD}COMMANDS:{RESET}
    {GREEN}info{RESET}    <file>            Superblock and hierarchy summary
    {GREEN}ls{RESET}      <file> [path]     List children of a group
    {GREEN}tree{RESET}    <file> [path]     Browse the hierarchy
    {GREEN}stat{RESET}    <file> <path>     Dataset type, shape, layout
    {GREEN}attrs{RESET}   <file> <path>     Attributes of a group or dataset
    {GREEN}cat{RESET}     <file> <path>     Raw decoded dataset bytes to stdout

{BOLD}EXAMPLES:{RESET}
    hdf5-tool tree measurements.h5
    hdf5-tool stat measurements.h5 /run1/temperature
    hdf5-tool cat  measurements.h5 /run1/temperature > temp.bin
"#
    );
}
