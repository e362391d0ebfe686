extern crate dwindex;
use dwindex::{error::*, index::*, log::*};
use std::io::{self, Write};

// Opens the given binaries, builds the name index, and dumps it. With -n only entries
// under that name are printed.
fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let mut name_filter: Option<String> = None;
    let mut paths: Vec<String> = Vec::new();
    let mut i = 1;
    while i < args.len() {
        if args[i] == "-n" && i + 1 < args.len() {
            name_filter = Some(args[i + 1].clone());
            i += 2;
        } else {
            paths.push(args[i].clone());
            i += 1;
        }
    }
    if paths.is_empty() {
        eprintln!("Usage: {} [-n name] binary...", args[0]);
        std::process::exit(1);
    }

    let mut index = DwarfIndex::new(IndexFlags::all())?;
    for path in &paths {
        index.open(path)?;
    }

    {
        let _prof = ProfileScope::new(format!("indexing {} files", paths.len()));
        index.update()?;
    }

    let mut out = io::BufWriter::new(io::stdout());
    for die in index.iter(name_filter.as_ref().map(|n| n.as_bytes()), &[]) {
        let name = die.read_name()?.unwrap_or_default();
        let _ = writeln!(out, "{} 0x{:<10x} {:30} {}", die.tag, die.offset, name, die.file.name());
    }
    let _ = out.flush();
    let stats = index.stats();
    eprintln!("info: {} files, {} names, {} entries", stats.files, stats.names, stats.entries);
    Ok(())
}
