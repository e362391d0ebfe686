use crate::{*, error::*, util::*, elf::*, dwarf::*, log::*};
use bitflags::bitflags;
use gimli::{Dwarf, DwTag, EndianSlice, RunTimeEndian, SectionId, UnitHeader, UnitOffset};
use siphasher::sip::SipHasher13;
use std::{collections::HashMap, fs::File, hash::{BuildHasherDefault, Hasher}, mem, ptr, sync::{Arc, Mutex, OnceLock, atomic::{AtomicBool, Ordering}}, thread};

pub type SliceType = EndianSlice<'static, RunTimeEndian>;

bitflags! {
    pub struct IndexFlags: u32 {
        const TYPES = 0x1;
        const VARIABLES = 0x2;
        const ENUMERATORS = 0x4;
        const FUNCTIONS = 0x8;
    }
}

pub const SECTION_SYMTAB: usize = 0;
pub const SECTION_DEBUG_ABBREV: usize = 1;
pub const SECTION_DEBUG_INFO: usize = 2;
pub const SECTION_DEBUG_LINE: usize = 3;
pub const SECTION_DEBUG_STR: usize = 4;
pub const NUM_SECTIONS: usize = 5;

const SECTION_NAMES: [&str; NUM_SECTIONS] = [".symtab", ".debug_abbrev", ".debug_info", ".debug_line", ".debug_str"];
const SECTION_OPTIONAL: [bool; NUM_SECTIONS] = [true, false, false, true, false];

// One ELF file registered with the index. Section images point into the file's
// copy-on-write mapping (or its decompressed buffers) and stay valid for as long as the
// DebugFile holds the ElfFile alive.
#[derive(Debug)]
pub struct DebugFile {
    pub elf: Arc<ElfFile>,
    // Canonical path; present iff the file was opened by the index rather than handed in
    // by a caller.
    pub path: Option<String>,
    pub bswap: bool,
    sections: [Option<&'static [u8]>; NUM_SECTIONS],
    rela_sections: [Option<&'static [u8]>; NUM_SECTIONS],
    failed: AtomicBool,
    dwarf: OnceLock<Result<Dwarf<SliceType>>>,
}

impl DebugFile {
    pub fn name(&self) -> &str { &self.elf.name }

    pub fn has_section(&self, i: usize) -> bool { self.sections[i].is_some() }

    pub fn section(&self, i: usize) -> Result<&'static [u8]> {
        match self.sections[i] {
            Some(s) => Ok(s),
            None => err!(MissingDebug, "ELF file has no {} section", SECTION_NAMES[i]),
        }
    }

    pub fn is_little_endian(&self) -> bool {
        cfg!(target_endian = "little") != self.bswap
    }

    // The DWARF view used to resolve indexed entries into DIEs. Created on first use.
    pub fn dwarf(&self) -> Result<&Dwarf<SliceType>> {
        let endian = if self.is_little_endian() {RunTimeEndian::Little} else {RunTimeEndian::Big};
        self.dwarf.get_or_init(|| {
            Dwarf::load(|id: SectionId| -> Result<SliceType> {
                match self.elf.section_data_by_name(id.name()) {
                    Some(data) => Ok(EndianSlice::new(unsafe {mem::transmute(data)}, endian)),
                    None => Ok(EndianSlice::new(&[][..], endian)),
                }
            })
        }).as_ref_clone_error()
    }
}

// Captures the five sections the indexer reads, plus the RELA sections targeting them.
fn read_sections(elf: Arc<ElfFile>, path: Option<String>) -> Result<DebugFile> {
    let mut sections: [Option<&'static [u8]>; NUM_SECTIONS] = [None; NUM_SECTIONS];
    let mut section_index = [0usize; NUM_SECTIONS];

    // First pass: the symbol table and the debug sections.
    for idx in 0..elf.sections.len() {
        let s = &elf.sections[idx];
        if s.section_type == SHT_NOBITS || s.flags & SHF_GROUP != 0 {
            continue;
        }
        for i in 0..NUM_SECTIONS {
            if sections[i].is_some() || s.name != SECTION_NAMES[i] {
                continue;
            }
            let data = elf.section_data(idx)?;
            sections[i] = Some(unsafe {mem::transmute(data)});
            section_index[i] = idx;
        }
    }

    for i in 0..NUM_SECTIONS {
        if sections[i].is_none() && !SECTION_OPTIONAL[i] {
            return err!(MissingDebug, "ELF file has no {} section", SECTION_NAMES[i]);
        }
    }

    // Second pass: the relocation sections.
    let mut rela_sections: [Option<&'static [u8]>; NUM_SECTIONS] = [None; NUM_SECTIONS];
    for idx in 0..elf.sections.len() {
        let s = &elf.sections[idx];
        if s.section_type != SHT_RELA {
            continue;
        }
        for i in 0..NUM_SECTIONS {
            if rela_sections[i].is_some() || section_index[i] == 0 || s.info as usize != section_index[i] {
                continue;
            }
            if sections[SECTION_SYMTAB].is_none() {
                return err!(ElfFormat, "ELF file has no .symtab section");
            }
            if s.link as usize != section_index[SECTION_SYMTAB] {
                return err!(ElfFormat, "relocation symbol table section is not .symtab");
            }
            let data = elf.section_data(idx)?;
            rela_sections[i] = Some(unsafe {mem::transmute(data)});
        }
    }

    let bswap = elf.bswap;
    Ok(DebugFile {elf, path, bswap, sections, rela_sections, failed: AtomicBool::new(false), dwarf: OnceLock::new()})
}

pub struct CompilationUnit {
    pub file: Arc<DebugFile>,
    pub header: CuHeader,
}

const NO_ENTRY: usize = usize::MAX;

// DIEs with the same name but different tags or files are considered distinct. We only
// compare the hash of the file name, not the string value: a 64-bit collision is unlikely
// enough, especially when also considering the name and tag.
#[derive(Debug)]
struct DieEntry {
    tag: u8,
    file_name_hash: u64,
    // The next DIE with the same name (index into Shard::entries), or NO_ENTRY.
    next: usize,
    file: Arc<DebugFile>,
    offset: u64, // of the DIE within .debug_info
}

type ShardMap = HashMap<&'static [u8], usize, BuildHasherDefault<SipHasher13>>;

#[derive(Debug)]
struct Shard {
    // Maps a DIE name to the first entry with that name (index into `entries`).
    map: ShardMap,
    // All entries in a shard live in one dense array, which is more cache friendly.
    entries: Vec<DieEntry>,
}

pub const SHARD_BITS: u32 = 8;
const NUM_SHARDS: usize = 1 << SHARD_BITS;

fn name_hash(name: &[u8]) -> u64 {
    let mut h = SipHasher13::default();
    h.write(name);
    h.finish()
}

fn shard_of(hash: u64) -> usize {
    // The inner hash map consumes the top bits of the hash for its control tag, so shard
    // selection takes the bits just below them.
    ((hash >> (64 - 8 - SHARD_BITS)) & (NUM_SHARDS as u64 - 1)) as usize
}

// A multi-map from identifier name to the DIEs defining entities of that name across all
// registered files. Files go through two lists: `opened` (registered, awaiting update())
// and `indexed` (committed). A failed update rolls back everything it added.
#[derive(Debug)]
pub struct DwarfIndex {
    pub flags: IndexFlags,
    pub num_threads: usize,
    files: HashMap<String, Arc<DebugFile>>,
    opened: Vec<Arc<DebugFile>>,
    indexed: Vec<Arc<DebugFile>>,
    // Sharded to reduce lock contention.
    shards: Vec<CachePadded<Mutex<Shard>>>,
}

impl DwarfIndex {
    pub fn new(flags: IndexFlags) -> Result<DwarfIndex> {
        if flags.is_empty() {
            return err!(InvalidArgument, "at least one index flag must be set");
        }
        Ok(DwarfIndex {
            flags,
            num_threads: thread::available_parallelism().map_or(8, |n| n.get()),
            files: HashMap::new(),
            opened: Vec::new(),
            indexed: Vec::new(),
            shards: (0..NUM_SHARDS).map(|_| CachePadded::new(Mutex::new(Shard {map: ShardMap::default(), entries: Vec::new()}))).collect(),
        })
    }

    // Registers a file for the next update(). The same canonical path yields the same
    // handle with no further side effect.
    pub fn open(&mut self, path: &str) -> Result<Arc<DebugFile>> {
        let key = std::fs::canonicalize(path)
            .map_err(|e| Error::from_io_error(e, format!("realpath {}", path)))?
            .to_string_lossy().into_owned();
        if let Some(file) = self.files.get(&key) {
            return Ok(file.clone());
        }
        let f = File::open(&key).map_err(|e| Error::from_io_error(e, format!("open {}", path)))?;
        let elf = Arc::new(ElfFile::open(key.clone(), &f)?);
        let file = Arc::new(read_sections(elf, Some(key.clone()))?);
        self.files.insert(key, file.clone());
        self.opened.push(file.clone());
        Ok(file)
    }

    // Registers an ELF handle owned by the caller.
    pub fn open_elf(&mut self, elf: Arc<ElfFile>) -> Result<Arc<DebugFile>> {
        let file = Arc::new(read_sections(elf, None)?);
        self.opened.push(file.clone());
        Ok(file)
    }

    // Indexes everything registered since the last update. All-or-nothing: on error the
    // files from this update are rolled back and previously indexed files stay queryable.
    pub fn update(&mut self) -> Result<()> {
        let files = mem::take(&mut self.opened);
        if files.is_empty() {
            return Ok(());
        }
        match self.index_files(&files) {
            Ok(()) => {
                self.indexed.extend(files);
                Ok(())
            }
            Err(e) => {
                self.unindex_files(&files);
                for file in &files {
                    if let Some(path) = &file.path {
                        self.files.remove(path);
                    }
                }
                Err(e)
            }
        }
    }

    fn index_files(&self, files: &[Arc<DebugFile>]) -> Result<()> {
        {
            let _prof = ProfileScope::with_threshold(0.1, "applying relocations".to_string());
            self.apply_relocations(files)?;
        }

        let mut cus: Vec<CompilationUnit> = Vec::new();
        for file in files {
            let debug_str = file.section(SECTION_DEBUG_STR)?;
            if debug_str.last() != Some(&0) {
                return err!(DwarfFormat, ".debug_str is not null terminated");
            }
            let debug_info = file.section(SECTION_DEBUG_INFO)?;
            split_cus(debug_info, file.bswap, |header| cus.push(CompilationUnit {file: file.clone(), header}))?;
        }

        let _prof = ProfileScope::with_threshold(0.1, format!("indexing {} units", cus.len()));
        self.index_cus(&cus)
    }

    fn apply_relocations(&self, files: &[Arc<DebugFile>]) -> Result<()> {
        // One flat index space over every RELA entry of every new file, partitioned
        // statically across the workers.
        struct Run {
            file_idx: usize,
            section_idx: usize,
            start: usize, // first global relocation index of this run
        }
        let mut runs: Vec<Run> = Vec::new();
        let mut total = 0usize;
        for (file_idx, file) in files.iter().enumerate() {
            for section_idx in 0..NUM_SECTIONS {
                if let Some(rela) = file.rela_sections[section_idx] {
                    let count = rela.len() / RELA_ENTRY_SIZE;
                    if count > 0 {
                        runs.push(Run {file_idx, section_idx, start: total});
                        total += count;
                    }
                }
            }
        }
        if total == 0 {
            return Ok(());
        }

        let threads = self.num_threads.min(total).max(1);
        let first_error: Mutex<Option<Error>> = Mutex::new(None);
        let cancel = AtomicBool::new(false);
        thread::scope(|scope| {
            for t in 0..threads {
                let begin = total * t / threads;
                let end = total * (t + 1) / threads;
                let (runs, first_error, cancel) = (&runs, &first_error, &cancel);
                scope.spawn(move || {
                    let mut run_idx = runs.partition_point(|r| r.start <= begin) - 1;
                    let mut i = begin;
                    while i < end {
                        let run = &runs[run_idx];
                        let run_end = if run_idx + 1 < runs.len() {runs[run_idx + 1].start} else {total};
                        let file = &files[run.file_idx];
                        let stop = end.min(run_end);
                        for reloc_idx in i - run.start..stop - run.start {
                            if cancel.load(Ordering::Relaxed) {
                                return;
                            }
                            if let Err(e) = apply_relocation(file, run.section_idx, reloc_idx) {
                                // Keep the first error, drop the rest.
                                let mut lock = first_error.lock().unwrap();
                                if lock.is_none() {
                                    *lock = Some(e);
                                }
                                cancel.store(true, Ordering::Relaxed);
                                return;
                            }
                        }
                        i = stop;
                        run_idx += 1;
                    }
                });
            }
        });
        match first_error.into_inner().unwrap() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn index_cus(&self, cus: &[CompilationUnit]) -> Result<()> {
        if cus.is_empty() {
            return Ok(());
        }
        // Static partitioning into contiguous stripes, balanced by unit byte size rather
        // than unit count.
        let mut prefix = Vec::with_capacity(cus.len() + 1);
        prefix.push(0u64);
        for cu in cus {
            let size = cu.header.initial_length_size() as u64 + cu.header.unit_length;
            prefix.push(prefix.last().unwrap() + size);
        }
        let total_bytes = *prefix.last().unwrap();
        let threads = self.num_threads.min(cus.len()).max(1);
        let mut bounds = Vec::with_capacity(threads + 1);
        for t in 0..=threads {
            let target = total_bytes * t as u64 / threads as u64;
            bounds.push(prefix.partition_point(|&p| p < target).min(cus.len()));
        }
        bounds[threads] = cus.len();

        let first_error: Mutex<Option<Error>> = Mutex::new(None);
        let cancel = AtomicBool::new(false);
        thread::scope(|scope| {
            for t in 0..threads {
                let my_cus = &cus[bounds[t]..bounds[t + 1]];
                let (first_error, cancel) = (&first_error, &cancel);
                scope.spawn(move || {
                    for cu in my_cus {
                        if cancel.load(Ordering::Relaxed) {
                            return;
                        }
                        if let Err(e) = self.index_cu(cu) {
                            let mut lock = first_error.lock().unwrap();
                            if lock.is_none() {
                                *lock = Some(e);
                            }
                            cancel.store(true, Ordering::Relaxed);
                            return;
                        }
                    }
                });
            }
        });
        match first_error.into_inner().unwrap() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn index_cu(&self, cu: &CompilationUnit) -> Result<()> {
        let file = &cu.file;
        let header = &cu.header;
        let debug_abbrev = file.section(SECTION_DEBUG_ABBREV)?;
        let abbrev = AbbrevTable::compile(self.flags, debug_abbrev, header, file.has_section(SECTION_DEBUG_LINE))?;
        let debug_info = file.section(SECTION_DEBUG_INFO)?;
        let debug_str = file.section(SECTION_DEBUG_STR)?;
        let mut file_name_table = FileNameTable::empty();

        let mut r = Reader::with_range(debug_info, header.first_die_offset(), header.end_offset(), file.bswap)?;
        let mut depth = 0usize;
        let mut enum_die_offset = 0u64;

        loop {
            let die_offset = r.pos as u64;
            let mut die = DieScratch::new();
            if !read_die(&abbrev, &mut r, header, debug_info, debug_str, &mut die)? {
                // End of children.
                if depth == 0 {
                    break;
                }
                depth -= 1;
                if depth == 1 {
                    enum_die_offset = 0;
                } else if depth == 0 {
                    break;
                }
                continue;
            }

            let tag = die.flags & TAG_MASK;
            if tag == gimli::DW_TAG_compile_unit.0 as u8 {
                if depth == 0 && die.stmt_list != u64::MAX {
                    let debug_line = file.section(SECTION_DEBUG_LINE)?;
                    file_name_table = read_file_name_table(debug_line, die.stmt_list, file.bswap)?;
                }
            } else if tag != 0 && die.flags & TAG_FLAG_DECLARATION == 0 {
                let mut die_offset = die_offset;
                let mut indexable = true;
                // NB: an enumerator is indexed under the enclosing enumeration_type DIE, so
                // that a lookup by enumerator name finds the enum type.
                if depth == 1 && tag == gimli::DW_TAG_enumeration_type.0 as u8 {
                    enum_die_offset = die_offset;
                } else if depth == 2 && tag == gimli::DW_TAG_enumerator.0 as u8 && enum_die_offset != 0 {
                    die_offset = enum_die_offset;
                } else if depth != 1 {
                    indexable = false;
                }

                if indexable {
                    if die.specification != 0 && (die.name.is_none() || die.decl_file == 0) {
                        let mut decl = DieScratch::new();
                        let mut decl_r = Reader::with_range(debug_info, die.specification, header.end_offset(), file.bswap)?;
                        read_die(&abbrev, &mut decl_r, header, debug_info, debug_str, &mut decl)?;
                        if die.name.is_none() {
                            die.name = decl.name;
                        }
                        if die.decl_file == 0 {
                            die.decl_file = decl.decl_file;
                        }
                    }

                    if let Some(name) = die.name {
                        if die.decl_file > file_name_table.hashes.len() as u64 {
                            return err!(DwarfFormat, "invalid DW_AT_decl_file {}", die.decl_file);
                        }
                        let file_name_hash = if die.decl_file != 0 {
                            file_name_table.hashes[die.decl_file as usize - 1]
                        } else {
                            0
                        };
                        self.index_die(name, tag, file_name_hash, file, die_offset);
                    }
                }
            }

            if die.flags & TAG_FLAG_CHILDREN != 0 {
                if die.sibling != 0 {
                    r.pos = die.sibling;
                } else {
                    depth += 1;
                }
            } else if depth == 0 {
                break;
            }
        }
        Ok(())
    }

    fn index_die(&self, name: &'static [u8], tag: u8, file_name_hash: u64, file: &Arc<DebugFile>, offset: u64) {
        let hash = name_hash(name);
        let mut shard = self.shards[shard_of(hash)].lock().unwrap();
        let shard = &mut *shard;
        let head = shard.map.get(name).copied();
        match head {
            None => {
                shard.entries.push(DieEntry {tag, file_name_hash, next: NO_ENTRY, file: file.clone(), offset});
                shard.map.insert(name, shard.entries.len() - 1);
            }
            Some(head) => {
                let mut i = head;
                loop {
                    let entry = &shard.entries[i];
                    if entry.tag == tag && entry.file_name_hash == file_name_hash {
                        return;
                    }
                    if entry.next == NO_ENTRY {
                        break;
                    }
                    i = entry.next;
                }
                shard.entries.push(DieEntry {tag, file_name_hash, next: NO_ENTRY, file: file.clone(), offset});
                shard.entries[i].next = shard.entries.len() - 1;
            }
        }
    }

    fn unindex_files(&self, files: &[Arc<DebugFile>]) {
        // First mark all of the files that failed.
        for file in files {
            file.failed.store(true, Ordering::Relaxed);
        }
        // Then delete every entry pointing to them. Everything added since the last
        // successful update occupies a contiguous suffix of each shard's dense array, so
        // shrinking from the tail is enough.
        for shard in self.shards.iter() {
            let mut shard = shard.lock().unwrap();
            let shard = &mut *shard;
            while shard.entries.last().map_or(false, |e| e.file.failed.load(Ordering::Relaxed)) {
                shard.entries.pop();
            }
            // Sweep chain heads and tail links that pointed into the removed suffix.
            let len = shard.entries.len();
            shard.map.retain(|_, head| *head < len);
            for entry in &mut shard.entries {
                if entry.next != NO_ENTRY && entry.next >= len {
                    entry.next = NO_ENTRY;
                }
            }
        }
    }

    // name = None iterates the whole index. An empty tag set matches every tag.
    pub fn iter<'a>(&'a self, name: Option<&[u8]>, tags: &[DwTag]) -> DwarfIndexIterator<'a> {
        let tags: Vec<u16> = tags.iter().map(|t| t.0).collect();
        match name {
            Some(name) => {
                let hash = name_hash(name);
                let shard_idx = shard_of(hash);
                let pos = self.shards[shard_idx].lock().unwrap().map.get(name).copied().unwrap_or(NO_ENTRY);
                DwarfIndexIterator {index: self, tags, shard: shard_idx, pos, any_name: false}
            }
            None => DwarfIndexIterator {index: self, tags, shard: 0, pos: 0, any_name: true},
        }
    }

    pub fn stats(&self) -> IndexStats {
        let mut stats = IndexStats {files: self.indexed.len(), names: 0, entries: 0};
        for shard in self.shards.iter() {
            let shard = shard.lock().unwrap();
            stats.names += shard.map.len();
            stats.entries += shard.entries.len();
        }
        stats
    }

    pub fn word_size(&self) -> u8 {
        // Only 64-bit ELF is accepted, so any indexed file implies 8.
        if self.indexed.is_empty() {mem::size_of::<usize>() as u8} else {8}
    }

    pub fn is_little_endian(&self) -> bool {
        match self.indexed.first() {
            Some(f) => f.is_little_endian(),
            None => cfg!(target_endian = "little"),
        }
    }
}

fn apply_relocation(file: &DebugFile, section_idx: usize, i: usize) -> Result<()> {
    let rela_data = file.rela_sections[section_idx].unwrap();
    let (mut rela, _) = unsafe {memcpy_struct::<libc::Elf64_Rela>(&rela_data[i * RELA_ENTRY_SIZE..], "Elf64_Rela")}?;
    if file.bswap {
        rela.r_offset = rela.r_offset.swap_bytes();
        rela.r_info = rela.r_info.swap_bytes();
        rela.r_addend = rela.r_addend.swap_bytes();
    }

    let r_sym = (rela.r_info >> 32) as usize;
    let r_type = (rela.r_info & 0xffffffff) as u32;
    let size: usize = match r_type {
        R_X86_64_NONE => return Ok(()),
        R_X86_64_32 => 4,
        R_X86_64_64 => 8,
        _ => return err!(ElfFormat, "unimplemented relocation type {}", r_type),
    };

    let symtab = file.section(SECTION_SYMTAB)?;
    if r_sym >= symtab.len() / SYM_ENTRY_SIZE {
        return err!(ElfFormat, "invalid relocation symbol");
    }
    let (mut sym, _) = unsafe {memcpy_struct::<libc::Elf64_Sym>(&symtab[r_sym * SYM_ENTRY_SIZE..], "Elf64_Sym")}?;
    if file.bswap {
        sym.st_value = sym.st_value.swap_bytes();
    }

    let section = file.sections[section_idx].unwrap();
    let offset = rela.r_offset as usize;
    if rela.r_offset > usize::MAX as u64 - size as u64 || offset + size > section.len() {
        return err!(ElfFormat, "invalid relocation offset");
    }

    let value = sym.st_value.wrapping_add(rela.r_addend as u64);
    // Written in the file's byte order so the indexing phase decodes it like any other
    // field. No concurrent readers: sections are only mutated during the relocation phase,
    // and the relocation index space assigns each entry to exactly one worker.
    unsafe {
        let p = section.as_ptr().add(offset) as *mut u8;
        if size == 4 {
            let v = if file.bswap {(value as u32).swap_bytes()} else {value as u32};
            ptr::copy_nonoverlapping(v.to_ne_bytes().as_ptr(), p, 4);
        } else {
            let v = if file.bswap {value.swap_bytes()} else {value};
            ptr::copy_nonoverlapping(v.to_ne_bytes().as_ptr(), p, 8);
        }
    }
    Ok(())
}

struct DieScratch {
    sibling: usize, // absolute offset into .debug_info, 0 = none
    name: Option<&'static [u8]>,
    stmt_list: u64, // u64::MAX = none
    decl_file: u64,
    specification: usize, // absolute offset into .debug_info, 0 = none
    flags: u8,
}

impl DieScratch {
    fn new() -> Self {
        Self {sibling: 0, name: None, stmt_list: u64::MAX, decl_file: 0, specification: 0, flags: 0}
    }
}

// Interprets the compiled abbreviation instruction stream for one DIE. Returns false for a
// null entry (end of children).
fn read_die(abbrev: &AbbrevTable, r: &mut Reader<'static>, cu: &CuHeader, debug_info: &'static [u8],
            debug_str: &'static [u8], die: &mut DieScratch) -> Result<bool> {
    let code = r.read_uleb128()?;
    if code == 0 {
        return Ok(false);
    }
    let insns = abbrev.insns_for(code)?;
    let mut ip = 0usize;
    loop {
        let insn = insns[ip];
        ip += 1;
        if insn == 0 {
            break;
        }
        match insn {
            ATTRIB_BLOCK1 => {
                let n = r.read_u8()? as usize;
                r.skip(n)?;
            }
            ATTRIB_BLOCK2 => {
                let n = r.read_u16()? as usize;
                r.skip(n)?;
            }
            ATTRIB_BLOCK4 => {
                let n = r.read_u32()? as usize;
                r.skip(n)?;
            }
            ATTRIB_EXPRLOC => {
                let n = r.read_uleb128()? as usize;
                r.skip(n)?;
            }
            ATTRIB_LEB128 => r.skip_leb128()?,
            ATTRIB_NAME_STRING => die.name = Some(r.read_string()?),
            ATTRIB_STRING => r.skip_string()?,
            ATTRIB_SIBLING_REF1 => die.sibling = cu_ref(cu, r.read_u8()? as u64)?,
            ATTRIB_SIBLING_REF2 => die.sibling = cu_ref(cu, r.read_u16()? as u64)?,
            ATTRIB_SIBLING_REF4 => die.sibling = cu_ref(cu, r.read_u32()? as u64)?,
            ATTRIB_SIBLING_REF8 => die.sibling = cu_ref(cu, r.read_u64()?)?,
            ATTRIB_SIBLING_REF_UDATA => die.sibling = cu_ref(cu, r.read_uleb128()?)?,
            ATTRIB_NAME_STRP4 => die.name = Some(c_str_at(debug_str, r.read_u32()? as usize)?),
            ATTRIB_NAME_STRP8 => die.name = Some(c_str_at(debug_str, r.read_u64()? as usize)?),
            ATTRIB_STMT_LIST_LINEPTR4 => die.stmt_list = r.read_u32()? as u64,
            ATTRIB_STMT_LIST_LINEPTR8 => die.stmt_list = r.read_u64()?,
            ATTRIB_DECL_FILE_DATA1 => die.decl_file = r.read_u8()? as u64,
            ATTRIB_DECL_FILE_DATA2 => die.decl_file = r.read_u16()? as u64,
            ATTRIB_DECL_FILE_DATA4 => die.decl_file = r.read_u32()? as u64,
            ATTRIB_DECL_FILE_DATA8 => die.decl_file = r.read_u64()?,
            ATTRIB_DECL_FILE_UDATA => die.decl_file = r.read_uleb128()?,
            ATTRIB_SPECIFICATION_REF1 => die.specification = cu_ref(cu, r.read_u8()? as u64)?,
            ATTRIB_SPECIFICATION_REF2 => die.specification = cu_ref(cu, r.read_u16()? as u64)?,
            ATTRIB_SPECIFICATION_REF4 => die.specification = cu_ref(cu, r.read_u32()? as u64)?,
            ATTRIB_SPECIFICATION_REF8 => die.specification = cu_ref(cu, r.read_u64()?)?,
            ATTRIB_SPECIFICATION_REF_UDATA => die.specification = cu_ref(cu, r.read_uleb128()?)?,
            skip => r.skip(skip as usize)?,
        }
    }
    die.flags = insns[ip];
    Ok(true)
}

// Resolves a CU-relative reference to an offset within .debug_info.
fn cu_ref(cu: &CuHeader, offset: u64) -> Result<usize> {
    match (offset as usize).checked_add(cu.offset) {
        Some(target) if target <= cu.end_offset() => Ok(target),
        _ => err!(TruncatedDebugInfo, "debug information is truncated"),
    }
}

// One occurrence of a named entity: which file defines it and where its DIE lives.
#[derive(Clone)]
pub struct IndexedDie {
    pub file: Arc<DebugFile>,
    pub tag: DwTag,
    pub file_name_hash: u64,
    pub offset: u64, // of the DIE within .debug_info
}

impl IndexedDie {
    // Finds the unit containing this DIE in the file's DWARF view.
    pub fn resolve(&self) -> Result<(UnitHeader<SliceType>, UnitOffset<usize>)> {
        let dwarf = self.file.dwarf()?;
        let mut units = dwarf.debug_info.units();
        while let Some(header) = units.next()? {
            let start = match header.offset().as_debug_info_offset() {
                Some(o) => o.0,
                None => continue,
            };
            let end = start + header.length_including_self();
            if (self.offset as usize) >= start && (self.offset as usize) < end {
                return Ok((header, UnitOffset(self.offset as usize - start)));
            }
        }
        err!(Lookup, "DIE at 0x{:x} not found in any unit of {}", self.offset, self.file.name())
    }

    pub fn read_name(&self) -> Result<Option<String>> {
        let dwarf = self.file.dwarf()?;
        let (header, offset) = self.resolve()?;
        let unit = gimli::Unit::new(dwarf, header)?;
        let entry = unit.entry(offset)?;
        match entry.attr_value(gimli::DW_AT_name)? {
            Some(value) => Ok(Some(String::from_utf8_lossy(dwarf.attr_string(&unit, value)?.slice()).into_owned())),
            None => Ok(None),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct IndexStats {
    pub files: usize,
    pub names: usize,
    pub entries: usize,
}

pub struct DwarfIndexIterator<'a> {
    index: &'a DwarfIndex,
    tags: Vec<u16>,
    shard: usize,
    pos: usize,
    any_name: bool,
}

impl<'a> DwarfIndexIterator<'a> {
    fn matches(&self, tag: u8) -> bool {
        self.tags.is_empty() || self.tags.contains(&(tag as u16))
    }
}

impl<'a> Iterator for DwarfIndexIterator<'a> {
    type Item = IndexedDie;

    fn next(&mut self) -> Option<IndexedDie> {
        if self.any_name {
            loop {
                if self.shard >= NUM_SHARDS {
                    return None;
                }
                let shard = self.index.shards[self.shard].lock().unwrap();
                if self.pos >= shard.entries.len() {
                    drop(shard);
                    self.shard += 1;
                    self.pos = 0;
                    continue;
                }
                let entry = &shard.entries[self.pos];
                self.pos += 1;
                if self.matches(entry.tag) {
                    return Some(IndexedDie {file: entry.file.clone(), tag: DwTag(entry.tag as u16), file_name_hash: entry.file_name_hash, offset: entry.offset});
                }
            }
        } else {
            loop {
                if self.pos == NO_ENTRY {
                    return None;
                }
                let shard = self.index.shards[self.shard].lock().unwrap();
                let entry = &shard.entries[self.pos];
                self.pos = entry.next;
                if self.matches(entry.tag) {
                    return Some(IndexedDie {file: entry.file.clone(), tag: DwTag(entry.tag as u16), file_name_hash: entry.file_name_hash, offset: entry.offset});
                }
            }
        }
    }
}
