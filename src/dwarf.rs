use crate::{*, error::{*, Result, Error}, util::{*, Reader}, index::IndexFlags};
use gimli::*;
use siphasher::sip::SipHasher24;
use std::hash::Hasher;

// The DWARF abbreviation table gets translated into a series of instructions interpreted by
// the DIE scanner in index.rs. An instruction <= INSN_MAX_SKIP is a number of raw bytes to
// skip. The instructions above it parse the attributes the indexer cares about. Every
// instruction sequence is terminated by a zero byte followed by a flag byte: the DWARF tag
// in the low TAG_BITS bits (zero if the tag is of no interest), TAG_FLAG_DECLARATION and
// TAG_FLAG_CHILDREN in the high bits.
pub const INSN_MAX_SKIP: u8 = 229;
pub const ATTRIB_BLOCK1: u8 = 230;
pub const ATTRIB_BLOCK2: u8 = 231;
pub const ATTRIB_BLOCK4: u8 = 232;
pub const ATTRIB_EXPRLOC: u8 = 233;
pub const ATTRIB_LEB128: u8 = 234;
pub const ATTRIB_STRING: u8 = 235;
pub const ATTRIB_SIBLING_REF1: u8 = 236;
pub const ATTRIB_SIBLING_REF2: u8 = 237;
pub const ATTRIB_SIBLING_REF4: u8 = 238;
pub const ATTRIB_SIBLING_REF8: u8 = 239;
pub const ATTRIB_SIBLING_REF_UDATA: u8 = 240;
pub const ATTRIB_NAME_STRP4: u8 = 241;
pub const ATTRIB_NAME_STRP8: u8 = 242;
pub const ATTRIB_NAME_STRING: u8 = 243;
pub const ATTRIB_STMT_LIST_LINEPTR4: u8 = 244;
pub const ATTRIB_STMT_LIST_LINEPTR8: u8 = 245;
pub const ATTRIB_DECL_FILE_DATA1: u8 = 246;
pub const ATTRIB_DECL_FILE_DATA2: u8 = 247;
pub const ATTRIB_DECL_FILE_DATA4: u8 = 248;
pub const ATTRIB_DECL_FILE_DATA8: u8 = 249;
pub const ATTRIB_DECL_FILE_UDATA: u8 = 250;
pub const ATTRIB_SPECIFICATION_REF1: u8 = 251;
pub const ATTRIB_SPECIFICATION_REF2: u8 = 252;
pub const ATTRIB_SPECIFICATION_REF4: u8 = 253;
pub const ATTRIB_SPECIFICATION_REF8: u8 = 254;
pub const ATTRIB_SPECIFICATION_REF_UDATA: u8 = 255;

const _: () = assert!(ATTRIB_SPECIFICATION_REF_UDATA == u8::MAX);

// Maximum number of bits used by the tags we care about.
pub const TAG_BITS: u32 = 6;
pub const TAG_MASK: u8 = (1 << TAG_BITS) - 1;
pub const TAG_FLAG_DECLARATION: u8 = 0x40;
pub const TAG_FLAG_CHILDREN: u8 = 0x80;

#[derive(Clone, Copy)]
pub struct CuHeader {
    pub offset: usize, // of the CU within .debug_info
    pub unit_length: u64,
    pub version: u16,
    pub debug_abbrev_offset: u64,
    pub address_size: u8,
    pub is_64_bit: bool,
}

impl CuHeader {
    pub fn initial_length_size(&self) -> usize { if self.is_64_bit {12} else {4} }

    // Offset of the first DIE within .debug_info.
    pub fn first_die_offset(&self) -> usize { self.offset + if self.is_64_bit {23} else {11} }

    pub fn end_offset(&self) -> usize { self.offset + self.initial_length_size() + self.unit_length as usize }
}

pub fn read_cu_header(r: &mut Reader, offset: usize) -> Result<CuHeader> {
    let tmp = r.read_u32()?;
    let is_64_bit = tmp == 0xffffffff;
    let unit_length = if is_64_bit {r.read_u64()?} else {tmp as u64};

    let version = r.read_u16()?;
    if version != 2 && version != 3 && version != 4 {
        return err!(DwarfFormat, "unknown DWARF CU version {}", version);
    }

    let debug_abbrev_offset = if is_64_bit {r.read_u64()?} else {r.read_u32()? as u64};
    let address_size = r.read_u8()?;

    Ok(CuHeader {offset, unit_length, version, debug_abbrev_offset, address_size, is_64_bit})
}

// Splits .debug_info into CU headers. Contents are validated later, by the scanner.
pub fn split_cus(debug_info: &[u8], bswap: bool, mut found: impl FnMut(CuHeader)) -> Result<()> {
    let mut pos = 0usize;
    while pos < debug_info.len() {
        let mut r = Reader::with_range(debug_info, pos, debug_info.len(), bswap)?;
        let header = read_cu_header(&mut r, pos)?;
        let next = match (header.unit_length as usize).checked_add(pos + header.initial_length_size()) {
            Some(n) if n <= debug_info.len() => n,
            _ => return err!(TruncatedDebugInfo, "debug information is truncated"),
        };
        found(header);
        pos = next;
    }
    Ok(())
}

fn is_type_tag(tag: DwTag) -> bool {
    tag == DW_TAG_base_type ||
        tag == DW_TAG_class_type ||
        tag == DW_TAG_enumeration_type ||
        tag == DW_TAG_structure_type ||
        tag == DW_TAG_typedef ||
        tag == DW_TAG_union_type
}

#[derive(Debug)]
pub struct AbbrevTable {
    // Indexed on the DWARF abbreviation code minus one; maps the code to the offset in
    // `insns` where the instruction stream for that code begins.
    //
    // Abbreviation codes don't have to be sequential in theory. In practice compilers
    // generate sequential codes starting at one, so we get away with a flat array.
    pub decls: Vec<u32>,
    pub insns: Vec<u8>,
}

impl AbbrevTable {
    pub fn compile(flags: IndexFlags, debug_abbrev: &[u8], cu: &CuHeader, has_debug_line: bool) -> Result<AbbrevTable> {
        let offset = cu.debug_abbrev_offset as usize;
        if offset > debug_abbrev.len() {
            return err!(TruncatedDebugInfo, "debug information is truncated");
        }
        let mut r = Reader::with_range(debug_abbrev, offset, debug_abbrev.len(), false)?;
        let mut table = AbbrevTable {decls: Vec::new(), insns: Vec::new()};
        while table.read_decl(flags, &mut r, cu, has_debug_line)? {}
        Ok(table)
    }

    pub fn insns_for(&self, code: u64) -> Result<&[u8]> {
        if code < 1 || code > self.decls.len() as u64 {
            return err!(DwarfFormat, "unknown abbreviation code {}", code);
        }
        Ok(&self.insns[self.decls[(code - 1) as usize] as usize..])
    }

    fn read_decl(&mut self, flags: IndexFlags, r: &mut Reader, cu: &CuHeader, has_debug_line: bool) -> Result<bool> {
        let code = r.read_uleb128()?;
        if code == 0 {
            return Ok(false);
        }
        if code != self.decls.len() as u64 + 1 {
            return err!(DwarfFormat, "DWARF abbreviation table is not sequential");
        }
        self.decls.push(self.insns.len() as u32);

        let tag = r.read_uleb128()?;
        // Vendor tags above 16 bits can't be of interest, DwTag(0) stands in for them.
        let tag = if tag <= u16::MAX as u64 {DwTag(tag as u16)} else {DwTag(0)};

        let should_index = (flags.contains(IndexFlags::TYPES) && is_type_tag(tag)) ||
            (flags.contains(IndexFlags::VARIABLES) && tag == DW_TAG_variable) ||
            (flags.contains(IndexFlags::ENUMERATORS) && tag == DW_TAG_enumerator) ||
            (flags.contains(IndexFlags::FUNCTIONS) && tag == DW_TAG_subprogram);

        let mut die_flags = if should_index || tag == DW_TAG_compile_unit ||
            (flags.contains(IndexFlags::ENUMERATORS) && tag == DW_TAG_enumeration_type) {
            tag.0 as u8
        } else {
            0
        };

        let children = r.read_u8()?;
        if children != 0 {
            die_flags |= TAG_FLAG_CHILDREN;
        }

        let mut first = true;
        loop {
            let name = r.read_uleb128()?;
            let form = r.read_uleb128()?;
            if name == 0 && form == 0 {
                break;
            }
            let name = if name <= u16::MAX as u64 {DwAt(name as u16)} else {DwAt(0)};
            if form > u16::MAX as u64 {
                return err!(DwarfFormat, "unknown attribute form {}", form);
            }
            let form = DwForm(form as u16);

            let mut special: Option<u8> = None;
            if name == DW_AT_sibling && !(flags.contains(IndexFlags::ENUMERATORS) && tag == DW_TAG_enumeration_type) {
                // If we are indexing enumerators, we must descend into DW_TAG_enumeration_type
                // to find the DW_TAG_enumerator children instead of skipping to the sibling DIE.
                special = match form {
                    DW_FORM_ref1 => Some(ATTRIB_SIBLING_REF1),
                    DW_FORM_ref2 => Some(ATTRIB_SIBLING_REF2),
                    DW_FORM_ref4 => Some(ATTRIB_SIBLING_REF4),
                    DW_FORM_ref8 => Some(ATTRIB_SIBLING_REF8),
                    DW_FORM_ref_udata => Some(ATTRIB_SIBLING_REF_UDATA),
                    _ => None,
                };
            } else if name == DW_AT_name && should_index {
                special = match form {
                    DW_FORM_strp => Some(if cu.is_64_bit {ATTRIB_NAME_STRP8} else {ATTRIB_NAME_STRP4}),
                    DW_FORM_string => Some(ATTRIB_NAME_STRING),
                    _ => None,
                };
            } else if name == DW_AT_stmt_list && tag == DW_TAG_compile_unit && has_debug_line {
                special = match form {
                    DW_FORM_data4 => Some(ATTRIB_STMT_LIST_LINEPTR4),
                    DW_FORM_data8 => Some(ATTRIB_STMT_LIST_LINEPTR8),
                    DW_FORM_sec_offset => Some(if cu.is_64_bit {ATTRIB_STMT_LIST_LINEPTR8} else {ATTRIB_STMT_LIST_LINEPTR4}),
                    _ => None,
                };
            } else if name == DW_AT_decl_file && should_index {
                special = match form {
                    DW_FORM_data1 => Some(ATTRIB_DECL_FILE_DATA1),
                    DW_FORM_data2 => Some(ATTRIB_DECL_FILE_DATA2),
                    DW_FORM_data4 => Some(ATTRIB_DECL_FILE_DATA4),
                    DW_FORM_data8 => Some(ATTRIB_DECL_FILE_DATA8),
                    // decl_file must be positive, so if the compiler uses DW_FORM_sdata
                    // for some reason, just treat it as udata.
                    DW_FORM_sdata | DW_FORM_udata => Some(ATTRIB_DECL_FILE_UDATA),
                    _ => None,
                };
            } else if name == DW_AT_declaration {
                // In theory this could be DW_FORM_flag with a value of zero, but in practice
                // GCC always uses DW_FORM_flag_present. The value bytes, if any, are skipped
                // by the generic handling below.
                die_flags |= TAG_FLAG_DECLARATION;
            } else if name == DW_AT_specification && should_index {
                special = match form {
                    DW_FORM_ref1 => Some(ATTRIB_SPECIFICATION_REF1),
                    DW_FORM_ref2 => Some(ATTRIB_SPECIFICATION_REF2),
                    DW_FORM_ref4 => Some(ATTRIB_SPECIFICATION_REF4),
                    DW_FORM_ref8 => Some(ATTRIB_SPECIFICATION_REF8),
                    DW_FORM_ref_udata => Some(ATTRIB_SPECIFICATION_REF_UDATA),
                    _ => None,
                };
            }

            if special.is_none() {
                special = match form {
                    DW_FORM_block1 => Some(ATTRIB_BLOCK1),
                    DW_FORM_block2 => Some(ATTRIB_BLOCK2),
                    DW_FORM_block4 => Some(ATTRIB_BLOCK4),
                    DW_FORM_exprloc => Some(ATTRIB_EXPRLOC),
                    DW_FORM_sdata | DW_FORM_udata | DW_FORM_ref_udata => Some(ATTRIB_LEB128),
                    DW_FORM_string => Some(ATTRIB_STRING),
                    _ => None,
                };
            }

            if let Some(insn) = special {
                first = false;
                self.insns.push(insn);
                continue;
            }

            let mut insn: u8 = match form {
                DW_FORM_addr => cu.address_size,
                DW_FORM_data1 | DW_FORM_ref1 | DW_FORM_flag => 1,
                DW_FORM_data2 | DW_FORM_ref2 => 2,
                DW_FORM_data4 | DW_FORM_ref4 => 4,
                // Type units are not indexed, so a DW_FORM_ref_sig8 reference is skipped
                // with no semantic action.
                DW_FORM_data8 | DW_FORM_ref8 | DW_FORM_ref_sig8 => 8,
                DW_FORM_ref_addr | DW_FORM_sec_offset | DW_FORM_strp => if cu.is_64_bit {8} else {4},
                DW_FORM_flag_present => continue,
                DW_FORM_indirect => return err!(DwarfFormat, "DW_FORM_indirect is not implemented"),
                _ => return err!(DwarfFormat, "unknown attribute form {}", form.0),
            };
            if insn == 0 {
                continue;
            }

            // Merge consecutive skips, up to the INSN_MAX_SKIP ceiling.
            if !first {
                let last = *self.insns.last().unwrap();
                if last < INSN_MAX_SKIP {
                    if last as u16 + insn as u16 <= INSN_MAX_SKIP as u16 {
                        *self.insns.last_mut().unwrap() = last + insn;
                        continue;
                    }
                    insn = (last as u16 + insn as u16 - INSN_MAX_SKIP as u16) as u8;
                    *self.insns.last_mut().unwrap() = INSN_MAX_SKIP;
                }
            }
            first = false;
            self.insns.push(insn);
        }

        self.insns.push(0);
        self.insns.push(die_flags);
        Ok(true)
    }
}

// Iterates path components in reverse order, canonicalising as it goes: empty and "."
// components are dropped, ".." consumes the component nearer the leaf. An absolute path
// yields one final empty component for the root; ".." left over at the root is dropped.
pub struct PathComponents<'a> {
    path: &'a [u8],
    dot_dot: usize,
}

impl<'a> PathComponents<'a> {
    pub fn new(path: &'a [u8]) -> Self {
        Self {path, dot_dot: 0}
    }
}

impl<'a> Iterator for PathComponents<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        loop {
            let mut end = self.path.len();
            while end > 0 && self.path[end-1] == b'/' {
                end -= 1;
            }
            if end == 0 {
                if !self.path.is_empty() {
                    // All that's left is the leading "/".
                    self.path = &[];
                    self.dot_dot = 0;
                    return Some(b"");
                }
                if self.dot_dot > 0 {
                    self.dot_dot -= 1;
                    return Some(b"..");
                }
                return None;
            }
            let mut start = end;
            while start > 0 && self.path[start-1] != b'/' {
                start -= 1;
            }
            let component = &self.path[start..end];
            self.path = &self.path[..start];
            match component {
                b"." => (),
                b".." => self.dot_dot += 1,
                _ if self.dot_dot > 0 => self.dot_dot -= 1,
                _ => return Some(component),
            }
        }
    }
}

// We don't care about hash flooding attacks, so the key is zero.
fn file_hasher() -> SipHasher24 {
    SipHasher24::new_with_keys(0, 0)
}

// Hashes the canonical path of a directory: components in reverse order, each with a
// trailing slash.
fn hash_directory(hash: &mut SipHasher24, path: &[u8]) {
    for component in PathComponents::new(path) {
        hash.write(component);
        hash.write(b"/");
    }
}

// The digest a DIE declared in `name` under `directory` gets in a file-name table.
// Collaborators hash query paths with this to compare against indexed entries.
pub fn file_name_hash(directory: &[u8], name: &[u8]) -> u64 {
    let mut hash = file_hasher();
    hash_directory(&mut hash, directory);
    hash.write(name);
    hash.finish()
}

// Per-CU table of file name digests, indexed by the 1-based DWARF file index minus one.
#[derive(Debug)]
pub struct FileNameTable {
    pub hashes: Vec<u64>,
}

impl FileNameTable {
    pub fn empty() -> Self { Self {hashes: Vec::new()} }
}

// Parses only the header of the line number program at `stmt_list` and digests its file
// table. The program itself is never executed.
pub fn read_file_name_table(debug_line: &[u8], stmt_list: u64, bswap: bool) -> Result<FileNameTable> {
    if stmt_list > debug_line.len() as u64 {
        return err!(TruncatedDebugInfo, "debug information is truncated");
    }
    let mut r = Reader::with_range(debug_line, stmt_list as usize, debug_line.len(), bswap)?;
    skip_lnp_header(&mut r)?;

    let mut directories: Vec<SipHasher24> = Vec::new();
    loop {
        let path = r.read_string()?;
        if path.is_empty() {
            break;
        }
        let mut hash = file_hasher();
        hash_directory(&mut hash, path);
        directories.push(hash);
    }

    let mut table = FileNameTable::empty();
    loop {
        let path = r.read_string()?;
        if path.is_empty() {
            break;
        }
        let directory_index = r.read_uleb128()?;
        // mtime, size
        r.skip_leb128()?;
        r.skip_leb128()?;

        if directory_index > directories.len() as u64 {
            return err!(DwarfFormat, "directory index {} is invalid", directory_index);
        }

        let mut hash = if directory_index != 0 {
            directories[directory_index as usize - 1].clone()
        } else {
            file_hasher()
        };
        hash.write(path);
        table.hashes.push(hash.finish());
    }
    Ok(table)
}

fn skip_lnp_header(r: &mut Reader) -> Result<()> {
    let tmp = r.read_u32()?;
    let is_64_bit = tmp == 0xffffffff;
    if is_64_bit {
        r.skip(8)?;
    }

    let version = r.read_u16()?;
    if version != 2 && version != 3 && version != 4 {
        return err!(DwarfFormat, "unknown DWARF LNP version {}", version);
    }

    // header_length
    // minimum_instruction_length
    // maximum_operations_per_instruction (DWARF 4 only)
    // default_is_stmt
    // line_base
    // line_range
    r.skip(if is_64_bit {8} else {4})?;
    r.skip(4 + (version >= 4) as usize)?;

    let opcode_base = r.read_u8()?;
    // standard_opcode_lengths
    r.skip((opcode_base as usize).saturating_sub(1))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cu32() -> CuHeader {
        CuHeader {offset: 0, unit_length: 0, version: 4, debug_abbrev_offset: 0, address_size: 8, is_64_bit: false}
    }

    fn uleb(v: u64) -> Vec<u8> {
        let mut v = v;
        let mut out = Vec::new();
        loop {
            let b = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(b);
                break;
            }
            out.push(b | 0x80);
        }
        out
    }

    fn abbrev(decls: &[(u64, u16, bool, &[(u16, u16)])]) -> Vec<u8> {
        let mut out = Vec::new();
        for &(code, tag, children, attrs) in decls {
            out.extend_from_slice(&uleb(code));
            out.extend_from_slice(&uleb(tag as u64));
            out.push(children as u8);
            for &(at, form) in attrs {
                out.extend_from_slice(&uleb(at as u64));
                out.extend_from_slice(&uleb(form as u64));
            }
            out.push(0);
            out.push(0);
        }
        out.push(0);
        out
    }

    #[test]
    fn compile_basic() {
        // compile_unit { name: string, stmt_list: data4 }, structure_type { name: strp, decl_file: data1 }
        let data = abbrev(&[
            (1, DW_TAG_compile_unit.0, true, &[(DW_AT_name.0, DW_FORM_string.0), (DW_AT_stmt_list.0, DW_FORM_data4.0)]),
            (2, DW_TAG_structure_type.0, false, &[(DW_AT_name.0, DW_FORM_strp.0), (DW_AT_decl_file.0, DW_FORM_data1.0)]),
        ]);
        let table = AbbrevTable::compile(IndexFlags::TYPES, &data, &cu32(), true).unwrap();
        assert_eq!(table.decls, vec![0, 4]);
        // compile_unit is not indexed, so its name is a plain string skip.
        assert_eq!(&table.insns[0..4], &[ATTRIB_STRING, ATTRIB_STMT_LIST_LINEPTR4, 0,
                                         DW_TAG_compile_unit.0 as u8 | TAG_FLAG_CHILDREN][..]);
        assert_eq!(&table.insns[4..], &[ATTRIB_NAME_STRP4, ATTRIB_DECL_FILE_DATA1, 0, DW_TAG_structure_type.0 as u8][..]);
    }

    #[test]
    fn compile_skip_coalescing() {
        // Uninteresting DIE: data8 + data8 + addr(8) + data4 coalesce into 28 raw bytes.
        let data = abbrev(&[
            (1, DW_TAG_lexical_block.0, false, &[
                (DW_AT_low_pc.0, DW_FORM_data8.0),
                (DW_AT_high_pc.0, DW_FORM_data8.0),
                (DW_AT_entry_pc.0, DW_FORM_addr.0),
                (DW_AT_byte_size.0, DW_FORM_data4.0),
            ]),
        ]);
        let table = AbbrevTable::compile(IndexFlags::TYPES, &data, &cu32(), false).unwrap();
        assert_eq!(table.insns, vec![28, 0, 0]);
    }

    #[test]
    fn compile_skip_ceiling() {
        // 29 data8 attributes: 232 raw bytes split as 229 + 3.
        let attrs: Vec<(u16, u16)> = (0..29).map(|_| (DW_AT_low_pc.0, DW_FORM_data8.0)).collect();
        let data = abbrev(&[(1, DW_TAG_lexical_block.0, false, &attrs)]);
        let table = AbbrevTable::compile(IndexFlags::TYPES, &data, &cu32(), false).unwrap();
        assert_eq!(table.insns, vec![INSN_MAX_SKIP, 3, 0, 0]);
    }

    #[test]
    fn compile_non_sequential() {
        let mut data = abbrev(&[(1, DW_TAG_compile_unit.0, true, &[])]);
        data.pop(); // table terminator
        data.extend_from_slice(&abbrev(&[(3, DW_TAG_structure_type.0, false, &[])]));
        let err = AbbrevTable::compile(IndexFlags::TYPES, &data, &cu32(), false).unwrap_err();
        assert!(err.is_dwarf_format());
    }

    #[test]
    fn compile_enum_sibling() {
        let decls: &[(u64, u16, bool, &[(u16, u16)])] = &[
            (1, DW_TAG_enumeration_type.0, true, &[(DW_AT_sibling.0, DW_FORM_ref4.0), (DW_AT_name.0, DW_FORM_string.0)]),
        ];
        // Without enumerators the sibling reference compiles to a jump...
        let data = abbrev(decls);
        let table = AbbrevTable::compile(IndexFlags::TYPES, &data, &cu32(), false).unwrap();
        assert_eq!(table.insns, vec![ATTRIB_SIBLING_REF4, ATTRIB_NAME_STRING, 0,
                                     DW_TAG_enumeration_type.0 as u8 | TAG_FLAG_CHILDREN]);
        // ...with enumerators the scanner must descend, so the sibling is a raw 4-byte skip.
        let table = AbbrevTable::compile(IndexFlags::TYPES | IndexFlags::ENUMERATORS, &data, &cu32(), false).unwrap();
        assert_eq!(table.insns, vec![4, ATTRIB_NAME_STRING, 0,
                                     DW_TAG_enumeration_type.0 as u8 | TAG_FLAG_CHILDREN]);
    }

    #[test]
    fn compile_declaration_and_indirect() {
        let data = abbrev(&[
            (1, DW_TAG_structure_type.0, false, &[(DW_AT_declaration.0, DW_FORM_flag_present.0)]),
        ]);
        let table = AbbrevTable::compile(IndexFlags::TYPES, &data, &cu32(), false).unwrap();
        assert_eq!(table.insns, vec![0, DW_TAG_structure_type.0 as u8 | TAG_FLAG_DECLARATION]);

        let data = abbrev(&[
            (1, DW_TAG_structure_type.0, false, &[(DW_AT_name.0, DW_FORM_indirect.0)]),
        ]);
        assert!(AbbrevTable::compile(IndexFlags::TYPES, &data, &cu32(), false).is_err());
    }

    #[test]
    fn split_cu_headers() {
        let mut info = Vec::new();
        // version 4, abbrev offset 0x10, address size 8, one byte of content
        info.extend_from_slice(&8u32.to_le_bytes());
        info.extend_from_slice(&4u16.to_le_bytes());
        info.extend_from_slice(&0x10u32.to_le_bytes());
        info.push(8);
        info.push(0);
        let mut cus = Vec::new();
        split_cus(&info, false, |h| cus.push(h)).unwrap();
        assert_eq!(cus.len(), 1);
        assert_eq!(cus[0].unit_length, 8);
        assert_eq!(cus[0].debug_abbrev_offset, 0x10);
        assert_eq!(cus[0].first_die_offset(), 11);
        assert_eq!(cus[0].end_offset(), 12);

        // Version 5 is rejected.
        info[4..6].copy_from_slice(&5u16.to_le_bytes());
        let err = split_cus(&info, false, |_| ()).unwrap_err();
        assert!(err.is_dwarf_format());

        // A unit length past the end of the section is truncation.
        info[4..6].copy_from_slice(&4u16.to_le_bytes());
        info[0..4].copy_from_slice(&100u32.to_le_bytes());
        let err = split_cus(&info, false, |_| ()).unwrap_err();
        assert!(err.is_truncated());

        // DWARF64 initial length.
        let mut info64 = Vec::new();
        info64.extend_from_slice(&0xffffffffu32.to_le_bytes());
        info64.extend_from_slice(&12u64.to_le_bytes());
        info64.extend_from_slice(&4u16.to_le_bytes());
        info64.extend_from_slice(&0x20u64.to_le_bytes());
        info64.push(8);
        info64.push(0);
        let mut cus = Vec::new();
        split_cus(&info64, false, |h| cus.push(h)).unwrap();
        assert!(cus[0].is_64_bit);
        assert_eq!(cus[0].debug_abbrev_offset, 0x20);
        assert_eq!(cus[0].first_die_offset(), 23);
        assert_eq!(cus[0].end_offset(), 24);
    }

    fn sip(bytes: &[u8]) -> u64 {
        let mut h = file_hasher();
        h.write(bytes);
        h.finish()
    }

    #[test]
    fn path_components_reversed() {
        let collect = |p: &'static [u8]| -> Vec<&'static [u8]> { PathComponents::new(p).collect() };
        assert_eq!(collect(b"/src/a"), vec![&b"a"[..], b"src", b""]);
        assert_eq!(collect(b"src/a"), vec![&b"a"[..], b"src"]);
        assert_eq!(collect(b"//src//.//a/"), vec![&b"a"[..], b"src", b""]);
        assert_eq!(collect(b"/src/../a"), vec![&b"a"[..], b""]);
        assert_eq!(collect(b"/.."), vec![&b""[..]]);
        assert_eq!(collect(b"../a"), vec![&b"a"[..], b".."]);
        assert_eq!(collect(b""), Vec::<&[u8]>::new());
    }

    #[test]
    fn file_hashes() {
        // "/src" + "a.c" digests the byte stream "src" "/" "" "/" "a.c".
        assert_eq!(file_name_hash(b"/src", b"a.c"), sip(b"src//a.c"));
        // Relative directory has no root component.
        assert_eq!(file_name_hash(b"src", b"a.c"), sip(b"src/a.c"));
        // Canonicalisation: double slashes and dot components collapse.
        assert_eq!(file_name_hash(b"//src//./", b"a.c"), file_name_hash(b"/src", b"a.c"));
        assert_eq!(file_name_hash(b"/src/sub/..", b"a.c"), file_name_hash(b"/src", b"a.c"));
    }

    fn line_program(version: u16, dirs: &[&[u8]], files: &[(&[u8], u64)]) -> Vec<u8> {
        let mut rest = Vec::new();
        rest.push(1); // minimum_instruction_length
        if version >= 4 {
            rest.push(1); // maximum_operations_per_instruction
        }
        rest.push(1); // default_is_stmt
        rest.push(0xfb); // line_base
        rest.push(14); // line_range
        rest.push(1); // opcode_base: no standard opcodes
        for d in dirs {
            rest.extend_from_slice(d);
            rest.push(0);
        }
        rest.push(0);
        for (f, dir) in files {
            rest.extend_from_slice(f);
            rest.push(0);
            rest.extend_from_slice(&uleb(*dir));
            rest.push(0); // mtime
            rest.push(0); // size
        }
        rest.push(0);
        let mut body = Vec::new();
        body.extend_from_slice(&version.to_le_bytes());
        body.extend_from_slice(&(rest.len() as u32).to_le_bytes()); // header_length
        body.extend_from_slice(&rest);
        let mut out = Vec::new();
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn file_name_table() {
        let data = line_program(2, &[b"/src", b"/inc"], &[(b"a.c", 1), (b"b.h", 2), (b"abs.c", 0)]);
        let table = read_file_name_table(&data, 0, false).unwrap();
        assert_eq!(table.hashes.len(), 3);
        assert_eq!(table.hashes[0], file_name_hash(b"/src", b"a.c"));
        assert_eq!(table.hashes[1], file_name_hash(b"/inc", b"b.h"));
        assert_eq!(table.hashes[2], sip(b"abs.c"));

        // DWARF 4 header has the extra maximum_operations_per_instruction byte.
        let data = line_program(4, &[b"/src"], &[(b"a.c", 1)]);
        let table = read_file_name_table(&data, 0, false).unwrap();
        assert_eq!(table.hashes[0], file_name_hash(b"/src", b"a.c"));

        // Out-of-range directory index.
        let data = line_program(2, &[b"/src"], &[(b"a.c", 2)]);
        assert!(read_file_name_table(&data, 0, false).unwrap_err().is_dwarf_format());

        // Unknown version.
        let data = line_program(5, &[], &[]);
        assert!(read_file_name_table(&data, 0, false).unwrap_err().is_dwarf_format());
    }
}
