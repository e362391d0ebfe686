use crate::{*, error::*, util::*};
use memmap2::{MmapMut, MmapOptions};
use std::{fs::File, io::Read, sync::OnceLock, collections::HashMap, mem};

pub const SHT_RELA: u32 = 0x4;
pub const SHT_NOBITS: u32 = 0x8;

pub const SHF_GROUP: u64 = 1 << 9;
pub const SHF_COMPRESSED: u64 = 1 << 11;

pub const ELFCOMPRESS_ZLIB: u32 = 1;

pub const R_X86_64_NONE: u32 = 0;
pub const R_X86_64_64: u32 = 1;
pub const R_X86_64_32: u32 = 10;

pub const SYM_ENTRY_SIZE: usize = mem::size_of::<libc::Elf64_Sym>();
pub const RELA_ENTRY_SIZE: usize = mem::size_of::<libc::Elf64_Rela>();

#[derive(Debug)]
pub struct ElfSection {
    pub idx: usize,
    pub name: String,

    pub section_type: u32,
    pub flags: u64,

    pub address: usize,
    pub offset: usize,
    pub size: usize,

    pub link: u32,
    pub info: u32,
    pub alignment: usize, // if SHF_COMPRESSED is set this is alignment in compressed, not decompressed data
    pub entry_size: usize,

    pub name_offset_in_strtab: u32,

    // If flags has SHF_COMPRESSED.
    pub compression_header: Option<ElfCompressionHeader>,
    pub decompressed_data: OnceLock<Result<Vec<u8>>>,
}

#[derive(Clone, Copy, Debug)]
pub struct ElfCompressionHeader {
    pub ch_type: u32,
    pub ch_size: u64,
    pub ch_addralign: u64,
}

#[derive(Debug)]
pub struct ElfFile {
    pub name: String, // just for logging

    pub sections: Vec<ElfSection>,
    pub section_by_name: HashMap<String, usize>,

    // Other byte order than the host's.
    pub bswap: bool,

    // The mapping is copy-on-write so that relocations can be patched into section bytes
    // without touching the file.
    mmapped: Option<MmapMut>,
    owned: Vec<u8>,
    data: &'static [u8],
}

impl ElfSection {
    pub fn size_in_file(&self) -> usize {
        if self.section_type == SHT_NOBITS {
            0
        } else {
            self.size
        }
    }
}

impl ElfFile {
    pub fn data(&self) -> &[u8] {
        self.data
    }

    pub fn open(name: String, file: &File) -> Result<ElfFile> {
        let mmapped = unsafe {MmapOptions::new().map_copy(file)}
            .map_err(|e| Error::from_io_error(e, format!("mmap {}", name)))?;
        parse_elf(name, Some(mmapped), Vec::new())
    }

    pub fn from_contents(name: String, contents: Vec<u8>) -> Result<ElfFile> {
        parse_elf(name, None, contents)
    }

    // The returned reference points either into the mapping or into the section's decompressed_data.
    pub fn section_data(&self, idx: usize) -> Result<&[u8]> {
        let section = &self.sections[idx];
        Ok(match &section.compression_header {
            Some(header) => {
                &self.decompress_section(section, header).as_ref_clone_error()?[..]
            }
            None => &self.data[section.offset..section.offset + section.size_in_file()],
        })
    }

    pub fn section_data_by_name(&self, name: &str) -> Option<&[u8]> {
        match self.section_by_name.get(name) {
            Some(&idx) if self.sections[idx].section_type != SHT_NOBITS => self.section_data(idx).ok(),
            _ => None,
        }
    }

    fn decompress_section<'a>(&'a self, section: &'a ElfSection, header: &ElfCompressionHeader) -> &'a Result<Vec<u8>> {
        section.decompressed_data.get_or_init(|| {
            let chdr_size = 24; // Elf64_Chdr
            let compressed = &self.data[section.offset..section.offset + section.size_in_file()];
            if compressed.len() < chdr_size {
                return err!(ElfFormat, "compressed section {} shorter than its header", section.name);
            }
            let compressed = &compressed[chdr_size..];
            if header.ch_type != ELFCOMPRESS_ZLIB {
                return err!(ElfFormat, "ELF compression {} not supported", header.ch_type);
            }
            let mut decompressed = vec![0u8; header.ch_size as usize];
            let mut decoder = flate2::read::ZlibDecoder::new(compressed);
            decoder.read_exact(&mut decompressed)
                .map_err(|e| Error::from_io_error(e, format!("decompressing {}", section.name)))?;
            Ok(decompressed)
        })
    }
}

fn parse_elf(name: String, mmapped: Option<MmapMut>, owned: Vec<u8>) -> Result<ElfFile> {
    let data: &'static [u8] = unsafe {
        match &mmapped {
            Some(m) => mem::transmute(&m[..]),
            None => mem::transmute(&owned[..]),
        }
    };

    if data.len() < 16 || &data[..4] != b"\x7fELF" {
        return err!(NotElf, "invalid ELF magic bytes in {}: {}", name, hexdump(data, 4));
    }

    if data[4] == 1 { return err!(ElfFormat, "32-bit ELF files are not supported"); }
    if data[4] != 2 { return err!(ElfFormat, "invalid EI_CLASS: {}", data[4]); }

    if data[5] != 1 && data[5] != 2 { return err!(ElfFormat, "invalid EI_DATA: {}", data[5]); }
    let host_ei_data: u8 = if cfg!(target_endian = "little") {1} else {2};
    let bswap = data[5] != host_ei_data;

    if data[6] != 1 { return err!(ElfFormat, "invalid EI_VERSION: {}", data[6]); }

    let mut r = Reader::with_range(data, 16, data.len(), bswap)
        .map_err(|_| error!(ElfFormat, "ELF header is truncated in {}", name))?;
    let _e_type = r.read_u16()?;
    let _e_machine = r.read_u16()?;
    let e_version = r.read_u32()?;
    if e_version != 1 { return err!(ElfFormat, "invalid e_version: {}", e_version); }
    let _e_entry = r.read_u64()?;
    let _e_phoff = r.read_u64()?;
    let e_shoff = r.read_u64()? as usize;
    let _e_flags = r.read_u32()?;
    let _e_ehsize = r.read_u16()?;
    let _e_phentsize = r.read_u16()?;
    let _e_phnum = r.read_u16()?;
    let e_shentsize = r.read_u16()? as usize;
    let e_shnum = r.read_u16()? as usize;
    let e_shstrndx = r.read_u16()? as usize;

    if e_shnum > 0 && e_shentsize < 64 { return err!(ElfFormat, "ELF e_shentsize too small in {}", name); }
    if e_shnum.saturating_mul(e_shentsize).saturating_add(e_shoff) > data.len() {
        return err!(ElfFormat, "ELF section header table out of bounds in {}", name);
    }

    let mut sections: Vec<ElfSection> = Vec::new();
    for idx in 0..e_shnum {
        let mut r = Reader::with_range(data, e_shoff + idx * e_shentsize, data.len(), bswap)?;
        let sh_name = r.read_u32()?;
        let sh_type = r.read_u32()?;
        let sh_flags = r.read_u64()?;
        let sh_addr = r.read_u64()? as usize;
        let sh_offset = r.read_u64()? as usize;
        let sh_size = r.read_u64()? as usize;
        let sh_link = r.read_u32()?;
        let sh_info = r.read_u32()?;
        let sh_addralign = r.read_u64()? as usize;
        let sh_entsize = r.read_u64()? as usize;

        if sh_type != SHT_NOBITS && sh_offset.saturating_add(sh_size) > data.len() {
            return err!(ElfFormat, "ELF section {} out of bounds: {} + {} > {} in {}", idx, sh_offset, sh_size, data.len(), name);
        }

        let mut section = ElfSection {
            idx, name: String::new(), name_offset_in_strtab: sh_name, section_type: sh_type, flags: sh_flags,
            address: sh_addr, offset: sh_offset, size: sh_size, link: sh_link, info: sh_info,
            alignment: sh_addralign, entry_size: sh_entsize, compression_header: None, decompressed_data: OnceLock::new()};

        if sh_flags & SHF_COMPRESSED != 0 && sh_type != SHT_NOBITS {
            let mut r = Reader::with_range(data, sh_offset, sh_offset + sh_size.min(24), bswap)?;
            let ch_type = r.read_u32()?;
            let _ch_reserved = r.read_u32()?;
            let ch_size = r.read_u64()?;
            let ch_addralign = r.read_u64()?;
            section.compression_header = Some(ElfCompressionHeader {ch_type, ch_size, ch_addralign});
        }

        sections.push(section);
    }

    let mut elf = ElfFile {name, sections, section_by_name: HashMap::new(), bswap, mmapped, owned, data};

    if e_shnum > 0 {
        if e_shstrndx >= e_shnum { return err!(ElfFormat, "invalid e_shstrndx: {}", e_shstrndx); }
        let strtab = &elf.sections[e_shstrndx];
        if strtab.section_type == SHT_NOBITS { return err!(ElfFormat, "section name string table has no bytes"); }
        let strtab_range = strtab.offset..strtab.offset + strtab.size;
        for idx in 0..elf.sections.len() {
            let name_offset = elf.sections[idx].name_offset_in_strtab as usize;
            let name = std::str::from_utf8(c_str_at(&data[strtab_range.clone()], name_offset)
                .map_err(|_| error!(ElfFormat, "section name out of bounds in {}", elf.name))?)?.to_string();
            elf.sections[idx].name = name.clone();
            let prev = elf.section_by_name.insert(name, idx);
            if prev.is_some() {
                eprintln!("warning: ELF has duplicate section name: {}", elf.sections[idx].name);
            }
        }
    }

    Ok(elf)
}

// A two-section ELF (a NULL section and .shstrtab), shared by tests across the crate.
#[cfg(test)]
pub fn minimal_elf_bytes() -> Vec<u8> {
    let shstrtab = b"\0.shstrtab\0".to_vec();
    let shoff = 64 + shstrtab.len();
    let mut v = Vec::new();
    v.extend_from_slice(b"\x7fELF\x02\x01\x01\0\0\0\0\0\0\0\0\0");
    v.extend_from_slice(&1u16.to_le_bytes()); // e_type
    v.extend_from_slice(&62u16.to_le_bytes()); // e_machine
    v.extend_from_slice(&1u32.to_le_bytes()); // e_version
    v.extend_from_slice(&[0u8; 24]); // e_entry, e_phoff, e_shoff patched below
    v.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    v.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
    v.extend_from_slice(&0u16.to_le_bytes()); // e_phentsize
    v.extend_from_slice(&0u16.to_le_bytes()); // e_phnum
    v.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
    v.extend_from_slice(&2u16.to_le_bytes()); // e_shnum
    v.extend_from_slice(&1u16.to_le_bytes()); // e_shstrndx
    v[40..48].copy_from_slice(&(shoff as u64).to_le_bytes());
    v.extend_from_slice(&shstrtab);
    v.extend_from_slice(&[0u8; 64]); // NULL section
    let mut shdr = Vec::new();
    shdr.extend_from_slice(&1u32.to_le_bytes()); // sh_name -> ".shstrtab"
    shdr.extend_from_slice(&3u32.to_le_bytes()); // SHT_STRTAB
    shdr.extend_from_slice(&0u64.to_le_bytes());
    shdr.extend_from_slice(&0u64.to_le_bytes());
    shdr.extend_from_slice(&64u64.to_le_bytes()); // sh_offset
    shdr.extend_from_slice(&(shstrtab.len() as u64).to_le_bytes());
    shdr.extend_from_slice(&[0u8; 24]);
    v.extend_from_slice(&shdr);
    v
}
