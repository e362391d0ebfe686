#![allow(dead_code)]

// This is only needed on the 'use gimli::*' statements (for constants like DW_AT_name), but it doesn't work there.
#![allow(non_upper_case_globals)]

pub mod error;
pub mod log;
pub mod util;
pub mod elf;
pub mod dwarf;
pub mod index;
