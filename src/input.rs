//! Input files and sections as handed over by the file reader and the
//! resolver. Relocations are exposed in RELA shape: for REL targets
//! (ARM32) the reader has already extracted the implicit addend from the
//! instruction bytes, e.g. the usual -8 of an ARM branch.

use std::sync::atomic::AtomicU32;

use elf::abi::{SHF_ALLOC, SHF_EXECINSTR};

#[derive(Clone, Copy, Debug)]
pub struct Reloc {
    pub r_offset: u64,
    pub r_type: u32,
    pub r_sym: u32,
    pub r_addend: i64,
}

/// Routing decision for one call site: which thunk of the owning output
/// section to branch to, and which symbol slot inside it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeExtnRef {
    pub thunk_idx: i32,
    pub sym_idx: i32,
}

impl RangeExtnRef {
    pub const NONE: RangeExtnRef = RangeExtnRef {
        thunk_idx: -1,
        sym_idx: -1,
    };

    #[inline]
    pub fn is_none(self) -> bool {
        self.thunk_idx < 0
    }
}

#[derive(Default)]
pub struct SectionExtra {
    /// Parallel to the relocation list; `NONE` where no thunk is needed.
    pub range_extn: Vec<RangeExtnRef>,
}

pub struct InputSection {
    pub name: Box<str>,
    /// Working copy of the section contents, patched in place by the
    /// applier. Each section owns its bytes, so the apply phase runs in
    /// parallel with no locking.
    pub bytes: Vec<u8>,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addralign: u64,
    pub relocs: Vec<Reloc>,
    /// Owning output section and the byte offset inside it.
    pub output_section: usize,
    pub offset: u64,
    /// Index of this section's first entry inside the file's slice of the
    /// dynamic relocation stream. The scanner stamps the pre-increment
    /// value of the file counter; the allocator walk re-bases it at the
    /// section's input-order prefix sum so the stream layout is stable.
    pub reldyn_offset: u32,
    pub num_dynrel: u32,
    pub extra: SectionExtra,
}

impl InputSection {
    pub fn new(name: impl Into<Box<str>>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
            sh_type: elf::abi::SHT_PROGBITS,
            sh_flags: (SHF_ALLOC | SHF_EXECINSTR) as u64,
            sh_addralign: 4,
            relocs: Vec::new(),
            output_section: 0,
            offset: 0,
            reldyn_offset: 0,
            num_dynrel: 0,
            extra: SectionExtra::default(),
        }
    }

    #[inline]
    pub fn is_alloc(&self) -> bool {
        self.sh_flags & SHF_ALLOC as u64 != 0
    }
}

pub struct InputFile {
    pub name: Box<str>,
    pub sections: Vec<InputSection>,
    /// Maps the file-local `r_sym` index to the link-wide symbol id
    /// produced by the resolver.
    pub symbols: Vec<usize>,
    /// Dynamic relocations this file's sections will emit. Sections of the
    /// same file may scan concurrently, so the counter is atomic.
    pub num_dynrel: AtomicU32,
    /// This file's slice of the dynamic relocation stream, assigned in
    /// input order once scanning is done.
    pub reldyn_offset: u32,
}

impl InputFile {
    pub fn new(name: impl Into<Box<str>>) -> Self {
        Self {
            name: name.into(),
            sections: Vec::new(),
            symbols: Vec::new(),
            num_dynrel: AtomicU32::new(0),
            reldyn_offset: 0,
        }
    }
}
