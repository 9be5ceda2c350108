//! The symbol model: interned names, resolution state filled in by the
//! resolver, needs-flags set concurrently by the relocation scanner and
//! table indices assigned by the single-threaded allocator walk.

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use elf::abi::{STB_LOCAL, STB_WEAK, STT_FUNC, STT_GNU_IFUNC};
use hashbrown::HashMap;

use crate::{reserved_encoding_error, Result};

bitflags! {
    /// What dynamic machinery a symbol needs, as discovered by the scanner.
    /// Updates are a bitwise OR, so any scan order yields the same set.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct Needs: u32 {
        const GOT     = 1 << 0;
        const PLT     = 1 << 1;
        const GOTPLT  = 1 << 2;
        const COPYREL = 1 << 3;
        const TLSGD   = 1 << 4;
        const TLSLD   = 1 << 5;
        const GOTTP   = 1 << 6;
        const TLSDESC = 1 << 7;
    }
}

/// Raw fields of the ELF symbol-table entry a symbol came from. Target
/// specific bits live here too: PPC64 keeps the local-entry encoding in
/// the upper three bits of `st_other`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ElfSym {
    pub st_type: u8,
    pub st_bind: u8,
    pub st_other: u8,
    pub st_size: u64,
}

impl ElfSym {
    #[inline]
    pub fn ppc_local_entry(&self) -> u8 {
        self.st_other >> 5
    }

    #[inline]
    pub fn visibility(&self) -> u8 {
        self.st_other & 3
    }
}

pub struct Symbol {
    pub name: Box<str>,
    /// Owning input file after resolution; `None` while undefined.
    pub file: Option<usize>,
    /// Resolved virtual address, valid once layout has run.
    pub value: u64,
    pub esym: ElfSym,
    pub is_imported: bool,
    pub is_ifunc: bool,
    /// SHN_ABS definition; never gets a base-relative dynamic relocation.
    pub is_absolute: bool,
    /// ARM32: the definition is Thumb code, so its address carries bit 0.
    pub is_thumb: bool,
    /// The definition lives in a merged-out or discarded fragment; debug
    /// references to it are replaced with a tombstone.
    pub discarded: bool,
    flags: AtomicU32,
    pub got_idx: i32,
    pub plt_idx: i32,
    pub pltgot_idx: i32,
    pub tlsgd_idx: i32,
    pub gottp_idx: i32,
    pub tlsdesc_idx: i32,
    pub copyrel_offset: i64,
}

impl Symbol {
    pub fn new(name: impl Into<Box<str>>) -> Self {
        Self {
            name: name.into(),
            file: None,
            value: 0,
            esym: ElfSym::default(),
            is_imported: false,
            is_ifunc: false,
            is_absolute: false,
            is_thumb: false,
            discarded: false,
            flags: AtomicU32::new(0),
            got_idx: -1,
            plt_idx: -1,
            pltgot_idx: -1,
            tlsgd_idx: -1,
            gottp_idx: -1,
            tlsdesc_idx: -1,
            copyrel_offset: -1,
        }
    }

    #[inline]
    pub fn flags(&self) -> Needs {
        Needs::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    /// Idempotent flag union; safe to call from concurrent scan tasks.
    #[inline]
    pub fn add_flags(&self, needs: Needs) {
        self.flags.fetch_or(needs.bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        self.esym.st_bind == STB_LOCAL
    }

    #[inline]
    pub fn is_weak(&self) -> bool {
        self.esym.st_bind == STB_WEAK
    }

    #[inline]
    pub fn is_func(&self) -> bool {
        self.esym.st_type == STT_FUNC || self.esym.st_type == STT_GNU_IFUNC
    }

    #[inline]
    pub fn is_undefined(&self) -> bool {
        self.file.is_none()
    }

    /// Still undefined-weak after resolution: calls against it are
    /// rewritten to a NOP instead of being routed to a PLT or thunk.
    #[inline]
    pub fn is_remaining_undef_weak(&self) -> bool {
        self.file.is_none() && self.is_weak()
    }

    #[inline]
    pub fn has_got(&self) -> bool {
        self.got_idx >= 0
    }

    #[inline]
    pub fn has_plt(&self) -> bool {
        self.plt_idx >= 0 || self.pltgot_idx >= 0
    }

    #[inline]
    pub fn has_tlsgd(&self) -> bool {
        self.tlsgd_idx >= 0
    }

    #[inline]
    pub fn has_gottp(&self) -> bool {
        self.gottp_idx >= 0
    }

    #[inline]
    pub fn has_tlsdesc(&self) -> bool {
        self.tlsdesc_idx >= 0
    }

    /// PPC64 ELFv2 local-entry distance encoded in `st_other`. Value 7 is
    /// reserved by the ABI.
    pub fn ppc_local_entry_offset(&self) -> Result<u64> {
        match self.esym.ppc_local_entry() {
            0 | 1 => Ok(0),
            7 => Err(reserved_encoding_error(
                &self.name,
                "local entry offset 7 is reserved",
            )),
            v => Ok(1 << v),
        }
    }
}

/// Global symbols are interned by name so every reference across input
/// files lands on one `Symbol` record.
#[derive(Default)]
pub struct SymbolInterner {
    map: HashMap<Box<str>, usize>,
}

impl SymbolInterner {
    pub fn get(&self, name: &str) -> Option<usize> {
        self.map.get(name).copied()
    }

    pub fn insert(&mut self, name: &str, id: usize) {
        self.map.insert(name.into(), id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_union_is_idempotent() {
        let sym = Symbol::new("f");
        sym.add_flags(Needs::GOT);
        sym.add_flags(Needs::PLT);
        sym.add_flags(Needs::GOT);
        assert_eq!(sym.flags(), Needs::GOT | Needs::PLT);
    }

    #[test]
    fn ppc_local_entry_decoding() {
        let mut sym = Symbol::new("f");
        sym.esym.st_other = 0;
        assert_eq!(sym.ppc_local_entry_offset().unwrap(), 0);
        sym.esym.st_other = 3 << 5;
        assert_eq!(sym.ppc_local_entry_offset().unwrap(), 8);
        sym.esym.st_other = 7 << 5;
        assert!(sym.ppc_local_entry_offset().is_err());
    }
}
