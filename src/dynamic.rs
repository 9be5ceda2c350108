//! The dynamic-machinery allocator: GOT, GOT-PLT, PLT, PLT-GOT, TLS
//! descriptor and copy-relocation tables, plus the dynamic relocation
//! stream they feed. Slot indices are handed out by a single-threaded
//! walk after scanning, so they are stable and at most one per symbol per
//! table.

use std::sync::atomic::Ordering;

use crate::arch::{with_arch, Arch, Machine};
use crate::context::{Context, LinkView};
use crate::opts::LinkOptions;
use crate::symbol::{Needs, Symbol};
use crate::utils;

/// One entry of the output dynamic relocation stream. `r_sym` is the
/// link-wide symbol id; mapping it to a dynsym index is the output
/// writer's concern.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DynReloc {
    pub offset: u64,
    pub r_type: u32,
    pub r_sym: u32,
    pub addend: i64,
}

impl DynReloc {
    pub const NONE: DynReloc = DynReloc {
        offset: 0,
        r_type: 0,
        r_sym: 0,
        addend: 0,
    };
}

pub struct GotSection {
    pub sh_addr: u64,
    pub got_syms: Vec<usize>,
    pub tlsgd_syms: Vec<usize>,
    pub gottp_syms: Vec<usize>,
    pub tlsdesc_syms: Vec<usize>,
    pub tlsld_idx: i32,
    next_idx: u32,
}

impl Default for GotSection {
    fn default() -> Self {
        Self::new()
    }
}

impl GotSection {
    pub fn new() -> Self {
        Self {
            sh_addr: 0,
            got_syms: Vec::new(),
            tlsgd_syms: Vec::new(),
            gottp_syms: Vec::new(),
            tlsdesc_syms: Vec::new(),
            tlsld_idx: -1,
            next_idx: 0,
        }
    }

    fn alloc(&mut self, slots: u32) -> i32 {
        let idx = self.next_idx as i32;
        self.next_idx += slots;
        idx
    }

    pub fn add_got(&mut self, sym: &mut Symbol, id: usize) {
        if sym.got_idx < 0 {
            sym.got_idx = self.alloc(1);
            self.got_syms.push(id);
        }
    }

    pub fn add_tlsgd(&mut self, sym: &mut Symbol, id: usize) {
        if sym.tlsgd_idx < 0 {
            sym.tlsgd_idx = self.alloc(2);
            self.tlsgd_syms.push(id);
        }
    }

    pub fn add_gottp(&mut self, sym: &mut Symbol, id: usize) {
        if sym.gottp_idx < 0 {
            sym.gottp_idx = self.alloc(1);
            self.gottp_syms.push(id);
        }
    }

    pub fn add_tlsdesc(&mut self, sym: &mut Symbol, id: usize) {
        if sym.tlsdesc_idx < 0 {
            sym.tlsdesc_idx = self.alloc(2);
            self.tlsdesc_syms.push(id);
        }
    }

    pub fn add_tlsld(&mut self) {
        if self.tlsld_idx < 0 {
            self.tlsld_idx = self.alloc(2);
        }
    }

    #[inline]
    pub fn num_slots(&self) -> u64 {
        self.next_idx as u64
    }

    pub fn size_bytes(&self, word: u64) -> u64 {
        self.num_slots() * word
    }
}

pub struct GotPltSection {
    pub sh_addr: u64,
    /// ABI-reserved prefix slots (`_DYNAMIC`, resolver scratch).
    pub reserved: u64,
}

impl GotPltSection {
    pub fn new(reserved: u64) -> Self {
        Self {
            sh_addr: 0,
            reserved,
        }
    }
}

#[derive(Default)]
pub struct PltSection {
    pub sh_addr: u64,
    pub syms: Vec<usize>,
}

impl PltSection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sym: &mut Symbol, id: usize) {
        if sym.plt_idx < 0 {
            sym.plt_idx = self.syms.len() as i32;
            self.syms.push(id);
        }
    }

    pub fn size_bytes(&self, machine: Machine) -> u64 {
        machine.plt_hdr_size() + self.syms.len() as u64 * machine.plt_entry_size()
    }
}

/// Non-lazy PLT entries for symbols that already own a GOT slot; they load
/// straight from the GOT instead of going through the lazy stub.
#[derive(Default)]
pub struct PltGotSection {
    pub sh_addr: u64,
    pub syms: Vec<usize>,
}

impl PltGotSection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sym: &mut Symbol, id: usize) {
        if sym.pltgot_idx < 0 {
            sym.pltgot_idx = self.syms.len() as i32;
            self.syms.push(id);
        }
    }

    pub fn size_bytes(&self, machine: Machine) -> u64 {
        self.syms.len() as u64 * machine.pltgot_entry_size()
    }
}

#[derive(Default)]
pub struct CopyrelSection {
    pub sh_addr: u64,
    pub syms: Vec<usize>,
    pub size: u64,
}

impl CopyrelSection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sym: &mut Symbol, id: usize) {
        if sym.copyrel_offset < 0 {
            let align = 16;
            self.size = utils::align_to(self.size, align);
            sym.copyrel_offset = self.size as i64;
            self.size += sym.esym.st_size.max(1);
            self.syms.push(id);
        }
    }
}

/// The append-only dynamic relocation stream. The head holds the entries
/// produced with the synthetic tables (GOT, GOT-PLT, copy relocations);
/// behind it every input file owns a pre-reserved slice its sections fill
/// at known offsets, so parallel writers never contend.
#[derive(Default)]
pub struct RelDynSection {
    pub sh_addr: u64,
    pub entries: Vec<DynReloc>,
    pub head_len: usize,
}

impl RelDynSection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize in the target's native dynamic relocation shape:
    /// `Elf32_Rel` for ARM32 (addends live in the patched bytes),
    /// `Elf64_Rela` for PPC64.
    pub fn to_bytes(&self, machine: Machine) -> Vec<u8> {
        let mut out = Vec::new();
        for rel in &self.entries {
            if machine.word_size() == 4 {
                let mut buf = [0u8; 8];
                utils::write_u32(&mut buf[0..4], rel.offset as u32);
                utils::write_u32(&mut buf[4..8], (rel.r_sym << 8) | (rel.r_type & 0xff));
                out.extend_from_slice(&buf);
            } else {
                let mut buf = [0u8; 24];
                utils::write_u64(&mut buf[0..8], rel.offset);
                utils::write_u64(&mut buf[8..16], ((rel.r_sym as u64) << 32) | rel.r_type as u64);
                utils::write_u64(&mut buf[16..24], rel.addend as u64);
                out.extend_from_slice(&buf);
            }
        }
        out
    }
}

/// Post-scan walk over all symbols whose flag word is non-empty,
/// assigning monotonically increasing table indices. Runs single-threaded
/// so the assignment is deterministic for a given symbol order.
pub fn assign_indices(ctx: &mut Context) {
    for id in 0..ctx.symbols.len() {
        let flags = ctx.symbols[id].flags();
        if flags.is_empty() {
            continue;
        }
        if flags.contains(Needs::GOT) {
            ctx.got.add_got(&mut ctx.symbols[id], id);
        }
        if flags.contains(Needs::PLT) {
            if ctx.symbols[id].has_got() {
                ctx.pltgot.add(&mut ctx.symbols[id], id);
            } else {
                ctx.plt.add(&mut ctx.symbols[id], id);
            }
        }
        if flags.contains(Needs::TLSGD) {
            ctx.got.add_tlsgd(&mut ctx.symbols[id], id);
        }
        if flags.contains(Needs::GOTTP) {
            ctx.got.add_gottp(&mut ctx.symbols[id], id);
        }
        if flags.contains(Needs::TLSDESC) {
            ctx.got.add_tlsdesc(&mut ctx.symbols[id], id);
        }
        if flags.contains(Needs::COPYREL) {
            ctx.copyrel.add(&mut ctx.symbols[id], id);
        }
    }
    if ctx.needs_tlsld.load(Ordering::Relaxed) {
        ctx.got.add_tlsld();
    }
    log::debug!(
        "allocated {} got, {} plt, {} pltgot, {} copyrel slots",
        ctx.got.num_slots(),
        ctx.plt.syms.len(),
        ctx.pltgot.syms.len(),
        ctx.copyrel.syms.len(),
    );
}

/// Byte images of the synthetic sections a link produces.
pub struct SyntheticImages {
    pub got: Vec<u8>,
    pub gotplt: Vec<u8>,
    pub plt: Vec<u8>,
    pub pltgot: Vec<u8>,
}

fn write_word<A: Arch>(image: &mut [u8], slot: i32, val: u64) {
    let off = slot as usize * A::WORD_SIZE as usize;
    if A::WORD_SIZE == 4 {
        utils::write_u32(&mut image[off..off + 4], val as u32);
    } else {
        utils::write_u64(&mut image[off..off + 8], val);
    }
}

fn write_got_image<A: Arch>(view: &LinkView, rels: &mut Vec<DynReloc>) -> Vec<u8> {
    let word = A::WORD_SIZE;
    let mut image = vec![0u8; (view.got.num_slots() * word) as usize];
    let pic = view.opts.output_kind.is_pic();
    let shared = view.opts.output_kind.is_shared();

    for &id in &view.got.got_syms {
        let sym = view.sym(id);
        let slot = sym.got_idx;
        let slot_addr = view.got_addr(id);
        if sym.is_ifunc {
            rels.push(DynReloc {
                offset: slot_addr,
                r_type: A::R_IRELATIVE,
                r_sym: 0,
                addend: sym.value as i64,
            });
        } else if sym.is_imported {
            rels.push(DynReloc {
                offset: slot_addr,
                r_type: A::R_GLOB_DAT,
                r_sym: id as u32,
                addend: 0,
            });
        } else if pic {
            let val = view.sym_addr(id);
            rels.push(DynReloc {
                offset: slot_addr,
                r_type: A::R_RELATIVE,
                r_sym: 0,
                addend: val as i64,
            });
            write_word::<A>(&mut image, slot, val);
        } else {
            write_word::<A>(&mut image, slot, view.sym_addr(id));
        }
    }

    for &id in &view.got.tlsgd_syms {
        let sym = view.sym(id);
        let slot = sym.tlsgd_idx;
        let slot_addr = view.tlsgd_addr(id);
        if sym.is_imported {
            rels.push(DynReloc {
                offset: slot_addr,
                r_type: A::R_DTPMOD,
                r_sym: id as u32,
                addend: 0,
            });
            rels.push(DynReloc {
                offset: slot_addr + word,
                r_type: A::R_DTPOFF,
                r_sym: id as u32,
                addend: 0,
            });
        } else {
            let off = sym.value.wrapping_sub(view.tls_begin).wrapping_sub(A::TLS_DTV_OFFSET);
            if shared {
                // Module id is only known at load time for a shared object.
                rels.push(DynReloc {
                    offset: slot_addr,
                    r_type: A::R_DTPMOD,
                    r_sym: 0,
                    addend: 0,
                });
            } else {
                write_word::<A>(&mut image, slot, 1);
            }
            write_word::<A>(&mut image, slot + 1, off);
        }
    }

    if view.got.tlsld_idx >= 0 {
        let slot = view.got.tlsld_idx;
        if shared {
            rels.push(DynReloc {
                offset: view.tlsld_addr(),
                r_type: A::R_DTPMOD,
                r_sym: 0,
                addend: 0,
            });
        } else {
            write_word::<A>(&mut image, slot, 1);
        }
    }

    for &id in &view.got.gottp_syms {
        let sym = view.sym(id);
        let slot = sym.gottp_idx;
        let slot_addr = view.gottp_addr(id);
        if sym.is_imported {
            rels.push(DynReloc {
                offset: slot_addr,
                r_type: A::R_TPOFF,
                r_sym: id as u32,
                addend: 0,
            });
        } else if shared {
            rels.push(DynReloc {
                offset: slot_addr,
                r_type: A::R_TPOFF,
                r_sym: 0,
                addend: sym.value.wrapping_sub(view.tls_begin) as i64,
            });
        } else {
            write_word::<A>(&mut image, slot, sym.value.wrapping_sub(view.tp_addr));
        }
    }

    for &id in &view.got.tlsdesc_syms {
        rels.push(DynReloc {
            offset: view.tlsdesc_addr(id),
            r_type: A::R_TLSDESC,
            r_sym: id as u32,
            addend: 0,
        });
    }

    image
}

fn write_gotplt_image<A: Arch>(view: &LinkView, rels: &mut Vec<DynReloc>) -> Vec<u8> {
    let word = A::WORD_SIZE;
    let n = view.gotplt.reserved + view.plt.syms.len() as u64;
    let mut image = vec![0u8; (n * word) as usize];
    // Entries initially point back at the PLT header so the first call
    // falls into the lazy resolver.
    for (i, &id) in view.plt.syms.iter().enumerate() {
        let slot = (view.gotplt.reserved + i as u64) as i32;
        write_word::<A>(&mut image, slot, view.plt.sh_addr);
        rels.push(DynReloc {
            offset: view.gotplt.sh_addr + (view.gotplt.reserved + i as u64) * word,
            r_type: A::R_JUMP_SLOT,
            r_sym: id as u32,
            addend: 0,
        });
    }
    image
}

fn write_plt_image<A: Arch>(view: &LinkView) -> Vec<u8> {
    if view.plt.syms.is_empty() {
        return Vec::new();
    }
    let mut image = vec![0u8; view.plt.size_bytes(view.machine) as usize];
    A::write_plt_header(view, &mut image[..A::PLT_HDR_SIZE as usize]);
    for (i, &id) in view.plt.syms.iter().enumerate() {
        let off = (A::PLT_HDR_SIZE + i as u64 * A::PLT_ENTRY_SIZE) as usize;
        A::write_plt_entry(view, &mut image[off..off + A::PLT_ENTRY_SIZE as usize], id);
    }
    image
}

fn write_pltgot_image<A: Arch>(view: &LinkView) -> Vec<u8> {
    let mut image = vec![0u8; view.pltgot.size_bytes(view.machine) as usize];
    for (i, &id) in view.pltgot.syms.iter().enumerate() {
        let off = (i as u64 * A::PLTGOT_ENTRY_SIZE) as usize;
        A::write_pltgot_entry(view, &mut image[off..off + A::PLTGOT_ENTRY_SIZE as usize], id);
    }
    image
}

fn emit_synthetic_inner<A: Arch>(ctx: &mut Context) -> SyntheticImages {
    let mut rels = Vec::new();
    {
        let view = ctx.view();
        for &id in &view.copyrel.syms {
            let sym = view.sym(id);
            rels.push(DynReloc {
                offset: view.copyrel.sh_addr + sym.copyrel_offset as u64,
                r_type: A::R_COPY,
                r_sym: id as u32,
                addend: 0,
            });
        }
    }
    let view = ctx.view();
    let got = write_got_image::<A>(&view, &mut rels);
    let gotplt = write_gotplt_image::<A>(&view, &mut rels);
    let plt = write_plt_image::<A>(&view);
    let pltgot = write_pltgot_image::<A>(&view);

    let head_len = rels.len();
    ctx.reldyn.entries = rels;
    ctx.reldyn.head_len = head_len;

    // Reserve every file's slice of the stream in input order, behind the
    // head produced above. Scan-time reservations within a file depend on
    // which section's pre-increment won; this single-threaded walk
    // re-bases each section at its input-order prefix sum, so the same
    // inputs always produce the same stream layout.
    let mut total = head_len;
    for file in &mut ctx.files {
        file.reldyn_offset = (total - head_len) as u32;
        let mut cursor = 0u32;
        for isec in &mut file.sections {
            isec.reldyn_offset = cursor;
            cursor += isec.num_dynrel;
        }
        debug_assert_eq!(cursor, file.num_dynrel.load(Ordering::Relaxed));
        total += cursor as usize;
    }
    ctx.reldyn.entries.resize(total, DynReloc::NONE);
    SyntheticImages {
        got,
        gotplt,
        plt,
        pltgot,
    }
}

/// Emit the byte images of the synthetic tables and the head of the
/// dynamic relocation stream. Layout addresses for the tables must be set
/// before calling; the applier fills the per-file tail of the stream.
pub fn emit_synthetic_sections(ctx: &mut Context) -> SyntheticImages {
    with_arch!(ctx.machine, emit_synthetic_inner, ctx)
}

/// Is the symbol visible in the dynamic symbol table of this output?
/// Shared objects export by default; executables only under
/// `--export-dynamic`.
pub fn is_exported(opts: &LinkOptions, sym: &Symbol) -> bool {
    if sym.is_undefined() || sym.is_local() {
        return false;
    }
    if sym.esym.visibility() != elf::abi::STV_DEFAULT {
        return false;
    }
    opts.output_kind.is_shared() || opts.export_dynamic
}

/// `--as-needed` drops a `DT_NEEDED` entry for a shared library no symbol
/// was actually resolved against.
pub fn keep_dt_needed(opts: &LinkOptions, referenced: bool) -> bool {
    referenced || !opts.as_needed
}
