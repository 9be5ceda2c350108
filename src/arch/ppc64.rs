//! PPC64 ELFv2 ("ppc64le") back-end.
//!
//! PC-relative addressing is mostly unavailable on PPC64, so compiled
//! code assumes r2 holds the TOC pointer, `.got + 0x8000`, and addresses
//! everything TOC-relative. Functions carry two entry points: the global
//! one recomputes r2 from its own address in r12, the local one assumes
//! r2 is already correct; the distance between them is encoded in
//! `st_other`. A cross-module call must therefore load the callee's
//! address into r12 and restore r2 afterwards, which is why every call to
//! a symbol with a PLT entry is routed through a range-extension thunk
//! regardless of reach: the thunk saves r2 into the caller's stack frame
//! and the instruction after the call site reloads it.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::apply::{apply_dyn_absrel, routed_target, DynRelWriter};
use crate::arch::Arch;
use crate::context::LinkView;
use crate::input::{InputSection, Reloc};
use crate::output::OutputSection;
use crate::scan::{reserve_dynrels, ScanCtx, ScanTable, DYN_ABSREL_TABLE};
use crate::symbol::Needs;
use crate::utils::*;
use crate::{
    not_allocated_error, out_of_range_error, undef_error, unknown_reloc_error, Result,
};

pub const R_PPC64_NONE: u32 = 0;
pub const R_PPC64_ADDR32: u32 = 1;
pub const R_PPC64_REL24: u32 = 10;
pub const R_PPC64_COPY: u32 = 19;
pub const R_PPC64_GLOB_DAT: u32 = 20;
pub const R_PPC64_JMP_SLOT: u32 = 21;
pub const R_PPC64_RELATIVE: u32 = 22;
pub const R_PPC64_REL32: u32 = 26;
pub const R_PPC64_PLT16_LO: u32 = 29;
pub const R_PPC64_PLT16_HI: u32 = 30;
pub const R_PPC64_PLT16_HA: u32 = 31;
pub const R_PPC64_ADDR64: u32 = 38;
pub const R_PPC64_REL64: u32 = 44;
pub const R_PPC64_TOC16: u32 = 47;
pub const R_PPC64_TOC16_LO: u32 = 48;
pub const R_PPC64_TOC16_HI: u32 = 49;
pub const R_PPC64_TOC16_HA: u32 = 50;
pub const R_PPC64_TOC16_DS: u32 = 63;
pub const R_PPC64_TOC16_LO_DS: u32 = 64;
pub const R_PPC64_PLT16_LO_DS: u32 = 60;
pub const R_PPC64_TLS: u32 = 67;
pub const R_PPC64_DTPMOD64: u32 = 68;
pub const R_PPC64_TPREL16_HA: u32 = 72;
pub const R_PPC64_TPREL16_LO: u32 = 70;
pub const R_PPC64_TPREL64: u32 = 73;
pub const R_PPC64_DTPREL16_LO: u32 = 75;
pub const R_PPC64_DTPREL16_HA: u32 = 77;
pub const R_PPC64_DTPREL64: u32 = 78;
pub const R_PPC64_GOT_TLSGD16_LO: u32 = 80;
pub const R_PPC64_GOT_TLSGD16_HA: u32 = 82;
pub const R_PPC64_GOT_TLSLD16_LO: u32 = 84;
pub const R_PPC64_GOT_TLSLD16_HA: u32 = 86;
pub const R_PPC64_GOT_TPREL16_LO_DS: u32 = 88;
pub const R_PPC64_GOT_TPREL16_HA: u32 = 90;
pub const R_PPC64_TLSGD: u32 = 107;
pub const R_PPC64_TLSLD: u32 = 108;
pub const R_PPC64_PLTSEQ: u32 = 119;
pub const R_PPC64_PLTCALL: u32 = 120;
pub const R_PPC64_IRELATIVE: u32 = 248;
pub const R_PPC64_REL16_LO: u32 = 250;
pub const R_PPC64_REL16_HA: u32 = 252;

pub const PPC64_NOP: u32 = 0x6000_0000;
/// `ld r2, 24(r1)`: reload the TOC pointer from the caller's save slot.
pub const PPC64_LD_R2_24_R1: u32 = 0xe841_0018;

/// As a special case, no copy relocations or canonical PLTs are created
/// for `.toc` sections. `.toc` is a compiler-generated GOT-like section;
/// no user code takes the address of anything in it.
pub const TOC_TABLE: ScanTable = {
    use crate::scan::ScanAction::*;
    [
        // Absolute  Local    Imported data  Imported code
        [None, Baserel, Dynrel, Dynrel], // Shared object
        [None, Baserel, Dynrel, Dynrel], // Position-independent exec
        [None, None, Dynrel, Dynrel],    // Position-dependent exec
    ]
};

#[inline]
pub fn lo(x: u64) -> u64 {
    x & 0xffff
}

#[inline]
pub fn hi(x: u64) -> u64 {
    x >> 16
}

/// High adjusted: rounds before shifting so that `(ha(x) << 16) + lo(x)`
/// reconstructs `x` when `lo` is interpreted as signed.
#[inline]
pub fn ha(x: u64) -> u64 {
    x.wrapping_add(0x8000) >> 16
}

#[inline]
pub fn high(x: u64) -> u64 {
    (x >> 16) & 0xffff
}

#[inline]
pub fn higha(x: u64) -> u64 {
    (x.wrapping_add(0x8000) >> 16) & 0xffff
}

pub struct Ppc64V2;

fn local_entry_offset(view: &LinkView, sym_id: usize) -> u64 {
    let sym = view.sym(sym_id);
    match sym.ppc_local_entry_offset() {
        Ok(off) => off,
        Err(err) => {
            view.diags.fatal(err);
            0
        }
    }
}

impl Arch for Ppc64V2 {
    const E_MACHINE: u16 = elf::abi::EM_PPC64;
    const WORD_SIZE: u64 = 8;
    const GOTPLT_RESERVED: u64 = 2;
    const PLT_HDR_SIZE: u64 = 60;
    const PLT_ENTRY_SIZE: u64 = 4;
    const PLTGOT_ENTRY_SIZE: u64 = 4;
    const THUNK_HDR_SIZE: u64 = 0;
    const THUNK_SIZE: u64 = 20;
    // The I-form branch: ±32 MiB.
    const BRANCH_REACH: i64 = 1 << 25;
    const TLS_DTV_OFFSET: u64 = 0x8000;
    const USES_RELA: bool = true;

    const R_ABS: u32 = R_PPC64_ADDR64;
    const R_RELATIVE: u32 = R_PPC64_RELATIVE;
    const R_GLOB_DAT: u32 = R_PPC64_GLOB_DAT;
    const R_JUMP_SLOT: u32 = R_PPC64_JMP_SLOT;
    const R_COPY: u32 = R_PPC64_COPY;
    const R_DTPMOD: u32 = R_PPC64_DTPMOD64;
    const R_DTPOFF: u32 = R_PPC64_DTPREL64;
    const R_TPOFF: u32 = R_PPC64_TPREL64;
    const R_IRELATIVE: u32 = R_PPC64_IRELATIVE;
    // PPC64 has no TLS descriptors; the scanner never sets the flag.
    const R_TLSDESC: u32 = R_PPC64_NONE;

    fn is_jump_reachable(disp: i64) -> bool {
        sign_extend(disp as u64, 25) == disp
    }

    fn is_call_reloc(r_type: u32) -> bool {
        r_type == R_PPC64_REL24
    }

    fn needs_thunk(view: &LinkView, rel: &Reloc, sym_id: usize, p: u64) -> bool {
        let sym = view.sym(sym_id);
        // Calls into the PLT always transit a thunk: besides reach, the
        // thunk spills r2 so the TOC can be restored after the call.
        if sym.has_plt() {
            return true;
        }
        let target = sym.value.wrapping_add(local_entry_offset(view, sym_id));
        let disp = target.wrapping_add_signed(rel.r_addend).wrapping_sub(p) as i64;
        !Self::is_jump_reachable(disp)
    }

    fn scan_relocations(
        scx: &ScanCtx,
        file_syms: &[usize],
        num_dynrel: &AtomicU32,
        isec: &mut InputSection,
    ) -> Result<()> {
        if !isec.is_alloc() {
            return Err(not_allocated_error(&isec.name));
        }
        let sec_name = isec.name.clone();
        let mut count = 0u32;

        for i in 0..isec.relocs.len() {
            let rel = isec.relocs[i];
            if rel.r_type == R_PPC64_NONE {
                continue;
            }
            let sym_id = file_syms[rel.r_sym as usize];
            let sym = &scx.symbols[sym_id];
            if sym.is_undefined() && !sym.is_weak() {
                scx.diags.error(undef_error(&sym.name, &sec_name));
                continue;
            }
            if sym.is_ifunc {
                sym.add_flags(Needs::GOT | Needs::PLT);
            }
            match rel.r_type {
                R_PPC64_ADDR64 => {
                    let table = if &*sec_name == ".toc" {
                        &TOC_TABLE
                    } else {
                        &DYN_ABSREL_TABLE
                    };
                    count += scx.scan_rel(&sec_name, sym_id, rel.r_type, table);
                }
                R_PPC64_GOT_TPREL16_HA => sym.add_flags(Needs::GOTTP),
                R_PPC64_REL24 => {
                    if sym.is_imported {
                        sym.add_flags(Needs::PLT);
                    }
                }
                R_PPC64_PLT16_HA => sym.add_flags(Needs::GOT),
                R_PPC64_GOT_TLSGD16_HA => sym.add_flags(Needs::TLSGD),
                R_PPC64_GOT_TLSLD16_HA => scx.needs_tlsld.store(true, Ordering::Relaxed),
                R_PPC64_REL64
                | R_PPC64_REL32
                | R_PPC64_TOC16_HA
                | R_PPC64_TOC16_LO
                | R_PPC64_TOC16_LO_DS
                | R_PPC64_TOC16_DS
                | R_PPC64_REL16_HA
                | R_PPC64_REL16_LO
                | R_PPC64_PLT16_HI
                | R_PPC64_PLT16_LO
                | R_PPC64_PLT16_LO_DS
                | R_PPC64_PLTSEQ
                | R_PPC64_PLTCALL
                | R_PPC64_TPREL16_HA
                | R_PPC64_TPREL16_LO
                | R_PPC64_GOT_TPREL16_LO_DS
                | R_PPC64_GOT_TLSGD16_LO
                | R_PPC64_GOT_TLSLD16_LO
                | R_PPC64_TLS
                | R_PPC64_TLSGD
                | R_PPC64_TLSLD
                | R_PPC64_DTPREL16_HA
                | R_PPC64_DTPREL16_LO => {}
                _ => scx.diags.fatal(unknown_reloc_error(&sec_name, rel.r_type)),
            }
        }

        isec.reldyn_offset = reserve_dynrels(num_dynrel, count);
        isec.num_dynrel = count;
        Ok(())
    }

    fn apply_reloc_alloc(
        view: &LinkView,
        file_syms: &[usize],
        isec: &mut InputSection,
        dynrel: &mut DynRelWriter,
    ) {
        let sec_addr = view.isec_addr(isec);
        let sec_name = isec.name.clone();
        let toc = view.toc_addr;
        let got = view.got_base();

        for i in 0..isec.relocs.len() {
            let rel = isec.relocs[i];
            if rel.r_type == R_PPC64_NONE {
                continue;
            }
            let sym_id = file_syms[rel.r_sym as usize];
            let sym = view.sym(sym_id);
            if sym.is_undefined() && !sym.is_weak() {
                continue; // recorded during scan
            }

            let route = routed_target(view, isec, i);
            let s = view.sym_addr(sym_id);
            let a = rel.r_addend;
            let p = sec_addr + rel.r_offset;
            let off = rel.r_offset as usize;

            let check = |val: i64, lo: i64, hi: i64| -> bool {
                if in_range(val, lo, hi) {
                    true
                } else {
                    view.diags.error(out_of_range_error(
                        &sec_name, &sym.name, rel.r_type, val, lo, hi,
                    ));
                    false
                }
            };

            let loc = &mut isec.bytes[off..];
            match rel.r_type {
                R_PPC64_ADDR64 => {
                    let table = if &*sec_name == ".toc" {
                        &TOC_TABLE
                    } else {
                        &DYN_ABSREL_TABLE
                    };
                    apply_dyn_absrel::<Ppc64V2>(view, sym_id, loc, s, a, p, dynrel, table);
                }
                R_PPC64_TOC16_HA => {
                    write_u16(loc, ha(s.wrapping_add_signed(a).wrapping_sub(toc)) as u16);
                }
                R_PPC64_TOC16_LO => {
                    write_u16(loc, s.wrapping_add_signed(a).wrapping_sub(toc) as u16);
                }
                R_PPC64_TOC16_DS | R_PPC64_TOC16_LO_DS => {
                    // DS forms keep the low two opcode bits of the D field.
                    let val = s.wrapping_add_signed(a).wrapping_sub(toc);
                    or_u16(loc, (val & 0xfffc) as u16);
                }
                R_PPC64_REL24 => {
                    if sym.is_remaining_undef_weak() {
                        write_u32(loc, PPC64_NOP);
                        continue;
                    }
                    let mut val = s
                        .wrapping_add(local_entry_offset(view, sym_id))
                        .wrapping_add_signed(a)
                        .wrapping_sub(p) as i64;
                    if sym.has_plt() || sign_extend(val as u64, 25) != val {
                        match route {
                            Some(slot) => {
                                val = slot.wrapping_add_signed(a).wrapping_sub(p) as i64;
                            }
                            None => {
                                check(val, -(1 << 25), 1 << 25);
                                continue;
                            }
                        }
                    }
                    if !check(val, -(1 << 25), 1 << 25) {
                        continue;
                    }
                    or_u32(loc, (bits(val as u64, 25, 2) << 2) as u32);

                    // An external call returns with r2 clobbered. The
                    // compiler leaves a NOP after the BL as a placeholder;
                    // turn it into the TOC reload.
                    if sym.has_plt() && loc.len() >= 8 && read_u32(&loc[4..8]) == PPC64_NOP {
                        write_u32(&mut loc[4..8], PPC64_LD_R2_24_R1);
                    }
                }
                R_PPC64_REL64 => {
                    write_u64(loc, s.wrapping_add_signed(a).wrapping_sub(p));
                }
                R_PPC64_REL32 => {
                    write_u32(loc, s.wrapping_add_signed(a).wrapping_sub(p) as u32);
                }
                R_PPC64_REL16_HA => {
                    write_u16(loc, ha(s.wrapping_add_signed(a).wrapping_sub(p)) as u16);
                }
                R_PPC64_REL16_LO => {
                    write_u16(loc, s.wrapping_add_signed(a).wrapping_sub(p) as u16);
                }
                R_PPC64_PLT16_HA => {
                    let g = view.got_offset(sym_id);
                    write_u16(loc, ha((g + got).wrapping_sub(toc)) as u16);
                }
                R_PPC64_PLT16_HI => {
                    let g = view.got_offset(sym_id);
                    write_u16(loc, hi((g + got).wrapping_sub(toc)) as u16);
                }
                R_PPC64_PLT16_LO => {
                    let g = view.got_offset(sym_id);
                    write_u16(loc, lo((g + got).wrapping_sub(toc)) as u16);
                }
                R_PPC64_PLT16_LO_DS => {
                    let g = view.got_offset(sym_id);
                    or_u16(loc, ((g + got).wrapping_sub(toc) & 0xfffc) as u16);
                }
                R_PPC64_GOT_TPREL16_HA => {
                    write_u16(loc, ha(view.gottp_addr(sym_id).wrapping_sub(toc)) as u16);
                }
                R_PPC64_GOT_TPREL16_LO_DS => {
                    or_u16(loc, (view.gottp_addr(sym_id).wrapping_sub(toc) & 0xfffc) as u16);
                }
                R_PPC64_GOT_TLSGD16_HA => {
                    write_u16(loc, ha(view.tlsgd_addr(sym_id).wrapping_sub(toc)) as u16);
                }
                R_PPC64_GOT_TLSGD16_LO => {
                    write_u16(loc, view.tlsgd_addr(sym_id).wrapping_sub(toc) as u16);
                }
                R_PPC64_GOT_TLSLD16_HA => {
                    write_u16(loc, ha(view.tlsld_addr().wrapping_sub(toc)) as u16);
                }
                R_PPC64_GOT_TLSLD16_LO => {
                    write_u16(loc, view.tlsld_addr().wrapping_sub(toc) as u16);
                }
                R_PPC64_DTPREL16_HA => {
                    let val = s
                        .wrapping_add_signed(a)
                        .wrapping_sub(view.tls_begin)
                        .wrapping_sub(Self::TLS_DTV_OFFSET);
                    write_u16(loc, ha(val) as u16);
                }
                R_PPC64_DTPREL16_LO => {
                    let val = s
                        .wrapping_add_signed(a)
                        .wrapping_sub(view.tls_begin)
                        .wrapping_sub(Self::TLS_DTV_OFFSET);
                    write_u16(loc, val as u16);
                }
                R_PPC64_TPREL16_HA => {
                    write_u16(loc, ha(s.wrapping_add_signed(a).wrapping_sub(view.tp_addr)) as u16);
                }
                R_PPC64_TPREL16_LO => {
                    write_u16(loc, s.wrapping_add_signed(a).wrapping_sub(view.tp_addr) as u16);
                }
                R_PPC64_PLTSEQ | R_PPC64_PLTCALL | R_PPC64_TLS | R_PPC64_TLSGD
                | R_PPC64_TLSLD => {}
                _ => view
                    .diags
                    .fatal(unknown_reloc_error(&sec_name, rel.r_type)),
            }
        }
    }

    fn apply_reloc_nonalloc(view: &LinkView, file_syms: &[usize], isec: &mut InputSection) {
        let sec_name = isec.name.clone();
        for i in 0..isec.relocs.len() {
            let rel = isec.relocs[i];
            if rel.r_type == R_PPC64_NONE {
                continue;
            }
            let sym_id = file_syms[rel.r_sym as usize];
            let sym = view.sym(sym_id);
            if sym.is_undefined() && !sym.is_weak() {
                view.diags.error(undef_error(&sym.name, &sec_name));
                continue;
            }
            let loc = &mut isec.bytes[rel.r_offset as usize..];
            match rel.r_type {
                R_PPC64_ADDR64 => {
                    if let Some(ts) = Self::get_tombstone(&sec_name, sym.discarded) {
                        write_u64(loc, ts);
                    } else {
                        write_u64(loc, sym.value.wrapping_add_signed(rel.r_addend));
                    }
                }
                R_PPC64_ADDR32 => {
                    let val = sym.value.wrapping_add_signed(rel.r_addend) as i64;
                    if in_range(val, 0, 1 << 32) {
                        write_u32(loc, val as u32);
                    } else {
                        view.diags.error(out_of_range_error(
                            &sec_name,
                            &sym.name,
                            rel.r_type,
                            val,
                            0,
                            1 << 32,
                        ));
                    }
                }
                R_PPC64_DTPREL64 => {
                    write_u64(
                        loc,
                        sym.value
                            .wrapping_add_signed(rel.r_addend)
                            .wrapping_sub(view.tls_begin)
                            .wrapping_sub(Self::TLS_DTV_OFFSET),
                    );
                }
                _ => view
                    .diags
                    .fatal(unknown_reloc_error(&sec_name, rel.r_type)),
            }
        }
    }

    fn apply_eh_frame_reloc(
        view: &LinkView,
        rel: &Reloc,
        offset: u64,
        val: u64,
        loc: &mut [u8],
    ) -> Result<()> {
        let _ = view;
        match rel.r_type {
            R_PPC64_NONE => {}
            R_PPC64_ADDR64 => write_u64(loc, val),
            R_PPC64_REL32 => write_u32(loc, val.wrapping_sub(offset) as u32),
            R_PPC64_REL64 => write_u64(loc, val.wrapping_sub(offset)),
            _ => return Err(unknown_reloc_error(".eh_frame", rel.r_type)),
        }
        Ok(())
    }

    /// `.plt` only matters for lazy symbol resolution: every PLT call is
    /// made through a range-extension thunk that reads `.got.plt`
    /// directly, so once the loader has filled `.got.plt` the entries
    /// below are never executed again.
    fn write_plt_header(view: &LinkView, buf: &mut [u8]) {
        const INSN: [u32; 13] = [
            // Obtain our own address while preserving the caller's LR.
            0x7c08_02a6, //    mflr  r0
            0x429f_0005, //    bcl   20, 31, 1f
            0x7d68_02a6, // 1: mflr  r11
            0x7c08_03a6, //    mtlr  r0
            // Compute the PLT entry index from the return address pushed
            // by the entry's bl.
            0xe80b_002c, //    ld    r0, 44(r11)
            0x7d8b_6050, //    subf  r12, r11, r12
            0x7d60_5a14, //    add   r11, r0, r11
            0x380c_ffcc, //    addi  r0, r12, -52
            0x7800_f082, //    rldicl r0, r0, 62, 2
            // Load .got.plt[0] and .got.plt[1], branch to .got.plt[0].
            0xe98b_0000, //    ld    r12, 0(r11)
            0x7d89_03a6, //    mtctr r12
            0xe96b_0008, //    ld    r11, 8(r11)
            0x4e80_0420, //    bctr
        ];
        for (i, insn) in INSN.iter().enumerate() {
            write_u32(&mut buf[i * 4..], *insn);
        }
        // Trailing quad: .got.plt - .plt - 8
        let val = view.gotplt.sh_addr.wrapping_sub(view.plt.sh_addr + 8);
        write_u64(&mut buf[52..60], val);
    }

    fn write_plt_entry(view: &LinkView, buf: &mut [u8], sym_id: usize) {
        // bl plt0
        let val = 0x4b00_0000
            | (view.plt.sh_addr.wrapping_sub(view.plt_addr(sym_id)) & 0x00ff_ffff) as u32;
        write_u32(buf, val);
    }

    fn write_pltgot_entry(_view: &LinkView, buf: &mut [u8], _sym_id: usize) {
        // Nothing reads .plt.got at runtime: thunks load the final address
        // straight from the GOT. A dummy keeps the layout regular.
        write_u32(buf, PPC64_NOP);
    }

    fn write_thunk(view: &LinkView, osec: &OutputSection, thunk_idx: usize, buf: &mut [u8]) {
        // For a PLT destination: spill r2 to its save slot, then jump via
        // the address the loader put in .got.plt (or .got).
        const PLT_THUNK: [u32; 5] = [
            0xf841_0018, // std   r2, 24(r1)
            0x3d82_0000, // addis r12, r2, foo@gotplt@toc@ha
            0xe98c_0000, // ld    r12, foo@gotplt@toc@lo(r12)
            0x7d89_03a6, // mtctr r12
            0x4e80_0420, // bctr
        ];
        // For a local destination: jump straight to its local entry point.
        const LOCAL_THUNK: [u32; 5] = [
            0x3d82_0000, // addis r12, r2,  foo@toc@ha
            0x398c_0000, // addi  r12, r12, foo@toc@lo
            0x7d89_03a6, // mtctr r12
            0x4e80_0420, // bctr
            PPC64_NOP,
        ];

        let thunk = &osec.thunks[thunk_idx];
        let toc = view.toc_addr;
        for (k, &sym_id) in thunk.symbols.iter().enumerate() {
            let off = (k as u64 * Self::THUNK_SIZE) as usize;
            let sym = view.sym(sym_id);
            if sym.has_plt() {
                for (i, insn) in PLT_THUNK.iter().enumerate() {
                    write_u32(&mut buf[off + i * 4..], *insn);
                }
                let got = if sym.has_got() {
                    view.got_addr(sym_id)
                } else {
                    view.gotplt_addr(sym_id)
                };
                let val = got.wrapping_sub(toc);
                or_u32(&mut buf[off + 4..], higha(val) as u32);
                or_u32(&mut buf[off + 8..], lo(val) as u32);
            } else {
                for (i, insn) in LOCAL_THUNK.iter().enumerate() {
                    write_u32(&mut buf[off + i * 4..], *insn);
                }
                let val = sym
                    .value
                    .wrapping_add(local_entry_offset(view, sym_id))
                    .wrapping_sub(toc);
                or_u32(&mut buf[off..], higha(val) as u32);
                or_u32(&mut buf[off + 4..], lo(val) as u32);
            }
        }
    }

    fn get_tombstone(sec_name: &str, discarded: bool) -> Option<u64> {
        if !discarded || !sec_name.starts_with(".debug") {
            return None;
        }
        if sec_name == ".debug_loc" || sec_name == ".debug_ranges" {
            Some(1)
        } else {
            Some(0)
        }
    }
}
