//! ARM32 (EABI, little-endian) back-end.
//!
//! ARM is the interworking target: every call site is either ARM or Thumb
//! and the callee may be the other kind. BL and BLX differ in exactly one
//! bit, so CALL-class relocations can switch mode in place; JUMP24-class
//! branches cannot (B takes no register and BX takes no immediate), so a
//! mode-switching jump is always routed through a range-extension thunk
//! with a Thumb entry point at +0 and an ARM entry point at +4. Unwind
//! data lives in `.ARM.exidx` instead of `.eh_frame`, which the post-pass
//! below sorts into ascending function-address order.

use std::sync::atomic::{AtomicU32, Ordering};

use rayon::prelude::*;

use crate::apply::{apply_dyn_absrel, routed_target, DynRelWriter};
use crate::arch::Arch;
use crate::context::LinkView;
use crate::input::{InputSection, Reloc};
use crate::opts::LinkOptions;
use crate::output::OutputSection;
use crate::scan::{reserve_dynrels, ScanCtx, DYN_ABSREL_TABLE};
use crate::sched::par_sort_by_key;
use crate::symbol::Needs;
use crate::utils::*;
use crate::{
    illegal_reloc_error, malformed_section_error, not_allocated_error, out_of_range_error,
    reserved_encoding_error, undef_error, unknown_reloc_error, Result,
};

pub const R_ARM_NONE: u32 = 0;
pub const R_ARM_ABS32: u32 = 2;
pub const R_ARM_REL32: u32 = 3;
pub const R_ARM_THM_CALL: u32 = 10;
pub const R_ARM_TLS_DESC: u32 = 13;
pub const R_ARM_TLS_DTPMOD32: u32 = 17;
pub const R_ARM_TLS_DTPOFF32: u32 = 18;
pub const R_ARM_TLS_TPOFF32: u32 = 19;
pub const R_ARM_COPY: u32 = 20;
pub const R_ARM_GLOB_DAT: u32 = 21;
pub const R_ARM_JUMP_SLOT: u32 = 22;
pub const R_ARM_RELATIVE: u32 = 23;
pub const R_ARM_GOTOFF32: u32 = 24;
pub const R_ARM_BASE_PREL: u32 = 25;
pub const R_ARM_GOT_BREL: u32 = 26;
pub const R_ARM_PLT32: u32 = 27;
pub const R_ARM_CALL: u32 = 28;
pub const R_ARM_JUMP24: u32 = 29;
pub const R_ARM_THM_JUMP24: u32 = 30;
pub const R_ARM_TARGET1: u32 = 38;
pub const R_ARM_V4BX: u32 = 40;
pub const R_ARM_TARGET2: u32 = 41;
pub const R_ARM_PREL31: u32 = 42;
pub const R_ARM_MOVW_ABS_NC: u32 = 43;
pub const R_ARM_MOVT_ABS: u32 = 44;
pub const R_ARM_MOVW_PREL_NC: u32 = 45;
pub const R_ARM_MOVT_PREL: u32 = 46;
pub const R_ARM_THM_MOVW_ABS_NC: u32 = 47;
pub const R_ARM_THM_MOVT_ABS: u32 = 48;
pub const R_ARM_THM_MOVW_PREL_NC: u32 = 49;
pub const R_ARM_THM_MOVT_PREL: u32 = 50;
pub const R_ARM_TLS_GOTDESC: u32 = 90;
pub const R_ARM_TLS_CALL: u32 = 91;
pub const R_ARM_TLS_DESCSEQ: u32 = 92;
pub const R_ARM_THM_TLS_CALL: u32 = 93;
pub const R_ARM_GOT_PREL: u32 = 96;
pub const R_ARM_THM_JUMP11: u32 = 102;
pub const R_ARM_TLS_GD32: u32 = 104;
pub const R_ARM_TLS_LDM32: u32 = 105;
pub const R_ARM_TLS_LDO32: u32 = 106;
pub const R_ARM_TLS_IE32: u32 = 107;
pub const R_ARM_TLS_LE32: u32 = 108;
pub const R_ARM_THM_TLS_DESCSEQ16: u32 = 129;
pub const R_ARM_THM_TLS_DESCSEQ32: u32 = 130;
pub const R_ARM_IRELATIVE: u32 = 160;

pub const SHT_ARM_EXIDX: u32 = 0x7000_0001;
pub const EXIDX_CANTUNWIND: u32 = 1;

/// Canonical NOPs a call against a remaining undefined weak is rewritten
/// to: on ARM the call just falls through to the next instruction.
pub const ARM_NOP: u32 = 0xe320_f000;
pub const THM_NOP_W: u32 = 0x8000_f3af;

pub struct Arm32;

/// Patch the immediate of an ARM MOVW/MOVT, leaving cond/opcode/Rd alone.
fn write_mov_imm(loc: &mut [u8], val: u64) {
    let imm12 = bits(val, 11, 0) as u32;
    let imm4 = bits(val, 15, 12) as u32;
    patch_u32(loc, 0x000f_0fff, (imm4 << 16) | imm12);
}

/// Patch the immediate of a Thumb2 MOVW/MOVT (encoding T3).
fn write_thm_mov_imm(loc: &mut [u8], val: u64) {
    let imm4 = bits(val, 15, 12) as u16;
    let i = bit(val, 11) as u16;
    let imm3 = bits(val, 10, 8) as u16;
    let imm8 = bits(val, 7, 0) as u16;
    patch_u16(&mut loc[0..2], 0b0000_0100_0000_1111, (i << 10) | imm4);
    patch_u16(&mut loc[2..4], 0b0111_0000_1111_1111, (imm3 << 12) | imm8);
}

/// Patch the branch displacement of a Thumb2 B.W/BL/BLX (encoding T4),
/// preserving the opcode bits including the BL/BLX selector.
fn write_thm_b_imm(loc: &mut [u8], val: u64) {
    let sign = bit(val, 24) as u16;
    let i1 = bit(val, 23) as u16;
    let i2 = bit(val, 22) as u16;
    let j1 = (i1 ^ 1) ^ sign;
    let j2 = (i2 ^ 1) ^ sign;
    let imm10 = bits(val, 21, 12) as u16;
    let imm11 = bits(val, 11, 1) as u16;
    patch_u16(&mut loc[0..2], 0x07ff, (sign << 10) | imm10);
    patch_u16(&mut loc[2..4], 0x2fff, (j1 << 13) | (j2 << 11) | imm11);
}

/// Rewrite the second halfword between BL (bit set) and BLX (bit clear).
fn set_thm_bl(loc: &mut [u8], is_bl: bool) {
    let old = read_u16(&loc[2..4]);
    let new = if is_bl { old | 0x1000 } else { old & !0x1000 };
    write_u16(&mut loc[2..4], new);
}

/// TLS descriptor calls are relaxed to IE/LE whenever the output is not a
/// shared object; the descriptor is then never allocated.
pub(crate) fn relax_tlsdesc(opts: &LinkOptions) -> bool {
    !opts.output_kind.is_shared()
}

/// Where a branch to the symbol actually lands, and in which instruction
/// set: calls to symbols with a PLT go to the (ARM-state) PLT entry.
fn branch_target(view: &LinkView, sym_id: usize) -> (u64, bool) {
    let sym = view.sym(sym_id);
    if sym.has_plt() {
        (view.plt_addr(sym_id), false)
    } else {
        (sym.value, sym.is_thumb)
    }
}

/// Address of the TLS trampoline carried in the first thunk header of the
/// output section.
fn trampoline_addr(view: &LinkView, osec_idx: usize) -> Option<u64> {
    let osec = view.osecs.get(osec_idx)?;
    let thunk = osec.thunks.first()?;
    Some(osec.shdr.sh_addr + thunk.offset)
}

impl Arch for Arm32 {
    const E_MACHINE: u16 = elf::abi::EM_ARM;
    const WORD_SIZE: u64 = 4;
    const GOTPLT_RESERVED: u64 = 3;
    const PLT_HDR_SIZE: u64 = 32;
    const PLT_ENTRY_SIZE: u64 = 16;
    const PLTGOT_ENTRY_SIZE: u64 = 16;
    const THUNK_HDR_SIZE: u64 = 16;
    const THUNK_SIZE: u64 = 20;
    // Conservative: the Thumb2 BL reach, ±16 MiB, for both site kinds.
    const BRANCH_REACH: i64 = 1 << 24;
    const TLS_DTV_OFFSET: u64 = 0;
    const USES_RELA: bool = false;

    const R_ABS: u32 = R_ARM_ABS32;
    const R_RELATIVE: u32 = R_ARM_RELATIVE;
    const R_GLOB_DAT: u32 = R_ARM_GLOB_DAT;
    const R_JUMP_SLOT: u32 = R_ARM_JUMP_SLOT;
    const R_COPY: u32 = R_ARM_COPY;
    const R_DTPMOD: u32 = R_ARM_TLS_DTPMOD32;
    const R_DTPOFF: u32 = R_ARM_TLS_DTPOFF32;
    const R_TPOFF: u32 = R_ARM_TLS_TPOFF32;
    const R_IRELATIVE: u32 = R_ARM_IRELATIVE;
    const R_TLSDESC: u32 = R_ARM_TLS_DESC;

    fn is_jump_reachable(disp: i64) -> bool {
        sign_extend(disp as u64, 24) == disp
    }

    fn is_call_reloc(r_type: u32) -> bool {
        matches!(
            r_type,
            R_ARM_CALL | R_ARM_THM_CALL | R_ARM_JUMP24 | R_ARM_THM_JUMP24 | R_ARM_PLT32
        )
    }

    fn needs_thunk(view: &LinkView, rel: &Reloc, sym_id: usize, p: u64) -> bool {
        let (target, thumb) = branch_target(view, sym_id);
        let disp = target.wrapping_add_signed(rel.r_addend).wrapping_sub(p) as i64;
        match rel.r_type {
            // BL and BLX rewrite in place, so only reach matters.
            R_ARM_CALL | R_ARM_THM_CALL | R_ARM_PLT32 => !Self::is_jump_reachable(disp),
            // B has no exchanging form; a mode switch always thunks.
            R_ARM_JUMP24 => thumb || !Self::is_jump_reachable(disp),
            R_ARM_THM_JUMP24 => !thumb || !Self::is_jump_reachable(disp),
            _ => false,
        }
    }

    fn needs_trampoline(view: &LinkView, rel: &Reloc, sym_id: usize) -> bool {
        matches!(rel.r_type, R_ARM_TLS_CALL | R_ARM_THM_TLS_CALL)
            && view.sym(sym_id).has_tlsdesc()
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
            if rel.r_type == R_ARM_NONE {
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
                R_ARM_ABS32 | R_ARM_TARGET1 => {
                    count += scx.scan_rel(&sec_name, sym_id, rel.r_type, &DYN_ABSREL_TABLE);
                }
                R_ARM_REL32
                | R_ARM_BASE_PREL
                | R_ARM_GOTOFF32
                | R_ARM_PREL31
                | R_ARM_THM_JUMP11
                | R_ARM_MOVW_PREL_NC
                | R_ARM_MOVT_PREL
                | R_ARM_THM_MOVW_PREL_NC
                | R_ARM_THM_MOVT_PREL => {}
                R_ARM_MOVW_ABS_NC
                | R_ARM_MOVT_ABS
                | R_ARM_THM_MOVW_ABS_NC
                | R_ARM_THM_MOVT_ABS => {
                    // Absolute immediates cannot be fixed up by the loader.
                    if scx.opts.output_kind.is_pic() {
                        scx.diags
                            .error(illegal_reloc_error(&sec_name, &sym.name, rel.r_type));
                    }
                }
                R_ARM_CALL | R_ARM_THM_CALL | R_ARM_JUMP24 | R_ARM_THM_JUMP24 | R_ARM_PLT32 => {
                    if sym.is_imported {
                        sym.add_flags(Needs::PLT);
                    }
                }
                R_ARM_GOT_PREL | R_ARM_GOT_BREL | R_ARM_TARGET2 => {
                    sym.add_flags(Needs::GOT);
                }
                R_ARM_TLS_GD32 => sym.add_flags(Needs::TLSGD),
                R_ARM_TLS_LDM32 => scx.needs_tlsld.store(true, Ordering::Relaxed),
                R_ARM_TLS_IE32 => sym.add_flags(Needs::GOTTP),
                R_ARM_TLS_GOTDESC => {
                    if relax_tlsdesc(scx.opts) {
                        if sym.is_imported {
                            sym.add_flags(Needs::GOTTP);
                        }
                    } else {
                        sym.add_flags(Needs::TLSDESC);
                    }
                }
                R_ARM_TLS_LDO32
                | R_ARM_TLS_LE32
                | R_ARM_TLS_CALL
                | R_ARM_THM_TLS_CALL
                | R_ARM_TLS_DESCSEQ
                | R_ARM_THM_TLS_DESCSEQ16
                | R_ARM_THM_TLS_DESCSEQ32
                | R_ARM_V4BX => {}
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
        let got = view.got_base();

        for i in 0..isec.relocs.len() {
            let rel = isec.relocs[i];
            if rel.r_type == R_ARM_NONE || rel.r_type == R_ARM_V4BX {
                continue;
            }
            let sym_id = file_syms[rel.r_sym as usize];
            let sym = view.sym(sym_id);
            if sym.is_undefined() && !sym.is_weak() {
                continue; // recorded during scan
            }

            let route = routed_target(view, isec, i);
            let s = view.sym_addr(sym_id);
            let t = view.sym_is_thumb(sym_id) as u64;
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
                R_ARM_ABS32 | R_ARM_TARGET1 => {
                    apply_dyn_absrel::<Arm32>(
                        view,
                        sym_id,
                        loc,
                        s | t,
                        a,
                        p,
                        dynrel,
                        &DYN_ABSREL_TABLE,
                    );
                }
                R_ARM_REL32 => {
                    write_u32(loc, ((s | t).wrapping_add_signed(a).wrapping_sub(p)) as u32);
                }
                R_ARM_CALL | R_ARM_PLT32 => {
                    if sym.is_remaining_undef_weak() {
                        // Calling an undefined weak falls through.
                        write_u32(loc, ARM_NOP);
                        continue;
                    }
                    let old = read_u32(loc);
                    let is_bl = old & 0xff00_0000 == 0xeb00_0000;
                    let is_blx = old & 0xfe00_0000 == 0xfa00_0000;
                    if rel.r_type == R_ARM_CALL && !is_bl && !is_blx {
                        view.diags.error(reserved_encoding_error(
                            &sym.name,
                            "R_ARM_CALL refers neither BL nor BLX",
                        ));
                        continue;
                    }
                    match route {
                        Some(slot) => {
                            // ARM entry point of the thunk is at +4.
                            let d =
                                (slot + 4).wrapping_add_signed(a).wrapping_sub(p) as i64;
                            if check(d, -(1 << 25), 1 << 25) {
                                write_u32(loc, 0xeb00_0000 | bits(d as u64, 25, 2) as u32);
                            }
                        }
                        None => {
                            let d = s.wrapping_add_signed(a).wrapping_sub(p) as i64;
                            if !check(d, -(1 << 25), 1 << 25) {
                                continue;
                            }
                            if t == 1 {
                                // One bit apart: rewrite BL into BLX.
                                let insn = 0xfa00_0000
                                    | (bit(d as u64, 1) << 24) as u32
                                    | bits(d as u64, 25, 2) as u32;
                                write_u32(loc, insn);
                            } else {
                                write_u32(loc, 0xeb00_0000 | bits(d as u64, 25, 2) as u32);
                            }
                        }
                    }
                }
                R_ARM_THM_CALL => {
                    if sym.is_remaining_undef_weak() {
                        write_u32(loc, THM_NOP_W);
                        continue;
                    }
                    match route {
                        Some(slot) => {
                            // Thumb entry point of the thunk is at +0, so
                            // the call stays a BL.
                            let d = slot.wrapping_add_signed(a).wrapping_sub(p);
                            write_thm_b_imm(loc, d);
                            set_thm_bl(loc, true);
                        }
                        None => {
                            let d = s.wrapping_add_signed(a).wrapping_sub(p) as i64;
                            if !check(d, -(1 << 24), 1 << 24) {
                                continue;
                            }
                            if t == 1 {
                                write_thm_b_imm(loc, d as u64);
                                set_thm_bl(loc, true);
                            } else {
                                // BLX targets ARM code; its displacement is
                                // measured from the 4-aligned PC.
                                write_thm_b_imm(loc, align_to(d as u64, 4));
                                set_thm_bl(loc, false);
                            }
                        }
                    }
                }
                R_ARM_JUMP24 => {
                    if sym.is_remaining_undef_weak() {
                        write_u32(loc, ARM_NOP);
                        continue;
                    }
                    let d = match route {
                        Some(slot) => (slot + 4).wrapping_add_signed(a).wrapping_sub(p) as i64,
                        None => s.wrapping_add_signed(a).wrapping_sub(p) as i64,
                    };
                    if check(d, -(1 << 25), 1 << 25) {
                        patch_u32(loc, 0x00ff_ffff, bits(d as u64, 25, 2) as u32);
                    }
                }
                R_ARM_THM_JUMP24 => {
                    if sym.is_remaining_undef_weak() {
                        write_u32(loc, THM_NOP_W);
                        continue;
                    }
                    let d = match route {
                        Some(slot) => slot.wrapping_add_signed(a).wrapping_sub(p) as i64,
                        None => s.wrapping_add_signed(a).wrapping_sub(p) as i64,
                    };
                    if check(d, -(1 << 24), 1 << 24) {
                        write_thm_b_imm(loc, d as u64);
                    }
                }
                R_ARM_THM_JUMP11 => {
                    let d = s.wrapping_add_signed(a).wrapping_sub(p) as i64;
                    if check(d, -(1 << 11), 1 << 11) {
                        patch_u16(&mut loc[0..2], 0x07ff, bits(d as u64, 11, 1) as u16);
                    }
                }
                R_ARM_PREL31 => {
                    let d = s.wrapping_add_signed(a).wrapping_sub(p) as i64;
                    if check(d, -(1 << 30), 1 << 30) {
                        patch_u32(loc, 0x7fff_ffff, d as u32);
                    }
                }
                R_ARM_MOVW_ABS_NC => write_mov_imm(loc, s.wrapping_add_signed(a) | t),
                R_ARM_MOVT_ABS => write_mov_imm(loc, s.wrapping_add_signed(a) >> 16),
                R_ARM_MOVW_PREL_NC => {
                    write_mov_imm(loc, (s.wrapping_add_signed(a) | t).wrapping_sub(p));
                }
                R_ARM_MOVT_PREL => {
                    write_mov_imm(loc, s.wrapping_add_signed(a).wrapping_sub(p) >> 16);
                }
                R_ARM_THM_MOVW_ABS_NC => write_thm_mov_imm(loc, s.wrapping_add_signed(a) | t),
                R_ARM_THM_MOVT_ABS => write_thm_mov_imm(loc, s.wrapping_add_signed(a) >> 16),
                R_ARM_THM_MOVW_PREL_NC => {
                    write_thm_mov_imm(loc, (s.wrapping_add_signed(a) | t).wrapping_sub(p));
                }
                R_ARM_THM_MOVT_PREL => {
                    write_thm_mov_imm(loc, s.wrapping_add_signed(a).wrapping_sub(p) >> 16);
                }
                R_ARM_GOT_PREL | R_ARM_TARGET2 => {
                    let g = view.got_offset(sym_id);
                    write_u32(loc, (got + g).wrapping_add_signed(a).wrapping_sub(p) as u32);
                }
                R_ARM_GOT_BREL => {
                    let g = view.got_offset(sym_id);
                    write_u32(loc, g.wrapping_add_signed(a) as u32);
                }
                R_ARM_GOTOFF32 => {
                    write_u32(loc, ((s | t).wrapping_add_signed(a).wrapping_sub(got)) as u32);
                }
                R_ARM_BASE_PREL => {
                    write_u32(loc, got.wrapping_add_signed(a).wrapping_sub(p) as u32);
                }
                R_ARM_TLS_GD32 => {
                    let addr = view.tlsgd_addr(sym_id);
                    write_u32(loc, addr.wrapping_add_signed(a).wrapping_sub(p) as u32);
                }
                R_ARM_TLS_LDM32 => {
                    let addr = view.tlsld_addr();
                    write_u32(loc, addr.wrapping_add_signed(a).wrapping_sub(p) as u32);
                }
                R_ARM_TLS_LDO32 => {
                    write_u32(
                        loc,
                        s.wrapping_add_signed(a).wrapping_sub(view.tls_begin) as u32,
                    );
                }
                R_ARM_TLS_IE32 => {
                    let addr = view.gottp_addr(sym_id);
                    write_u32(loc, addr.wrapping_add_signed(a).wrapping_sub(p) as u32);
                }
                R_ARM_TLS_LE32 => {
                    write_u32(
                        loc,
                        s.wrapping_add_signed(a).wrapping_sub(view.tp_addr) as u32,
                    );
                }
                R_ARM_TLS_GOTDESC => {
                    // Bit 0 of the addend records whether the matching
                    // TLS_CALL site is Thumb; the displacement correction
                    // differs between the two encodings.
                    let val = if sym.has_tlsdesc() {
                        let sub = if a & 1 == 1 { 6 } else { 4 };
                        view.tlsdesc_addr(sym_id)
                            .wrapping_sub(p)
                            .wrapping_add_signed(a)
                            .wrapping_sub(sub)
                    } else if sym.has_gottp() {
                        let sub = if a & 1 == 1 { 5 } else { 8 };
                        view.gottp_addr(sym_id)
                            .wrapping_sub(p)
                            .wrapping_add_signed(a)
                            .wrapping_sub(sub)
                    } else {
                        let sub = if a & 1 == 1 { 9 } else { 8 };
                        s.wrapping_sub(view.tp_addr)
                            .wrapping_add_signed(a)
                            .wrapping_sub(sub)
                    };
                    write_u32(loc, val as u32);
                }
                R_ARM_TLS_CALL => {
                    if sym.has_tlsdesc() {
                        match trampoline_addr(view, isec.output_section) {
                            Some(tramp) => {
                                let d = tramp.wrapping_add_signed(a).wrapping_sub(p + 8);
                                write_u32(loc, 0xeb00_0000 | bits(d, 25, 2) as u32);
                            }
                            None => view.diags.error(reserved_encoding_error(
                                &sym.name,
                                "TLS descriptor call without a trampoline",
                            )),
                        }
                    } else if sym.has_gottp() {
                        // Relaxed to IE: ldr r0, [pc, r0]
                        write_u32(loc, 0xe79f_0000);
                    } else {
                        // Relaxed to LE: the descriptor load already
                        // produced the TP offset.
                        write_u32(loc, ARM_NOP);
                    }
                }
                R_ARM_THM_TLS_CALL => {
                    if sym.has_tlsdesc() {
                        match trampoline_addr(view, isec.output_section) {
                            Some(tramp) => {
                                let d = tramp.wrapping_add_signed(a).wrapping_sub(p);
                                write_thm_b_imm(loc, align_to(d, 4));
                                set_thm_bl(loc, false); // trampoline is ARM code
                            }
                            None => view.diags.error(reserved_encoding_error(
                                &sym.name,
                                "TLS descriptor call without a trampoline",
                            )),
                        }
                    } else if sym.has_gottp() {
                        // ldr.w r0, [pc, r0]
                        write_u32(loc, 0x0000_f85f);
                    } else {
                        write_u32(loc, THM_NOP_W);
                    }
                }
                R_ARM_TLS_DESCSEQ | R_ARM_THM_TLS_DESCSEQ16 | R_ARM_THM_TLS_DESCSEQ32 => {}
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
            if rel.r_type == R_ARM_NONE {
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
                R_ARM_ABS32 => {
                    if let Some(ts) = Self::get_tombstone(&sec_name, sym.discarded) {
                        write_u32(loc, ts as u32);
                    } else {
                        write_u32(loc, sym.value.wrapping_add_signed(rel.r_addend) as u32);
                    }
                }
                R_ARM_TLS_LDO32 => {
                    write_u32(
                        loc,
                        sym.value
                            .wrapping_add_signed(rel.r_addend)
                            .wrapping_sub(view.tls_begin) as u32,
                    );
                }
                _ => view
                    .diags
                    .fatal(unknown_reloc_error(&sec_name, rel.r_type)),
            }
        }
    }

    /// ARM has no `.eh_frame`; unwinding uses `.ARM.exidx`.
    fn apply_eh_frame_reloc(
        _view: &LinkView,
        _rel: &Reloc,
        _offset: u64,
        _val: u64,
        _loc: &mut [u8],
    ) -> Result<()> {
        Ok(())
    }

    fn write_plt_header(view: &LinkView, buf: &mut [u8]) {
        const INSN: [u32; 8] = [
            0xe52d_e004, //    push {lr}
            0xe59f_e004, //    ldr lr, 2f
            0xe08f_e00e, // 1: add lr, pc, lr
            0xe5be_f008, //    ldr pc, [lr, #8]!
            0x0000_0000, // 2: .word .got.plt - 1b - 8
            0xe320_f000, //    nop
            0xe320_f000, //    nop
            0xe320_f000, //    nop
        ];
        for (i, insn) in INSN.iter().enumerate() {
            write_u32(&mut buf[i * 4..], *insn);
        }
        let val = view.gotplt.sh_addr.wrapping_sub(view.plt.sh_addr + 16);
        write_u32(&mut buf[16..], val as u32);
    }

    fn write_plt_entry(view: &LinkView, buf: &mut [u8], sym_id: usize) {
        const INSN: [u32; 4] = [
            0xe59f_c004, // 1: ldr ip, 2f
            0xe08c_c00f, //    add ip, ip, pc
            0xe59c_f000, //    ldr pc, [ip]
            0x0000_0000, // 2: .word sym@GOTPLT - 1b - 12
        ];
        for (i, insn) in INSN.iter().enumerate() {
            write_u32(&mut buf[i * 4..], *insn);
        }
        let val = view
            .gotplt_addr(sym_id)
            .wrapping_sub(view.plt_addr(sym_id) + 12);
        write_u32(&mut buf[12..], val as u32);
    }

    fn write_pltgot_entry(view: &LinkView, buf: &mut [u8], sym_id: usize) {
        const INSN: [u32; 4] = [
            0xe59f_c004, // 1: ldr ip, 2f
            0xe08c_c00f, //    add ip, ip, pc
            0xe59c_f000, //    ldr pc, [ip]
            0x0000_0000, // 2: .word sym@GOT - 1b - 12
        ];
        for (i, insn) in INSN.iter().enumerate() {
            write_u32(&mut buf[i * 4..], *insn);
        }
        let entry_addr = view.pltgot.sh_addr + view.sym(sym_id).pltgot_idx as u64 * 16;
        let val = view.got_addr(sym_id).wrapping_sub(entry_addr + 12);
        write_u32(&mut buf[12..], val as u32);
    }

    fn write_thunk(view: &LinkView, osec: &OutputSection, thunk_idx: usize, buf: &mut [u8]) {
        // The header doubles as the TLS descriptor trampoline: compilers
        // assume the linker synthesizes this sequence once per module.
        const HDR: [u32; 4] = [
            0xe08e_0000, // add r0, lr, r0
            0xe590_1004, // ldr r1, [r0, #4]
            0xe12f_ff11, // bx  r1
            0xe320_f000, // nop
        ];
        // Two entry points per slot: Thumb at +0 (bx pc switches to the
        // ARM half), ARM at +4. The ARM half reads the target from the
        // trailing literal and issues bx, so either instruction set can
        // reach either kind of callee.
        const ENTRY: [u8; 16] = [
            0x78, 0x47, // 0: bx pc  (Thumb)
            0xc0, 0x46, //    nop    (Thumb)
            0x04, 0xc0, 0x9f, 0xe5, // 1: ldr ip, 3f
            0x0f, 0xc0, 0x8c, 0xe0, // 2: add ip, ip, pc
            0x1c, 0xff, 0x2f, 0xe1, //    bx  ip
        ];

        for (i, insn) in HDR.iter().enumerate() {
            write_u32(&mut buf[i * 4..], *insn);
        }
        let thunk = &osec.thunks[thunk_idx];
        for (k, &sym_id) in thunk.symbols.iter().enumerate() {
            let off = (Self::THUNK_HDR_SIZE + k as u64 * Self::THUNK_SIZE) as usize;
            buf[off..off + 16].copy_from_slice(&ENTRY);
            let entry_addr = thunk.slot_addr(
                osec.shdr.sh_addr,
                Self::THUNK_HDR_SIZE,
                Self::THUNK_SIZE,
                k,
            );
            // 3: .word (sym | T) - 2b - 8
            let target = view.sym_addr(sym_id) | view.sym_is_thumb(sym_id) as u64;
            write_u32(&mut buf[off + 16..], target.wrapping_sub(entry_addr + 16) as u32);
        }
    }

    fn get_tombstone(sec_name: &str, discarded: bool) -> Option<u64> {
        if !discarded || !sec_name.starts_with(".debug") {
            return None;
        }
        // An address of 1 keeps .debug_loc/.debug_ranges list terminators
        // distinguishable from the tombstone.
        if sec_name == ".debug_loc" || sec_name == ".debug_ranges" {
            Some(1)
        } else {
            Some(0)
        }
    }
}

/// `.ARM.exidx` post-pass. Records are pairs of a 31-bit self-relative
/// function address and a value that is either an inline unwind program,
/// `EXIDX_CANTUNWIND`, or a self-relative pointer into `.ARM.extab`. The
/// unwinder binary-searches the table, so after the contributing sections
/// have been placed the records must be rewritten in ascending function
/// order: translate both fields to section-relative form, sort, translate
/// back.
pub fn fixup_exidx(name: &str, bytes: &mut [u8]) -> Result<()> {
    const ENTRY_SIZE: usize = 8;
    if bytes.len() % ENTRY_SIZE != 0 {
        return Err(malformed_section_error(name, bytes.len() as u64));
    }

    struct Entry {
        addr: i64,
        val: i64,
        val_is_relative: bool,
    }

    let mut entries: Vec<Entry> = bytes
        .chunks_exact(ENTRY_SIZE)
        .map(|chunk| {
            let val = read_u32(&chunk[4..8]);
            Entry {
                addr: read_u32(&chunk[0..4]) as i64,
                val: val as i64,
                val_is_relative: val != EXIDX_CANTUNWIND && val & 0x8000_0000 == 0,
            }
        })
        .collect();

    entries.par_iter_mut().enumerate().for_each(|(i, ent)| {
        let offset = (i * ENTRY_SIZE) as i64;
        ent.addr = sign_extend(ent.addr as u64, 30) + offset;
        if ent.val_is_relative {
            ent.val = sign_extend(ent.val as u64, 30) + offset + 4;
        }
    });

    par_sort_by_key(&mut entries, |ent| ent.addr);

    entries.par_iter_mut().enumerate().for_each(|(i, ent)| {
        let offset = (i * ENTRY_SIZE) as i64;
        ent.addr = (ent.addr - offset) & 0x7fff_ffff;
        if ent.val_is_relative {
            ent.val = (ent.val - offset - 4) & 0x7fff_ffff;
        }
    });

    for (i, ent) in entries.iter().enumerate() {
        write_u32(&mut bytes[i * ENTRY_SIZE..], ent.addr as u32);
        write_u32(&mut bytes[i * ENTRY_SIZE + 4..], ent.val as u32);
    }
    Ok(())
}
