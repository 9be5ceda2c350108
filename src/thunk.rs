//! The range-extension thunk planner.
//!
//! Thunk placement is a monotone sweep over every executable output
//! section: member sections are laid out in order and call sites whose
//! displacement exceeds the encoded reach (or that require an instruction
//! set switch no in-place rewrite can express) are collected against the
//! currently open thunk. The thunk is flushed into the layout as soon as
//! keeping it open any longer would push it out of reach of its first
//! pending site; every pending site then branches forward to the flushed
//! thunk. On PPC64 every PLT call is routed this way regardless of reach,
//! because the thunk is also what restores the caller's TOC pointer.

use elf::abi::SHF_EXECINSTR;

use crate::arch::{with_arch, Arch};
use crate::context::{Context, LinkView};
use crate::input::{InputFile, RangeExtnRef};
use crate::output::{OutputSection, RangeExtensionThunk};
use crate::utils::align_to;

/// Headroom subtracted from the branch reach so that layout drift caused
/// by the thunks themselves can never push a routed site out of range.
const SLACK: i64 = 0x10_0000;

struct PendingSite {
    file: usize,
    sec: usize,
    rel_idx: usize,
    sym: usize,
    site: u64,
}

fn flush_thunk<A: Arch>(
    files: &mut [InputFile],
    osec: &mut OutputSection,
    pending: &mut Vec<PendingSite>,
    offset: &mut u64,
) {
    if pending.is_empty() {
        return;
    }
    *offset = align_to(*offset, A::WORD_SIZE.max(4));
    let thunk_idx = osec.thunks.len() as i32;
    let mut symbols: Vec<usize> = Vec::new();
    for site in pending.drain(..) {
        let slot = match symbols.iter().position(|&s| s == site.sym) {
            Some(i) => i,
            None => {
                symbols.push(site.sym);
                symbols.len() - 1
            }
        };
        files[site.file].sections[site.sec].extra.range_extn[site.rel_idx] = RangeExtnRef {
            thunk_idx,
            sym_idx: slot as i32,
        };
    }
    let thunk = RangeExtensionThunk {
        offset: *offset,
        symbols,
    };
    *offset += thunk.size(A::THUNK_HDR_SIZE, A::THUNK_SIZE);
    osec.thunks.push(thunk);
}

fn plan_osec<A: Arch>(view: &LinkView, files: &mut [InputFile], osec: &mut OutputSection) {
    let base = osec.shdr.sh_addr;
    let mut offset = 0u64;
    let mut pending: Vec<PendingSite> = Vec::new();
    let mut needs_trampoline = false;
    osec.thunks.clear();

    let members = osec.members.clone();
    for (f, s) in members {
        let InputFile {
            sections,
            symbols: file_syms,
            ..
        } = &mut files[f];
        let isec = &mut sections[s];
        offset = align_to(offset, isec.sh_addralign.max(1));
        isec.offset = offset;
        if isec.extra.range_extn.len() != isec.relocs.len() {
            isec.extra.range_extn = vec![RangeExtnRef::NONE; isec.relocs.len()];
        }
        for (i, rel) in isec.relocs.iter().enumerate() {
            let sym_id = match file_syms.get(rel.r_sym as usize) {
                Some(&id) => id,
                None => continue,
            };
            if A::needs_trampoline(view, rel, sym_id) {
                needs_trampoline = true;
            }
            if !A::is_call_reloc(rel.r_type) {
                continue;
            }
            let sym = view.sym(sym_id);
            // Calls against a remaining undefined weak are rewritten to a
            // NOP by the applier; they never take a thunk.
            if sym.is_remaining_undef_weak() {
                continue;
            }
            let p = base + offset + rel.r_offset;
            if A::needs_thunk(view, rel, sym_id, p) {
                pending.push(PendingSite {
                    file: f,
                    sec: s,
                    rel_idx: i,
                    sym: sym_id,
                    site: p,
                });
            }
        }
        offset += isec.bytes.len() as u64;

        if let Some(first) = pending.first() {
            let projected = offset + A::THUNK_HDR_SIZE + pending.len() as u64 * A::THUNK_SIZE;
            let span = (base + projected) as i64 - first.site as i64;
            if span > A::BRANCH_REACH - SLACK {
                flush_thunk::<A>(files, osec, &mut pending, &mut offset);
            }
        }
    }
    flush_thunk::<A>(files, osec, &mut pending, &mut offset);

    // ARM TLS descriptor calls branch to the common trampoline carried in
    // the thunk header; make sure the section has one.
    if needs_trampoline && osec.thunks.is_empty() {
        offset = align_to(offset, A::WORD_SIZE.max(4));
        osec.thunks.push(RangeExtensionThunk {
            offset,
            symbols: Vec::new(),
        });
        offset += A::THUNK_HDR_SIZE;
    }
    osec.shdr.sh_size = offset;
}

fn plan_thunks_inner<A: Arch>(ctx: &mut Context) {
    let Context {
        files,
        output_sections,
        symbols,
        opts,
        got,
        gotplt,
        plt,
        pltgot,
        copyrel,
        diags,
        machine,
        tls_begin,
        tp_addr,
        toc_addr,
        ..
    } = ctx;
    let view = LinkView {
        opts,
        machine: *machine,
        symbols,
        osecs: &[],
        got,
        gotplt,
        plt,
        pltgot,
        copyrel,
        tls_begin: *tls_begin,
        tp_addr: *tp_addr,
        toc_addr: *toc_addr,
        diags,
    };
    for osec in output_sections.iter_mut() {
        if osec.shdr.sh_flags & SHF_EXECINSTR as u64 == 0 {
            continue;
        }
        plan_osec::<A>(&view, files, osec);
    }
}

/// Lay out member sections and thunks inside every executable output
/// section and record the `(relocation -> thunk slot)` routing. Requires
/// table and output-section addresses to be set; the layout pass
/// re-finalizes `sh_size` afterwards.
pub fn plan_thunks(ctx: &mut Context) {
    with_arch!(ctx.machine, plan_thunks_inner, ctx)
}
