//! The apply phase: walk every input section in parallel and patch its
//! bytes with final relocation values. Each section owns its byte range
//! and its pre-reserved slice of the dynamic relocation stream, so the
//! whole phase runs without locks.

use rayon::prelude::*;

use crate::arch::{with_arch, Arch};
use crate::context::{Context, LinkView};
use crate::dynamic::DynReloc;
use crate::input::{InputFile, InputSection};
use crate::scan::{get_action, ScanAction, ScanTable};
use crate::utils;
use crate::Result;

/// Cursor over one section's slice of the dynamic relocation stream.
pub struct DynRelWriter<'a> {
    slice: &'a mut [DynReloc],
    pos: usize,
}

impl<'a> DynRelWriter<'a> {
    pub fn new(slice: &'a mut [DynReloc]) -> Self {
        Self { slice, pos: 0 }
    }

    #[inline]
    pub fn push(&mut self, rel: DynReloc) {
        debug_assert!(
            self.pos < self.slice.len(),
            "dynamic relocation reservation overflow"
        );
        if self.pos < self.slice.len() {
            self.slice[self.pos] = rel;
            self.pos += 1;
        }
    }
}

fn write_word<A: Arch>(loc: &mut [u8], val: u64) {
    if A::WORD_SIZE == 4 {
        utils::write_u32(loc, val as u32);
    } else {
        utils::write_u64(loc, val);
    }
}

/// Resolve an absolute (pointer-sized) relocation through the same action
/// table the scanner used, either writing the value in place or emitting
/// the dynamic relocation the scanner reserved space for.
#[allow(clippy::too_many_arguments)]
pub(crate) fn apply_dyn_absrel<A: Arch>(
    view: &LinkView,
    sym_id: usize,
    loc: &mut [u8],
    s: u64,
    a: i64,
    p: u64,
    dynrel: &mut DynRelWriter,
    table: &ScanTable,
) {
    let sym = view.sym(sym_id);
    let val = s.wrapping_add_signed(a);
    match get_action(view.opts, table, sym) {
        ScanAction::Baserel => {
            dynrel.push(DynReloc {
                offset: p,
                r_type: A::R_RELATIVE,
                r_sym: 0,
                addend: val as i64,
            });
            write_word::<A>(loc, val);
        }
        ScanAction::Dynrel => {
            dynrel.push(DynReloc {
                offset: p,
                r_type: A::R_ABS,
                r_sym: sym_id as u32,
                addend: a,
            });
            write_word::<A>(loc, a as u64);
        }
        // Copyrel/Cplt sites resolve statically: by now the symbol's
        // address is the copy or the canonical PLT entry.
        _ => write_word::<A>(loc, val),
    }
}

fn apply_all_inner<A: Arch>(ctx: &mut Context) -> Result<()> {
    let Context {
        files,
        symbols,
        output_sections,
        opts,
        got,
        gotplt,
        plt,
        pltgot,
        copyrel,
        reldyn,
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
        osecs: output_sections,
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

    // Flatten the link into per-section work items, each owning its bytes
    // and its pre-reserved sub-slice of the stream; disjoint by
    // construction, so the parallel writers never contend and parallelism
    // is at section granularity.
    let head_len = reldyn.head_len;
    let mut rest: &mut [DynReloc] = &mut reldyn.entries[head_len..];
    let mut work: Vec<(&mut InputSection, &[usize], &mut [DynReloc])> = Vec::new();
    for file in files.iter_mut() {
        let InputFile {
            sections,
            symbols: file_syms,
            num_dynrel,
            ..
        } = file;
        let file_syms: &[usize] = file_syms;
        let n = num_dynrel.load(std::sync::atomic::Ordering::Relaxed) as usize;
        let (file_slice, tail) = rest.split_at_mut(n);
        rest = tail;
        let mut remaining = file_slice;
        for isec in sections.iter_mut() {
            if isec.relocs.is_empty() {
                continue;
            }
            debug_assert_eq!(isec.reldyn_offset as usize, n - remaining.len());
            let (sub, rem) = remaining.split_at_mut(isec.num_dynrel as usize);
            remaining = rem;
            work.push((isec, file_syms, sub));
        }
    }

    work.into_par_iter().for_each(|(isec, file_syms, sub)| {
        if !isec.is_alloc() {
            A::apply_reloc_nonalloc(&view, file_syms, isec);
        } else {
            let mut writer = DynRelWriter::new(sub);
            A::apply_reloc_alloc(&view, file_syms, isec, &mut writer);
        }
    });

    ctx.diags.check()
}

/// Patch every input section with its final relocation values and fill
/// the per-file tail of the dynamic relocation stream. Runs in parallel
/// across input sections; fatal diagnostics abort the link at the phase
/// boundary.
pub fn apply_all(ctx: &mut Context) -> Result<()> {
    log::debug!("applying relocations of {} files", ctx.files.len());
    with_arch!(ctx.machine, apply_all_inner, ctx)
}

/// Shared helper for the back-ends: fetch the routed branch target when
/// the planner recorded a thunk for this site.
#[inline]
pub(crate) fn routed_target(view: &LinkView, isec: &InputSection, rel_idx: usize) -> Option<u64> {
    let route = isec.extra.range_extn.get(rel_idx).copied()?;
    if route.is_none() {
        return None;
    }
    Some(view.thunk_slot_addr(
        isec.output_section,
        route.thunk_idx as usize,
        route.sym_idx as usize,
    ))
}
