//! The relocation scan: a parallel walk over every allocatable input
//! section that records what dynamic machinery each symbol needs and how
//! many dynamic relocations each section will emit.
//!
//! Absolute-style relocations are classified through a 3x4 action table
//! keyed by output kind (shared / PIE / position-dependent executable) and
//! symbol kind (absolute / local / imported data / imported code).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use rayon::prelude::*;

use crate::arch::{with_arch, Arch, Machine};
use crate::context::Context;
use crate::input::{InputFile, RangeExtnRef};
use crate::opts::LinkOptions;
use crate::sched::Diagnostics;
use crate::symbol::{Needs, Symbol};
use crate::{illegal_reloc_error, Result};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ScanAction {
    /// The relocation resolves statically; nothing to do.
    None,
    /// Cannot be expressed in this output kind at all.
    Error,
    /// Import resolved by copying the definition next to the executable.
    Copyrel,
    /// Import resolved by pointing the symbol at a canonical PLT entry.
    Cplt,
    /// Function call resolved through the PLT.
    Plt,
    /// Emit a symbolic dynamic relocation at the site.
    Dynrel,
    /// Emit a base-relative dynamic relocation at the site.
    Baserel,
}

pub type ScanTable = [[ScanAction; 4]; 3];

/// Action table for absolute (pointer-sized, non-PC-relative)
/// relocations.
pub const DYN_ABSREL_TABLE: ScanTable = {
    use ScanAction::*;
    [
        // Absolute  Local    Imported data  Imported code
        [None, Baserel, Dynrel, Dynrel], // Shared object
        [None, Baserel, Dynrel, Dynrel], // Position-independent exec
        [None, None, Copyrel, Cplt],     // Position-dependent exec
    ]
};

/// Action table for PC-relative relocations.
pub const PCREL_TABLE: ScanTable = {
    use ScanAction::*;
    [
        // Absolute  Local    Imported data  Imported code
        [Error, None, Error, Plt],    // Shared object
        [Error, None, Copyrel, Plt],  // Position-independent exec
        [None, None, Copyrel, Cplt],  // Position-dependent exec
    ]
};

/// Column index: absolute / local / imported data / imported code.
fn sym_column(sym: &Symbol) -> usize {
    if sym.is_absolute {
        0
    } else if !sym.is_imported {
        1
    } else if sym.is_func() {
        3
    } else {
        2
    }
}

#[inline]
pub fn get_action(opts: &LinkOptions, table: &ScanTable, sym: &Symbol) -> ScanAction {
    table[opts.output_kind.row()][sym_column(sym)]
}

/// Shared state of the parallel scan. Everything is read-only or updated
/// with idempotent atomic operations.
pub struct ScanCtx<'a> {
    pub opts: &'a LinkOptions,
    pub machine: Machine,
    pub symbols: &'a [Symbol],
    pub diags: &'a Diagnostics,
    pub needs_tlsld: &'a AtomicBool,
}

impl<'a> ScanCtx<'a> {
    /// Interpret a table action for one relocation. Returns how many
    /// dynamic relocation entries the site reserves.
    pub(crate) fn scan_rel(
        &self,
        sec_name: &str,
        sym_id: usize,
        r_type: u32,
        table: &ScanTable,
    ) -> u32 {
        let sym = &self.symbols[sym_id];
        match get_action(self.opts, table, sym) {
            ScanAction::None => 0,
            ScanAction::Error => {
                self.diags
                    .error(illegal_reloc_error(sec_name, &sym.name, r_type));
                0
            }
            ScanAction::Copyrel => {
                sym.add_flags(Needs::COPYREL);
                0
            }
            ScanAction::Cplt | ScanAction::Plt => {
                sym.add_flags(Needs::PLT);
                0
            }
            ScanAction::Dynrel | ScanAction::Baserel => 1,
        }
    }
}

fn scan_file<A: Arch>(scx: &ScanCtx, file: &mut InputFile) {
    let InputFile {
        sections,
        symbols: file_syms,
        num_dynrel,
        ..
    } = file;
    let file_syms: &[usize] = file_syms;
    let num_dynrel: &AtomicU32 = num_dynrel;
    // Sections of the same file scan concurrently; each one reserves its
    // dyn-reloc span with an atomic pre-increment of the file counter.
    sections.par_iter_mut().for_each(|isec| {
        if !isec.is_alloc() {
            return;
        }
        // Routing slots are sized here so the thunk planner and the
        // applier can index them blindly.
        isec.extra.range_extn = vec![RangeExtnRef::NONE; isec.relocs.len()];
        if let Err(err) = A::scan_relocations(scx, file_syms, num_dynrel, isec) {
            scx.diags.fatal(err);
        }
    });
}

fn scan_all_inner<A: Arch>(ctx: &mut Context) -> Result<()> {
    let Context {
        files,
        symbols,
        opts,
        diags,
        needs_tlsld,
        machine,
        ..
    } = ctx;
    let scx = ScanCtx {
        opts,
        machine: *machine,
        symbols,
        diags,
        needs_tlsld,
    };
    files
        .par_iter_mut()
        .for_each(|file| scan_file::<A>(&scx, file));
    ctx.diags.check()
}

/// Scan every allocatable input section in parallel; parallelism is at
/// section granularity, so a link of few files with many sections still
/// saturates the pool. Fatal diagnostics abort the link only after the
/// whole phase has run.
pub fn scan_all(ctx: &mut Context) -> Result<()> {
    log::debug!("scanning relocations of {} files", ctx.files.len());
    with_arch!(ctx.machine, scan_all_inner, ctx)
}

/// Helper for back-end scanners: charge `count` dynamic relocations to
/// the owning file and stamp the section's pre-increment offset.
#[inline]
pub(crate) fn reserve_dynrels(num_dynrel: &AtomicU32, count: u32) -> u32 {
    num_dynrel.fetch_add(count, Ordering::Relaxed)
}
