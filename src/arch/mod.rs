//! Per-target back-ends and the capability set the shared engine is
//! polymorphic over. Unlike a runtime loader, a cross linker cannot pick
//! the back-end from the host architecture: every target is compiled in
//! and the dispatch happens once per link on [`Machine`], after which the
//! scan/apply loops run monomorphized per target.

pub mod arm;
pub mod ppc64;

pub use arm::Arm32;
pub use ppc64::Ppc64V2;

use std::sync::atomic::AtomicU32;

use elf::abi::{EM_ARM, EM_PPC64};

use crate::apply::DynRelWriter;
use crate::context::LinkView;
use crate::input::{InputSection, Reloc};
use crate::output::OutputSection;
use crate::scan::ScanCtx;
use crate::Result;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Machine {
    Arm32,
    Ppc64V2,
}

impl Machine {
    pub fn from_e_machine(e_machine: u16) -> Option<Machine> {
        match e_machine {
            EM_ARM => Some(Machine::Arm32),
            EM_PPC64 => Some(Machine::Ppc64V2),
            _ => None,
        }
    }

    pub fn e_machine(self) -> u16 {
        match self {
            Machine::Arm32 => EM_ARM,
            Machine::Ppc64V2 => EM_PPC64,
        }
    }

    pub fn word_size(self) -> u64 {
        match self {
            Machine::Arm32 => arm::Arm32::WORD_SIZE,
            Machine::Ppc64V2 => ppc64::Ppc64V2::WORD_SIZE,
        }
    }

    pub fn plt_hdr_size(self) -> u64 {
        match self {
            Machine::Arm32 => arm::Arm32::PLT_HDR_SIZE,
            Machine::Ppc64V2 => ppc64::Ppc64V2::PLT_HDR_SIZE,
        }
    }

    pub fn plt_entry_size(self) -> u64 {
        match self {
            Machine::Arm32 => arm::Arm32::PLT_ENTRY_SIZE,
            Machine::Ppc64V2 => ppc64::Ppc64V2::PLT_ENTRY_SIZE,
        }
    }

    pub fn pltgot_entry_size(self) -> u64 {
        match self {
            Machine::Arm32 => arm::Arm32::PLTGOT_ENTRY_SIZE,
            Machine::Ppc64V2 => ppc64::Ppc64V2::PLTGOT_ENTRY_SIZE,
        }
    }

    pub fn thunk_size(self) -> u64 {
        match self {
            Machine::Arm32 => arm::Arm32::THUNK_SIZE,
            Machine::Ppc64V2 => ppc64::Ppc64V2::THUNK_SIZE,
        }
    }

    pub fn thunk_hdr_size(self) -> u64 {
        match self {
            Machine::Arm32 => arm::Arm32::THUNK_HDR_SIZE,
            Machine::Ppc64V2 => ppc64::Ppc64V2::THUNK_HDR_SIZE,
        }
    }

    pub fn gotplt_reserved(self) -> u64 {
        match self {
            Machine::Arm32 => arm::Arm32::GOTPLT_RESERVED,
            Machine::Ppc64V2 => ppc64::Ppc64V2::GOTPLT_RESERVED,
        }
    }

    pub fn tls_dtv_offset(self) -> u64 {
        match self {
            Machine::Arm32 => arm::Arm32::TLS_DTV_OFFSET,
            Machine::Ppc64V2 => ppc64::Ppc64V2::TLS_DTV_OFFSET,
        }
    }
}

/// The closed capability set a back-end provides. One zero-sized type per
/// target; the shared drivers are generic over it so the hot loops carry
/// no dynamic dispatch.
pub trait Arch: 'static {
    const E_MACHINE: u16;
    const WORD_SIZE: u64;
    const GOTPLT_RESERVED: u64;
    const PLT_HDR_SIZE: u64;
    const PLT_ENTRY_SIZE: u64;
    const PLTGOT_ENTRY_SIZE: u64;
    const THUNK_HDR_SIZE: u64;
    const THUNK_SIZE: u64;
    /// Encoded reach of the direct branch the thunk planner works with.
    const BRANCH_REACH: i64;
    const TLS_DTV_OFFSET: u64;
    /// RELA (explicit addends) vs REL dynamic relocations.
    const USES_RELA: bool;

    // Dynamic relocation kinds of this target.
    const R_ABS: u32;
    const R_RELATIVE: u32;
    const R_GLOB_DAT: u32;
    const R_JUMP_SLOT: u32;
    const R_COPY: u32;
    const R_DTPMOD: u32;
    const R_DTPOFF: u32;
    const R_TPOFF: u32;
    const R_IRELATIVE: u32;
    const R_TLSDESC: u32;

    fn is_jump_reachable(disp: i64) -> bool;

    /// Call-type relocations the thunk planner considers for routing.
    fn is_call_reloc(r_type: u32) -> bool;

    /// Does this call site need a range-extension thunk? `p` is the site
    /// address the planner is currently assuming.
    fn needs_thunk(view: &LinkView, rel: &Reloc, sym_id: usize, p: u64) -> bool;

    /// Does this relocation require the common trampoline carried in the
    /// thunk header (ARM TLS descriptor calls)?
    fn needs_trampoline(_view: &LinkView, _rel: &Reloc, _sym_id: usize) -> bool {
        false
    }

    fn scan_relocations(
        scx: &ScanCtx,
        file_syms: &[usize],
        num_dynrel: &AtomicU32,
        isec: &mut InputSection,
    ) -> Result<()>;

    fn apply_reloc_alloc(
        view: &LinkView,
        file_syms: &[usize],
        isec: &mut InputSection,
        dynrel: &mut DynRelWriter,
    );

    fn apply_reloc_nonalloc(view: &LinkView, file_syms: &[usize], isec: &mut InputSection);

    /// Apply one `.eh_frame` relocation; `loc` addresses the patched word
    /// and `offset` is the site's offset inside the output `.eh_frame`.
    fn apply_eh_frame_reloc(
        view: &LinkView,
        rel: &Reloc,
        offset: u64,
        val: u64,
        loc: &mut [u8],
    ) -> Result<()>;

    fn write_plt_header(view: &LinkView, buf: &mut [u8]);
    fn write_plt_entry(view: &LinkView, buf: &mut [u8], sym_id: usize);
    fn write_pltgot_entry(view: &LinkView, buf: &mut [u8], sym_id: usize);

    /// Write one thunk's bytes. `buf` covers exactly the thunk's region
    /// inside the output section image.
    fn write_thunk(view: &LinkView, osec: &OutputSection, thunk_idx: usize, buf: &mut [u8]);

    /// Sentinel for debug references into discarded fragments; `None`
    /// keeps the computed value.
    fn get_tombstone(sec_name: &str, discarded: bool) -> Option<u64>;
}

/// Dispatch a generic function over the link's target, monomorphizing the
/// callee per back-end.
macro_rules! with_arch {
    ($machine:expr, $f:ident, $($arg:expr),* $(,)?) => {
        match $machine {
            $crate::arch::Machine::Arm32 => $f::<$crate::arch::arm::Arm32>($($arg),*),
            $crate::arch::Machine::Ppc64V2 => $f::<$crate::arch::ppc64::Ppc64V2>($($arg),*),
        }
    };
}
pub(crate) use with_arch;
