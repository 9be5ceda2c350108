//! The per-link context: options, the symbol and section model, the
//! synthetic table singletons and the layout addresses the collaborating
//! layout pass fills in.

use std::sync::atomic::AtomicBool;

use crate::arch::Machine;
use crate::dynamic::{CopyrelSection, GotPltSection, GotSection, PltGotSection, PltSection, RelDynSection};
use crate::input::{InputFile, InputSection};
use crate::opts::LinkOptions;
use crate::output::OutputSection;
use crate::sched::Diagnostics;
use crate::symbol::{Symbol, SymbolInterner};

pub struct Context {
    pub opts: LinkOptions,
    pub machine: Machine,
    pub files: Vec<InputFile>,
    pub symbols: Vec<Symbol>,
    pub interner: SymbolInterner,
    pub output_sections: Vec<OutputSection>,
    pub got: GotSection,
    pub gotplt: GotPltSection,
    pub plt: PltSection,
    pub pltgot: PltGotSection,
    pub copyrel: CopyrelSection,
    pub reldyn: RelDynSection,
    /// Start of the TLS initialization image.
    pub tls_begin: u64,
    /// The thread pointer the chosen variant-I/II model resolves against.
    pub tp_addr: u64,
    /// PPC64: address of `.got + 0x8000`, the TOC pointer value.
    pub toc_addr: u64,
    /// Process-wide flag: some input used the TLS local-dynamic model.
    pub needs_tlsld: AtomicBool,
    pub diags: Diagnostics,
}

impl Context {
    pub fn new(machine: Machine, opts: LinkOptions) -> Self {
        Self {
            opts,
            machine,
            files: Vec::new(),
            symbols: Vec::new(),
            interner: SymbolInterner::default(),
            output_sections: Vec::new(),
            got: GotSection::new(),
            gotplt: GotPltSection::new(machine.gotplt_reserved()),
            plt: PltSection::new(),
            pltgot: PltGotSection::new(),
            copyrel: CopyrelSection::new(),
            reldyn: RelDynSection::new(),
            tls_begin: 0,
            tp_addr: 0,
            toc_addr: 0,
            needs_tlsld: AtomicBool::new(false),
            diags: Diagnostics::new(),
        }
    }

    pub fn add_file(&mut self, name: &str) -> usize {
        self.files.push(InputFile::new(name));
        self.files.len() - 1
    }

    /// Register a symbol. Non-local symbols are interned by name, so the
    /// same global referenced from several files resolves to one record.
    pub fn add_symbol(&mut self, sym: Symbol) -> usize {
        if !sym.is_local() && !sym.name.is_empty() {
            if let Some(id) = self.interner.get(&sym.name) {
                return id;
            }
            self.interner.insert(&sym.name, self.symbols.len());
        }
        self.symbols.push(sym);
        self.symbols.len() - 1
    }

    pub fn add_output_section(&mut self, osec: OutputSection) -> usize {
        self.output_sections.push(osec);
        self.output_sections.len() - 1
    }

    /// Identity string carried in the `.comment` section of every output.
    pub fn comment_string() -> String {
        format!("parlink {}", env!("CARGO_PKG_VERSION"))
    }

    /// Shared read-only view for single-threaded callers. The parallel
    /// drivers assemble the same view themselves from split borrows so
    /// `files` can be iterated mutably at the same time.
    pub fn view(&self) -> LinkView<'_> {
        LinkView {
            opts: &self.opts,
            machine: self.machine,
            symbols: &self.symbols,
            osecs: &self.output_sections,
            got: &self.got,
            gotplt: &self.gotplt,
            plt: &self.plt,
            pltgot: &self.pltgot,
            copyrel: &self.copyrel,
            tls_begin: self.tls_begin,
            tp_addr: self.tp_addr,
            toc_addr: self.toc_addr,
            diags: &self.diags,
        }
    }
}

/// Everything the scan/plan/apply hot loops share read-only across worker
/// threads.
#[derive(Clone, Copy)]
pub struct LinkView<'a> {
    pub opts: &'a LinkOptions,
    pub machine: Machine,
    pub symbols: &'a [Symbol],
    pub osecs: &'a [OutputSection],
    pub got: &'a GotSection,
    pub gotplt: &'a GotPltSection,
    pub plt: &'a PltSection,
    pub pltgot: &'a PltGotSection,
    pub copyrel: &'a CopyrelSection,
    pub tls_begin: u64,
    pub tp_addr: u64,
    pub toc_addr: u64,
    pub diags: &'a Diagnostics,
}

impl<'a> LinkView<'a> {
    #[inline]
    pub fn sym(&self, id: usize) -> &'a Symbol {
        &self.symbols[id]
    }

    #[inline]
    pub fn word(&self) -> u64 {
        self.machine.word_size()
    }

    /// The address a data reference to the symbol resolves to. Imported
    /// functions with a PLT resolve to their (canonical) PLT entry so
    /// function pointers compare equal across modules; a remaining
    /// undefined weak resolves to zero.
    pub fn sym_addr(&self, id: usize) -> u64 {
        let sym = &self.symbols[id];
        if sym.has_plt() && (sym.is_imported || sym.is_ifunc) {
            return self.plt_addr(id);
        }
        if sym.is_remaining_undef_weak() {
            return 0;
        }
        if sym.copyrel_offset >= 0 {
            return self.copyrel.sh_addr + sym.copyrel_offset as u64;
        }
        sym.value
    }

    /// ARM32: does a branch to this symbol land in Thumb state?
    #[inline]
    pub fn sym_is_thumb(&self, id: usize) -> bool {
        let sym = &self.symbols[id];
        sym.is_thumb && !sym.has_plt() && !sym.is_remaining_undef_weak()
    }

    #[inline]
    pub fn got_base(&self) -> u64 {
        self.got.sh_addr
    }

    #[inline]
    pub fn got_addr(&self, id: usize) -> u64 {
        debug_assert!(self.symbols[id].has_got());
        self.got.sh_addr + self.symbols[id].got_idx as u64 * self.word()
    }

    /// The symbol's GOT slot offset relative to the GOT base.
    #[inline]
    pub fn got_offset(&self, id: usize) -> u64 {
        self.symbols[id].got_idx as u64 * self.word()
    }

    #[inline]
    pub fn gotplt_addr(&self, id: usize) -> u64 {
        debug_assert!(self.symbols[id].plt_idx >= 0);
        self.gotplt.sh_addr
            + (self.gotplt.reserved + self.symbols[id].plt_idx as u64) * self.word()
    }

    pub fn plt_addr(&self, id: usize) -> u64 {
        let sym = &self.symbols[id];
        if sym.plt_idx >= 0 {
            self.plt.sh_addr
                + self.machine.plt_hdr_size()
                + sym.plt_idx as u64 * self.machine.plt_entry_size()
        } else {
            debug_assert!(sym.pltgot_idx >= 0);
            self.pltgot.sh_addr + sym.pltgot_idx as u64 * self.machine.pltgot_entry_size()
        }
    }

    #[inline]
    pub fn tlsgd_addr(&self, id: usize) -> u64 {
        debug_assert!(self.symbols[id].has_tlsgd());
        self.got.sh_addr + self.symbols[id].tlsgd_idx as u64 * self.word()
    }

    #[inline]
    pub fn gottp_addr(&self, id: usize) -> u64 {
        debug_assert!(self.symbols[id].has_gottp());
        self.got.sh_addr + self.symbols[id].gottp_idx as u64 * self.word()
    }

    #[inline]
    pub fn tlsdesc_addr(&self, id: usize) -> u64 {
        debug_assert!(self.symbols[id].has_tlsdesc());
        self.got.sh_addr + self.symbols[id].tlsdesc_idx as u64 * self.word()
    }

    #[inline]
    pub fn tlsld_addr(&self) -> u64 {
        debug_assert!(self.got.tlsld_idx >= 0);
        self.got.sh_addr + self.got.tlsld_idx as u64 * self.word()
    }

    /// Virtual address of an input section after layout.
    #[inline]
    pub fn isec_addr(&self, isec: &InputSection) -> u64 {
        self.osecs[isec.output_section].shdr.sh_addr + isec.offset
    }

    /// Address of thunk symbol slot `(thunk_idx, sym_idx)` inside `osec`.
    pub fn thunk_slot_addr(&self, osec_idx: usize, thunk_idx: usize, sym_idx: usize) -> u64 {
        let osec = &self.osecs[osec_idx];
        osec.thunks[thunk_idx].slot_addr(
            osec.shdr.sh_addr,
            self.machine.thunk_hdr_size(),
            self.machine.thunk_size(),
            sym_idx,
        )
    }
}
