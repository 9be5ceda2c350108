//! Relocation engine of a parallel ELF linker.
//!
//! This crate owns the middle of a static link: it scans relocations to
//! decide what dynamic machinery every symbol needs (GOT, PLT, copy
//! relocations, TLS descriptors), assigns slots in the synthetic tables,
//! plans range-extension thunks for branches that cannot reach their
//! target, and finally patches the relocated bytes of every input section.
//! Object parsing, symbol resolution, layout and output I/O are
//! collaborators: they fill the [`Context`] data model and consume the
//! patched bytes.
//!
//! Scanning and applying run in parallel across input sections — sections
//! of the same file included. The only shared mutable state is the
//! per-symbol needs-flag word (updated with an atomic `fetch_or`) and the
//! per-file dynamic-relocation counter, reserved with an atomic
//! pre-increment; slot indices and the stream layout are then fixed by a
//! single-threaded post-scan walk so the output is deterministic for a
//! given input order.

pub mod apply;
pub mod arch;
pub mod context;
pub mod dynamic;
pub mod hash;
pub mod input;
pub mod opts;
pub mod output;
pub mod scan;
pub mod sched;
pub mod symbol;
pub mod thunk;
pub mod utils;

pub use apply::apply_all;
pub use context::{Context, LinkView};
pub use dynamic::{assign_indices, emit_synthetic_sections, SyntheticImages};
pub use opts::{parse_args, HashStyle, LinkOptions, OutputKind};
pub use scan::scan_all;
pub use thunk::plan_thunks;

use std::fmt::{self, Display};

#[derive(Debug)]
pub enum Error {
    /// A relocation kind the back-end does not know about.
    UnknownRelocation {
        section: String,
        r_type: u32,
    },
    /// A computed relocation value does not fit its encoded field.
    RelocOutOfRange {
        section: String,
        symbol: String,
        r_type: u32,
        val: i64,
        lo: i64,
        hi: i64,
    },
    /// A relocation that cannot be expressed in this kind of output.
    IllegalRelocation {
        section: String,
        symbol: String,
        r_type: u32,
    },
    /// Relocation scan was asked to process a non-SHF_ALLOC section.
    NotAllocated {
        section: String,
    },
    MalformedSection {
        section: String,
        size: u64,
    },
    ReservedEncoding {
        symbol: String,
        msg: &'static str,
    },
    UnknownOption {
        token: String,
    },
    UndefinedSymbol {
        symbol: String,
        section: String,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnknownRelocation { section, r_type } => {
                write!(f, "{section}: unknown relocation type: {r_type}")
            }
            Error::RelocOutOfRange {
                section,
                symbol,
                r_type,
                val,
                lo,
                hi,
            } => write!(
                f,
                "{section}: relocation {r_type} against {symbol} out of range: \
                 {val} is not in [{lo}, {hi})"
            ),
            Error::IllegalRelocation {
                section,
                symbol,
                r_type,
            } => write!(
                f,
                "{section}: relocation {r_type} against {symbol} can not be used; \
                 recompile with -fPIC"
            ),
            Error::NotAllocated { section } => {
                write!(f, "{section}: relocation scan on non-allocated section")
            }
            Error::MalformedSection { section, size } => {
                write!(f, "{section}: invalid section size: {size}")
            }
            Error::ReservedEncoding { symbol, msg } => write!(f, "{symbol}: {msg}"),
            Error::UnknownOption { token } => {
                write!(f, "unknown command line option: {token}")
            }
            Error::UndefinedSymbol { symbol, section } => {
                write!(f, "undefined symbol: {symbol}, referenced from {section}")
            }
        }
    }
}

impl std::error::Error for Error {}

#[cold]
#[inline(never)]
pub(crate) fn unknown_reloc_error(section: &str, r_type: u32) -> Error {
    Error::UnknownRelocation {
        section: section.to_string(),
        r_type,
    }
}

#[cold]
#[inline(never)]
pub(crate) fn out_of_range_error(
    section: &str,
    symbol: &str,
    r_type: u32,
    val: i64,
    lo: i64,
    hi: i64,
) -> Error {
    Error::RelocOutOfRange {
        section: section.to_string(),
        symbol: symbol.to_string(),
        r_type,
        val,
        lo,
        hi,
    }
}

#[cold]
#[inline(never)]
pub(crate) fn illegal_reloc_error(section: &str, symbol: &str, r_type: u32) -> Error {
    Error::IllegalRelocation {
        section: section.to_string(),
        symbol: symbol.to_string(),
        r_type,
    }
}

#[cold]
#[inline(never)]
pub(crate) fn not_allocated_error(section: &str) -> Error {
    Error::NotAllocated {
        section: section.to_string(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn malformed_section_error(section: &str, size: u64) -> Error {
    Error::MalformedSection {
        section: section.to_string(),
        size,
    }
}

#[cold]
#[inline(never)]
pub(crate) fn reserved_encoding_error(symbol: &str, msg: &'static str) -> Error {
    Error::ReservedEncoding {
        symbol: symbol.to_string(),
        msg,
    }
}

#[cold]
#[inline(never)]
pub(crate) fn unknown_option_error(token: &str) -> Error {
    Error::UnknownOption {
        token: token.to_string(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn undef_error(symbol: &str, section: &str) -> Error {
    Error::UndefinedSymbol {
        symbol: symbol.to_string(),
        section: section.to_string(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
