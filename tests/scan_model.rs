//! Scanner properties: flag unions are order-independent, dynamic
//! relocation reservations tile the per-file stream, table slots are
//! assigned at most once, and malformed inputs fail loudly.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use common::*;
use parlink::arch::arm::*;
use parlink::arch::{Arch, Arm32, Machine};
use parlink::scan::ScanCtx;
use parlink::sched::Diagnostics;
use parlink::symbol::Needs;
use parlink::{assign_indices, emit_synthetic_sections, scan_all, Error, LinkOptions};

fn build_shared_ctx(reverse: bool) -> parlink::Context {
    let mut ctx = arm_ctx(LinkOptions::shared());
    ctx.add_file("a.o");
    let s_local = ctx.add_symbol(data("local_var", 0x1000));
    let s_var = ctx.add_symbol(import_data("ext_var", 8));
    let s_fn = ctx.add_symbol(import_func("ext_fn"));

    let mut relocs = vec![
        rel(0, R_ARM_ABS32, 0, 0),
        rel(4, R_ARM_ABS32, 1, 0),
        rel(8, R_ARM_ABS32, 2, 0),
        rel(12, R_ARM_GOT_BREL, 1, 0),
        rel(16, R_ARM_THM_CALL, 2, -4),
        rel(20, R_ARM_TLS_LDM32, 0, 0),
    ];
    if reverse {
        relocs.reverse();
    }
    let mut text = code_section(".text", 0x40);
    text.relocs = relocs;

    let mut more = code_section(".text.more", 0x20);
    more.relocs = vec![rel(0, R_ARM_ABS32, 0, 4)];

    add_exec_osec(&mut ctx, ".text", 0x1_0000, vec![text, more]);
    ctx.files[0].symbols = vec![s_local, s_var, s_fn];
    ctx
}

#[test]
fn flag_union_is_scan_order_independent() {
    let mut fwd = build_shared_ctx(false);
    let mut rev = build_shared_ctx(true);
    scan_all(&mut fwd).unwrap();
    scan_all(&mut rev).unwrap();

    for (a, b) in fwd.symbols.iter().zip(rev.symbols.iter()) {
        assert_eq!(a.flags(), b.flags(), "symbol {}", a.name);
    }
    assert!(fwd.symbols[1].flags().contains(Needs::GOT));
    assert!(fwd.symbols[2].flags().contains(Needs::PLT));
    assert!(fwd.symbols[0].flags().is_empty());
    assert!(fwd.needs_tlsld.load(Ordering::Relaxed));
}

#[test]
fn dynrel_reservations_tile_the_file_stream() {
    let mut ctx = build_shared_ctx(false);
    scan_all(&mut ctx).unwrap();

    // Three ABS32 sites in .text, one in .text.more: four entries total.
    let total = ctx.files[0].num_dynrel.load(Ordering::Relaxed);
    assert_eq!(total, 4);

    // Sections of the same file scan concurrently, so which section's
    // pre-increment won is unspecified; the reservations must still tile
    // the file's stream without gap or overlap.
    let mut spans: Vec<(u32, u32)> = ctx.files[0]
        .sections
        .iter()
        .map(|isec| (isec.reldyn_offset, isec.num_dynrel))
        .collect();
    spans.sort_by_key(|&(off, _)| off);
    let mut cursor = 0;
    for (off, count) in spans {
        assert_eq!(off, cursor, "reservations must tile the stream");
        cursor += count;
    }
    assert_eq!(cursor, total);

    // The allocator's single-threaded walk re-bases the offsets at their
    // input-order prefix sums, making the stream layout deterministic.
    assign_indices(&mut ctx);
    emit_synthetic_sections(&mut ctx);
    let offsets: Vec<u32> = ctx.files[0]
        .sections
        .iter()
        .map(|isec| isec.reldyn_offset)
        .collect();
    assert_eq!(offsets, vec![0, 3]);
}

#[test]
fn table_slots_are_assigned_at_most_once() {
    let mut ctx = build_shared_ctx(false);
    scan_all(&mut ctx).unwrap();
    assign_indices(&mut ctx);

    let got_idx = ctx.symbols[1].got_idx;
    let plt_idx = ctx.symbols[2].plt_idx;
    assert!(got_idx >= 0);
    assert!(plt_idx >= 0);
    // ext_var: one GOT slot; TLS-LD pair: two more.
    assert_eq!(ctx.got.num_slots(), 3);
    assert_eq!(ctx.plt.syms.len(), 1);

    // The walk is idempotent: indices survive a second pass untouched.
    assign_indices(&mut ctx);
    assert_eq!(ctx.symbols[1].got_idx, got_idx);
    assert_eq!(ctx.symbols[2].plt_idx, plt_idx);
    assert_eq!(ctx.got.num_slots(), 3);
    assert_eq!(ctx.plt.syms.len(), 1);
}

#[test]
fn unknown_relocation_kind_is_fatal() {
    let mut ctx = arm_ctx(LinkOptions::default());
    ctx.add_file("a.o");
    let s = ctx.add_symbol(func("f", 0x1000));
    let mut text = code_section(".text", 8);
    text.relocs = vec![rel(0, 200, 0, 0)];
    add_exec_osec(&mut ctx, ".text", 0x1_0000, vec![text]);
    ctx.files[0].symbols = vec![s];

    let err = scan_all(&mut ctx).unwrap_err();
    assert!(matches!(err, Error::UnknownRelocation { r_type: 200, .. }));
    assert!(err.to_string().contains("unknown relocation type: 200"));
}

#[test]
fn scanning_a_non_allocated_section_is_an_error() {
    let opts = LinkOptions::default();
    let diags = Diagnostics::new();
    let needs_tlsld = AtomicBool::new(false);
    let scx = ScanCtx {
        opts: &opts,
        machine: Machine::Arm32,
        symbols: &[],
        diags: &diags,
        needs_tlsld: &needs_tlsld,
    };
    let num_dynrel = AtomicU32::new(0);
    let mut isec = debug_section(".debug_info", 8);
    let err = Arm32::scan_relocations(&scx, &[], &num_dynrel, &mut isec).unwrap_err();
    assert!(matches!(err, Error::NotAllocated { .. }));
}

#[test]
fn undefined_strong_reference_is_recorded() {
    let mut ctx = arm_ctx(LinkOptions::default());
    ctx.add_file("a.o");
    let mut undef = parlink::symbol::Symbol::new("missing");
    undef.esym.st_bind = elf::abi::STB_GLOBAL;
    let s = ctx.add_symbol(undef);
    let mut text = code_section(".text", 8);
    text.relocs = vec![rel(0, R_ARM_ABS32, 0, 0)];
    add_exec_osec(&mut ctx, ".text", 0x1_0000, vec![text]);
    ctx.files[0].symbols = vec![s];

    scan_all(&mut ctx).unwrap();
    let errors = ctx.diags.take_errors();
    assert!(errors
        .iter()
        .any(|e| matches!(e, Error::UndefinedSymbol { symbol, .. } if &**symbol == "missing")));
}
