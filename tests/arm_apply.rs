//! ARM applier semantics: immediate encoders, GOT/TLS value computation,
//! TLS-descriptor addend convention, tombstones and the exception-index
//! post-pass.

mod common;

use common::*;
use parlink::arch::arm::*;
use parlink::symbol::Needs;
use parlink::{
    apply_all, assign_indices, emit_synthetic_sections, plan_thunks, scan_all, Error, LinkOptions,
};

fn run(ctx: &mut parlink::Context) {
    scan_all(ctx).unwrap();
    assign_indices(ctx);
    set_table_addrs(ctx);
    plan_thunks(ctx);
    emit_synthetic_sections(ctx);
    apply_all(ctx).unwrap();
}

#[test]
fn movw_movt_pairs_encode_the_address_halves() {
    let mut ctx = arm_ctx(LinkOptions::default());
    ctx.add_file("a.o");
    let target = ctx.add_symbol(data("obj", 0x1234_5678));

    let mut text = code_section(".text", 16);
    write_u32(&mut text.bytes[0..4], 0xe300_0000); // movw r0, #0
    write_u32(&mut text.bytes[4..8], 0xe340_0000); // movt r0, #0
    write_u16(&mut text.bytes[8..10], 0xf240); // movw.w r0, #0
    write_u16(&mut text.bytes[10..12], 0x0000);
    write_u16(&mut text.bytes[12..14], 0xf2c0); // movt.w r0, #0
    write_u16(&mut text.bytes[14..16], 0x0000);
    text.relocs = vec![
        rel(0, R_ARM_MOVW_ABS_NC, 0, 0),
        rel(4, R_ARM_MOVT_ABS, 0, 0),
        rel(8, R_ARM_THM_MOVW_ABS_NC, 0, 0),
        rel(12, R_ARM_THM_MOVT_ABS, 0, 0),
    ];
    add_exec_osec(&mut ctx, ".text", 0x1_0000, vec![text]);
    ctx.files[0].symbols = vec![target];

    run(&mut ctx);
    let bytes = &ctx.files[0].sections[0].bytes;
    assert_eq!(read_u32(&bytes[0..4]), 0xe305_0678); // #0x5678
    assert_eq!(read_u32(&bytes[4..8]), 0xe341_0234); // #0x1234

    // Thumb MOVW: imm4=5 i=0 imm3=6 imm8=0x78
    assert_eq!(read_u16(&bytes[8..10]), 0xf245);
    assert_eq!(read_u16(&bytes[10..12]), 0x6078);
    // Thumb MOVT: imm4=1 i=0 imm3=2 imm8=0x34
    assert_eq!(read_u16(&bytes[12..14]), 0xf2c1);
    assert_eq!(read_u16(&bytes[14..16]), 0x2034);
}

#[test]
fn got_relative_forms_use_the_slot_and_base() {
    let mut ctx = arm_ctx(LinkOptions::shared());
    ctx.add_file("a.o");
    let ext = ctx.add_symbol(import_data("ext", 4));

    let mut text = code_section(".text", 16);
    text.relocs = vec![
        rel(0, R_ARM_GOT_PREL, 0, 0),
        rel(4, R_ARM_GOT_BREL, 0, 0),
        rel(8, R_ARM_BASE_PREL, 0, 0),
    ];
    add_exec_osec(&mut ctx, ".text", 0x1_0000, vec![text]);
    ctx.files[0].symbols = vec![ext];

    run(&mut ctx);
    let got = ctx.got.sh_addr;
    let g = ctx.symbols[ext].got_idx as u64 * 4;
    let bytes = &ctx.files[0].sections[0].bytes;
    assert_eq!(read_u32(&bytes[0..4]), (got + g - 0x1_0000) as u32);
    assert_eq!(read_u32(&bytes[4..8]), g as u32);
    assert_eq!(read_u32(&bytes[8..12]), (got - 0x1_0008) as u32);
}

#[test]
fn tls_values_resolve_against_tp_and_got() {
    let mut ctx = arm_ctx(LinkOptions::default());
    ctx.add_file("a.o");
    let mut tls = data("tls_var", 0);
    tls.esym.st_type = elf::abi::STT_TLS;
    let tls = ctx.add_symbol(tls);
    let ie = ctx.add_symbol({
        let mut sym = import_data("tls_ext", 4);
        sym.esym.st_type = elf::abi::STT_TLS;
        sym
    });

    let mut text = code_section(".text", 16);
    text.relocs = vec![
        rel(0, R_ARM_TLS_LE32, 0, 0),
        rel(4, R_ARM_TLS_IE32, 1, 0),
        rel(8, R_ARM_TLS_LDM32, 0, 0),
        rel(12, R_ARM_TLS_LDO32, 0, 0),
    ];
    add_exec_osec(&mut ctx, ".text", 0x1_0000, vec![text]);
    ctx.files[0].symbols = vec![tls, ie];

    scan_all(&mut ctx).unwrap();
    assign_indices(&mut ctx);
    set_table_addrs(&mut ctx);
    ctx.symbols[tls].value = ctx.tls_begin + 0x10;
    plan_thunks(&mut ctx);
    emit_synthetic_sections(&mut ctx);
    apply_all(&mut ctx).unwrap();

    let bytes = &ctx.files[0].sections[0].bytes;
    assert_eq!(read_u32(&bytes[0..4]), 0x10); // S - tp
    let gottp = ctx.got.sh_addr + ctx.symbols[ie].gottp_idx as u64 * 4;
    assert_eq!(read_u32(&bytes[4..8]), (gottp - 0x1_0004) as u32);
    let tlsld = ctx.got.sh_addr + ctx.got.tlsld_idx as u64 * 4;
    assert_eq!(read_u32(&bytes[8..12]), (tlsld - 0x1_0008) as u32);
    assert_eq!(read_u32(&bytes[12..16]), 0x10); // S - tls_begin
}

/// Bit 0 of the TLS_GOTDESC addend records the instruction set of the
/// matching call site: the applier subtracts 6 for Thumb and 4 for ARM.
#[test]
fn tlsdesc_addend_bit_selects_the_site_correction() {
    let mut ctx = arm_ctx(LinkOptions::shared());
    ctx.add_file("a.o");
    let mut tls = data("tls_var", 0x40_0010);
    tls.esym.st_type = elf::abi::STT_TLS;
    let tls = ctx.add_symbol(tls);

    let mut text = code_section(".text", 8);
    text.relocs = vec![
        rel(0, R_ARM_TLS_GOTDESC, 0, 8), // ARM site (even addend)
        rel(4, R_ARM_TLS_GOTDESC, 0, 9), // Thumb site (odd addend)
    ];
    add_exec_osec(&mut ctx, ".text", 0x1_0000, vec![text]);
    ctx.files[0].symbols = vec![tls];

    scan_all(&mut ctx).unwrap();
    assert!(ctx.symbols[tls].flags().contains(Needs::TLSDESC));
    assign_indices(&mut ctx);
    set_table_addrs(&mut ctx);
    plan_thunks(&mut ctx);
    emit_synthetic_sections(&mut ctx);
    apply_all(&mut ctx).unwrap();

    let desc = ctx.got.sh_addr + ctx.symbols[tls].tlsdesc_idx as u64 * 4;
    let bytes = &ctx.files[0].sections[0].bytes;
    let arm_site = desc.wrapping_sub(0x1_0000).wrapping_add(8).wrapping_sub(4);
    let thumb_site = desc.wrapping_sub(0x1_0004).wrapping_add(9).wrapping_sub(6);
    assert_eq!(read_u32(&bytes[0..4]), arm_site as u32);
    assert_eq!(read_u32(&bytes[4..8]), thumb_site as u32);
}

/// In an executable the descriptor relaxes away: imported targets go
/// through a GOT-TP slot, local ones become plain TP offsets, and the
/// descriptor call itself is erased.
#[test]
fn tlsdesc_relaxes_outside_shared_objects() {
    let mut ctx = arm_ctx(LinkOptions::default());
    ctx.add_file("a.o");
    let mut tls = data("tls_var", 0);
    tls.esym.st_type = elf::abi::STT_TLS;
    let tls = ctx.add_symbol(tls);

    let mut text = code_section(".text", 8);
    text.relocs = vec![
        rel(0, R_ARM_TLS_GOTDESC, 0, 0),
        rel(4, R_ARM_TLS_CALL, 0, 0),
    ];
    add_exec_osec(&mut ctx, ".text", 0x1_0000, vec![text]);
    ctx.files[0].symbols = vec![tls];

    scan_all(&mut ctx).unwrap();
    assert!(!ctx.symbols[tls].flags().contains(Needs::TLSDESC));
    assign_indices(&mut ctx);
    set_table_addrs(&mut ctx);
    ctx.symbols[tls].value = ctx.tls_begin + 0x20;
    plan_thunks(&mut ctx);
    assert!(ctx.output_sections[0].thunks.is_empty(), "no trampoline needed");
    emit_synthetic_sections(&mut ctx);
    apply_all(&mut ctx).unwrap();

    let bytes = &ctx.files[0].sections[0].bytes;
    // Relaxed to LE: the call is erased.
    assert_eq!(read_u32(&bytes[4..8]), ARM_NOP);
}

#[test]
fn out_of_range_value_reports_the_window() {
    let mut ctx = arm_ctx(LinkOptions::default());
    ctx.add_file("a.o");
    let near = ctx.add_symbol(func("near", 0x1_0000 + 0x1_0000));

    let mut text = code_section(".text", 4);
    text.relocs = vec![rel(0, R_ARM_THM_JUMP11, 0, 0)];
    add_exec_osec(&mut ctx, ".text", 0x1_0000, vec![text]);
    ctx.files[0].symbols = vec![near];

    run(&mut ctx);
    let errors = ctx.diags.take_errors();
    assert_eq!(errors.len(), 1);
    let msg = errors[0].to_string();
    assert!(
        msg.contains("65536 is not in [-2048, 2048)"),
        "unexpected message: {msg}"
    );
}

#[test]
fn debug_references_to_discarded_fragments_get_tombstones() {
    let mut ctx = arm_ctx(LinkOptions::default());
    ctx.add_file("a.o");
    let live = ctx.add_symbol(func("live", 0x2_0000));
    let mut dead = func("dead", 0x2_1000);
    dead.discarded = true;
    let dead = ctx.add_symbol(dead);

    let mut info = debug_section(".debug_info", 8);
    info.relocs = vec![
        rel(0, R_ARM_ABS32, 0, 4),
        rel(4, R_ARM_ABS32, 1, 0),
    ];
    let mut loc = debug_section(".debug_loc", 4);
    loc.relocs = vec![rel(0, R_ARM_ABS32, 1, 0)];

    // Non-allocated sections never join an output section; park them on
    // the file directly.
    ctx.files[0].sections.push(info);
    ctx.files[0].sections.push(loc);
    ctx.files[0].symbols = vec![live, dead];
    // One real output section so the context is well-formed.
    add_exec_osec(&mut ctx, ".text", 0x1_0000, vec![code_section(".text", 4)]);

    run(&mut ctx);
    let file = &ctx.files[0];
    assert_eq!(read_u32(&file.sections[0].bytes[0..4]), 0x2_0004);
    assert_eq!(read_u32(&file.sections[0].bytes[4..8]), 0); // tombstone
    assert_eq!(read_u32(&file.sections[1].bytes[0..4]), 1); // loc tombstone
}

#[test]
fn exidx_entries_sort_by_function_address() {
    // Two entries in reverse function order. Addresses are self-relative
    // 31-bit fields: entry 0 points at +0x2000, entry 1 at +0x1000.
    let mut bytes = vec![0u8; 16];
    write_u32(&mut bytes[0..4], 0x2000);
    write_u32(&mut bytes[4..8], EXIDX_CANTUNWIND);
    write_u32(&mut bytes[8..12], 0x1000 - 8);
    write_u32(&mut bytes[12..16], 0x8000_0001); // inline unwind data

    fixup_exidx(".ARM.exidx", &mut bytes).unwrap();

    // Sorted: the 0x1000 function first, with fields self-relative again.
    assert_eq!(read_u32(&bytes[0..4]), 0x1000);
    assert_eq!(read_u32(&bytes[4..8]), 0x8000_0001);
    assert_eq!(read_u32(&bytes[8..12]), 0x2000 - 8);
    assert_eq!(read_u32(&bytes[12..16]), EXIDX_CANTUNWIND);

    // Translated addresses are strictly increasing.
    let a0 = parlink::utils::sign_extend(read_u32(&bytes[0..4]) as u64, 30);
    let a1 = parlink::utils::sign_extend(read_u32(&bytes[8..12]) as u64, 30) + 8;
    assert!(a0 < a1);
}

#[test]
fn exidx_relative_values_survive_the_sort() {
    let mut bytes = vec![0u8; 16];
    // Entry 0: function at +0x3000, extab pointer at +0x500 (relative).
    write_u32(&mut bytes[0..4], 0x3000);
    write_u32(&mut bytes[4..8], 0x500 - 4);
    // Entry 1: function at +0x1000, CANTUNWIND.
    write_u32(&mut bytes[8..12], 0x1000 - 8);
    write_u32(&mut bytes[12..16], EXIDX_CANTUNWIND);

    fixup_exidx(".ARM.exidx", &mut bytes).unwrap();

    // Entries swapped; the extab pointer still resolves to +0x500.
    assert_eq!(read_u32(&bytes[0..4]), 0x1000);
    assert_eq!(read_u32(&bytes[4..8]), EXIDX_CANTUNWIND);
    assert_eq!(read_u32(&bytes[8..12]), 0x3000 - 8);
    assert_eq!(read_u32(&bytes[12..16]), 0x500 - 8 - 4);
}

#[test]
fn exidx_size_must_be_a_multiple_of_entry_size() {
    let mut bytes = vec![0u8; 12];
    let err = fixup_exidx(".ARM.exidx", &mut bytes).unwrap_err();
    assert!(matches!(err, Error::MalformedSection { size: 12, .. }));
    assert!(err.to_string().contains("invalid section size"));
}
