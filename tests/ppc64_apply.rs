//! PPC64 applier semantics: the `ha`/`lo` split, TOC-relative forms, the
//! DS low-bit discipline, the PLT resolver stub and the `.eh_frame`
//! relocator.

mod common;

use common::*;
use parlink::arch::ppc64::*;
use parlink::arch::{Arch, Ppc64V2};
use parlink::input::Reloc;
use parlink::{
    apply_all, assign_indices, emit_synthetic_sections, plan_thunks, scan_all, Error, LinkOptions,
};
use rstest::rstest;

fn run(ctx: &mut parlink::Context) -> parlink::Result<()> {
    scan_all(ctx)?;
    assign_indices(ctx);
    set_table_addrs(ctx);
    plan_thunks(ctx);
    emit_synthetic_sections(ctx);
    apply_all(ctx)
}

/// Property 7: `(ha(x) << 16) + (i16)lo(x) == x` for the whole 64-bit
/// range, because `ha` rounds before shifting.
#[rstest]
#[case(0)]
#[case(1)]
#[case(0x7fff)]
#[case(0x8000)]
#[case(0x8001)]
#[case(0xffff)]
#[case(0x1_0000)]
#[case(0x1234_5678)]
#[case(0x1234_8000)]
#[case(0xffff_ffff_ffff_8000)]
#[case(0x8000_0000_0000_0000)]
#[case(u64::MAX)]
fn ha_lo_round_trip(#[case] x: u64) {
    let reconstructed =
        (ha(x) << 16).wrapping_add((lo(x) as u16 as i16) as i64 as u64);
    assert_eq!(reconstructed, x);
}

#[test]
fn toc_relative_forms_split_the_offset() {
    let mut ctx = ppc_ctx(LinkOptions::default());
    ctx.add_file("a.o");
    let obj = ctx.add_symbol(data("obj", 0));

    let mut text = code_section(".text", 16);
    // DS forms carry opcode bits in the low two bits of the D field.
    write_u16(&mut text.bytes[8..10], 0x0001);
    text.relocs = vec![
        rel(0, R_PPC64_TOC16_HA, 0, 0),
        rel(4, R_PPC64_TOC16_LO, 0, 0),
        rel(8, R_PPC64_TOC16_LO_DS, 0, 0),
        rel(12, R_PPC64_REL16_HA, 0, 0),
    ];
    add_exec_osec(&mut ctx, ".text", 0x1_0000, vec![text]);
    ctx.files[0].symbols = vec![obj];

    scan_all(&mut ctx).unwrap();
    assign_indices(&mut ctx);
    set_table_addrs(&mut ctx);
    ctx.symbols[obj].value = ctx.toc_addr + 0x1_8008;
    plan_thunks(&mut ctx);
    emit_synthetic_sections(&mut ctx);
    apply_all(&mut ctx).unwrap();

    let bytes = &ctx.files[0].sections[0].bytes;
    // S - TOC = 0x18008: ha = 2 (rounded up), lo = 0x8008.
    assert_eq!(read_u16(&bytes[0..2]), 2);
    assert_eq!(read_u16(&bytes[4..6]), 0x8008);
    // DS form ORs, keeping the low opcode bits.
    assert_eq!(read_u16(&bytes[8..10]), 0x8008 | 1);
    // REL16_HA against P = 0x1_000c.
    let expected = ha((ctx.toc_addr + 0x1_8008).wrapping_sub(0x1_000c)) as u16;
    assert_eq!(read_u16(&bytes[12..14]), expected);
}

#[test]
fn plt16_forms_address_the_got_slot_toc_relative() {
    let mut ctx = ppc_ctx(LinkOptions::default());
    ctx.add_file("a.o");
    let ext = ctx.add_symbol(import_func("ext_fn"));

    let mut text = code_section(".text", 8);
    text.relocs = vec![
        rel(0, R_PPC64_PLT16_HA, 0, 0),
        rel(4, R_PPC64_PLT16_LO, 0, 0),
    ];
    add_exec_osec(&mut ctx, ".text", 0x1_0000, vec![text]);
    ctx.files[0].symbols = vec![ext];

    run(&mut ctx).unwrap();
    // PLT16_* loads the function's GOT slot relative to the TOC.
    assert!(ctx.symbols[ext].has_got());
    let g = ctx.symbols[ext].got_idx as u64 * 8;
    let val = (ctx.got.sh_addr + g).wrapping_sub(ctx.toc_addr);
    let bytes = &ctx.files[0].sections[0].bytes;
    assert_eq!(read_u16(&bytes[0..2]), ha(val) as u16);
    assert_eq!(read_u16(&bytes[4..6]), lo(val) as u16);
}

#[test]
fn reserved_local_entry_encoding_is_fatal() {
    let mut ctx = ppc_ctx(LinkOptions::default());
    ctx.add_file("a.o");
    let mut sym = func("f", 0x2_0000);
    sym.esym.st_other = 7 << 5;
    let sym = ctx.add_symbol(sym);

    let mut text = code_section(".text", 8);
    write_u32(&mut text.bytes[0..4], 0x4800_0001);
    text.relocs = vec![rel(0, R_PPC64_REL24, 0, 0)];
    add_exec_osec(&mut ctx, ".text", 0x1_0000, vec![text]);
    ctx.files[0].symbols = vec![sym];

    let err = run(&mut ctx).unwrap_err();
    assert!(matches!(err, Error::ReservedEncoding { .. }));
    assert!(err.to_string().contains("local entry offset 7 is reserved"));
}

#[test]
fn plt_header_preserves_lr_and_patches_the_gotplt_distance() {
    let mut ctx = ppc_ctx(LinkOptions::default());
    ctx.add_file("a.o");
    let ext = ctx.add_symbol(import_func("ext_fn"));

    let mut text = code_section(".text", 8);
    write_u32(&mut text.bytes[0..4], 0x4800_0001);
    text.relocs = vec![rel(0, R_PPC64_REL24, 0, 0)];
    add_exec_osec(&mut ctx, ".text", 0x1_0000, vec![text]);
    ctx.files[0].symbols = vec![ext];

    scan_all(&mut ctx).unwrap();
    assign_indices(&mut ctx);
    set_table_addrs(&mut ctx);
    plan_thunks(&mut ctx);
    let images = emit_synthetic_sections(&mut ctx);

    let plt = &images.plt;
    assert_eq!(plt.len(), 60 + 4);
    // The stub parks LR in r0 around the bcl and restores it before
    // dispatching into the resolver.
    assert_eq!(read_u32(&plt[0..4]), 0x7c08_02a6); // mflr r0
    assert_eq!(read_u32(&plt[4..8]), 0x429f_0005); // bcl 20,31,.+4
    assert_eq!(read_u32(&plt[8..12]), 0x7d68_02a6); // mflr r11
    assert_eq!(read_u32(&plt[12..16]), 0x7c08_03a6); // mtlr r0
    let quad = read_u64(&plt[52..60]);
    assert_eq!(quad, ctx.gotplt.sh_addr.wrapping_sub(ctx.plt.sh_addr + 8));

    // Entry 0: `bl plt0`, a backward 24-bit branch over the header.
    let entry = read_u32(&plt[60..64]);
    assert_eq!(entry, 0x4b00_0000 | (0u64.wrapping_sub(60) & 0x00ff_ffff) as u32);

    // PLT-GOT entries are dummies; thunks read the GOT directly.
    let mut buf = vec![0u8; 4];
    Ppc64V2::write_pltgot_entry(&ctx.view(), &mut buf, ext);
    assert_eq!(read_u32(&buf), PPC64_NOP);
}

#[test]
fn eh_frame_accepts_only_address_and_relative_kinds() {
    let ctx = ppc_ctx(LinkOptions::default());
    let view = ctx.view();
    let mk = |r_type| Reloc {
        r_offset: 0,
        r_type,
        r_sym: 0,
        r_addend: 0,
    };

    let mut buf = vec![0u8; 8];
    Ppc64V2::apply_eh_frame_reloc(&view, &mk(R_PPC64_ADDR64), 0x10, 0x1234, &mut buf).unwrap();
    assert_eq!(read_u64(&buf), 0x1234);

    Ppc64V2::apply_eh_frame_reloc(&view, &mk(R_PPC64_REL32), 0x10, 0x1234, &mut buf).unwrap();
    assert_eq!(read_u32(&buf[0..4]), 0x1224);

    Ppc64V2::apply_eh_frame_reloc(&view, &mk(R_PPC64_REL64), 0x10, 0x1234, &mut buf).unwrap();
    assert_eq!(read_u64(&buf), 0x1224);

    let err = Ppc64V2::apply_eh_frame_reloc(&view, &mk(R_PPC64_ADDR32), 0, 0, &mut buf)
        .unwrap_err();
    assert!(matches!(err, Error::UnknownRelocation { .. }));
}

#[test]
fn nonalloc_kinds_are_absolute_and_tls_offsets() {
    let mut ctx = ppc_ctx(LinkOptions::default());
    ctx.add_file("a.o");
    let live = ctx.add_symbol(func("live", 0x2_0000));
    let mut tls = data("tls_var", 0);
    tls.esym.st_type = elf::abi::STT_TLS;
    let tls = ctx.add_symbol(tls);

    let mut info = debug_section(".debug_info", 20);
    info.relocs = vec![
        rel(0, R_PPC64_ADDR64, 0, 8),
        rel(8, R_PPC64_ADDR32, 0, 0),
        rel(12, R_PPC64_DTPREL64, 1, 0),
    ];
    ctx.files[0].sections.push(info);
    ctx.files[0].symbols = vec![live, tls];
    add_exec_osec(&mut ctx, ".text", 0x1_0000, vec![code_section(".text", 4)]);

    scan_all(&mut ctx).unwrap();
    assign_indices(&mut ctx);
    set_table_addrs(&mut ctx);
    ctx.symbols[tls].value = ctx.tls_begin + 0x9000;
    plan_thunks(&mut ctx);
    emit_synthetic_sections(&mut ctx);
    apply_all(&mut ctx).unwrap();

    let bytes = &ctx.files[0].sections[0].bytes;
    assert_eq!(read_u64(&bytes[0..8]), 0x2_0008);
    assert_eq!(read_u32(&bytes[8..12]), 0x2_0000);
    // DTPREL: offset into the module's TLS block, biased by 0x8000.
    assert_eq!(read_u64(&bytes[12..20]), 0x9000 - 0x8000);
}
