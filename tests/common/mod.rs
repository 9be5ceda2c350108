#![allow(dead_code)]

use elf::abi::{SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, STB_GLOBAL, STB_WEAK, STT_FUNC, STT_OBJECT};

use parlink::arch::Machine;
use parlink::input::{InputSection, Reloc};
use parlink::output::OutputSection;
use parlink::symbol::{ElfSym, Symbol};
use parlink::{Context, LinkOptions};

pub fn arm_ctx(opts: LinkOptions) -> Context {
    Context::new(Machine::Arm32, opts)
}

pub fn ppc_ctx(opts: LinkOptions) -> Context {
    Context::new(Machine::Ppc64V2, opts)
}

/// A global function defined in file 0 at `addr`.
pub fn func(name: &str, addr: u64) -> Symbol {
    let mut sym = Symbol::new(name);
    sym.file = Some(0);
    sym.value = addr;
    sym.esym = ElfSym {
        st_type: STT_FUNC,
        st_bind: STB_GLOBAL,
        st_other: 0,
        st_size: 0,
    };
    sym
}

pub fn thumb_func(name: &str, addr: u64) -> Symbol {
    let mut sym = func(name, addr);
    sym.is_thumb = true;
    sym
}

pub fn data(name: &str, addr: u64) -> Symbol {
    let mut sym = Symbol::new(name);
    sym.file = Some(0);
    sym.value = addr;
    sym.esym = ElfSym {
        st_type: STT_OBJECT,
        st_bind: STB_GLOBAL,
        st_other: 0,
        st_size: 8,
    };
    sym
}

/// A function imported from a shared object.
pub fn import_func(name: &str) -> Symbol {
    let mut sym = func(name, 0);
    sym.is_imported = true;
    sym
}

/// A data object imported from a shared object.
pub fn import_data(name: &str, size: u64) -> Symbol {
    let mut sym = data(name, 0);
    sym.is_imported = true;
    sym.esym.st_size = size;
    sym
}

/// A symbol that stayed undefined-weak through resolution.
pub fn weak_undef(name: &str) -> Symbol {
    let mut sym = Symbol::new(name);
    sym.esym = ElfSym {
        st_type: STT_FUNC,
        st_bind: STB_WEAK,
        st_other: 0,
        st_size: 0,
    };
    sym
}

pub fn code_section(name: &str, size: usize) -> InputSection {
    InputSection::new(name, vec![0u8; size])
}

pub fn data_section(name: &str, size: usize) -> InputSection {
    let mut isec = InputSection::new(name, vec![0u8; size]);
    isec.sh_flags = (SHF_ALLOC | SHF_WRITE) as u64;
    isec.sh_addralign = 8;
    isec
}

pub fn debug_section(name: &str, size: usize) -> InputSection {
    let mut isec = InputSection::new(name, vec![0u8; size]);
    isec.sh_flags = 0;
    isec.sh_addralign = 1;
    isec
}

pub fn rel(r_offset: u64, r_type: u32, r_sym: u32, r_addend: i64) -> Reloc {
    Reloc {
        r_offset,
        r_type,
        r_sym,
        r_addend,
    }
}

/// Register one input file holding `sections`, all contributing to a
/// fresh executable output section at `addr`. Returns the output section
/// id. Member offsets are assigned contiguously; the thunk planner
/// re-lays them out when it runs.
pub fn add_exec_osec(ctx: &mut Context, name: &str, addr: u64, sections: Vec<InputSection>) -> usize {
    let file = ctx.files.len() - 1;
    let mut osec = OutputSection::new(name);
    osec.shdr.sh_addr = addr;
    osec.shdr.sh_flags = (SHF_ALLOC | SHF_EXECINSTR) as u64;
    osec.shdr.sh_addralign = 4;
    let osec_id = ctx.output_sections.len();

    let mut offset = 0u64;
    for mut isec in sections {
        isec.output_section = osec_id;
        isec.offset = offset;
        offset += isec.bytes.len() as u64;
        let sec_id = ctx.files[file].sections.len();
        osec.members.push((file, sec_id));
        ctx.files[file].sections.push(isec);
    }
    osec.shdr.sh_size = offset;
    ctx.add_output_section(osec)
}

/// Layout addresses used by most tests: tables well away from the code.
pub fn set_table_addrs(ctx: &mut Context) {
    ctx.got.sh_addr = 0x30_0000;
    ctx.gotplt.sh_addr = 0x31_0000;
    ctx.plt.sh_addr = 0x32_0000;
    ctx.pltgot.sh_addr = 0x33_0000;
    ctx.copyrel.sh_addr = 0x34_0000;
    ctx.reldyn.sh_addr = 0x35_0000;
    ctx.tls_begin = 0x40_0000;
    ctx.tp_addr = 0x40_0000;
    ctx.toc_addr = ctx.got.sh_addr + 0x8000;
}

pub fn read_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

pub fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

pub fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

pub fn write_u16(bytes: &mut [u8], val: u16) {
    bytes[..2].copy_from_slice(&val.to_le_bytes());
}

pub fn write_u32(bytes: &mut [u8], val: u32) {
    bytes[..4].copy_from_slice(&val.to_le_bytes());
}

pub fn write_u64(bytes: &mut [u8], val: u64) {
    bytes[..8].copy_from_slice(&val.to_le_bytes());
}
