//! Shared fixtures: an ELF writer over `object`, small x86-64 and Thumb
//! encoders for the instructions the tests need, and a scripted fake decoder.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use object::elf;
use object::write::elf::{FileHeader, SectionHeader, Sym, Writer};
use object::Endianness;
use privgate_core::backends::{
    ByteSource, DecodeError, DecodedInstruction, FlowKind, InstructionDecoder,
};
use privgate_core::model::{RawSection, RawSymbol, SectionFlags};
use privgate_core::services::Analysis;
use privgate_core::{AuditOptions, Auditor, PrivilegePolicy};

pub use object::elf::{
    EM_386, EM_ARM, EM_RISCV, EM_X86_64, SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_NOBITS,
    SHT_PROGBITS, STB_GLOBAL, STB_LOCAL, STT_FUNC, STT_NOTYPE, STT_OBJECT,
};

const SECTION_ALIGN: usize = 16;

struct SectionSpec {
    name: String,
    sh_type: u32,
    flags: u32,
    addr: u64,
    size: u64,
    data: Vec<u8>,
}

struct SymbolSpec {
    name: String,
    value: u64,
    size: u64,
    kind: u8,
    bind: u8,
}

/// Builds little-endian `ET_EXEC` images with section headers and a
/// `.symtab`, and no program headers. ARM and i386 images are ELF32.
pub struct ElfBuilder {
    machine: u16,
    sections: Vec<SectionSpec>,
    symbols: Vec<SymbolSpec>,
}

impl ElfBuilder {
    pub fn new(machine: u16) -> Self {
        Self { machine, sections: Vec::new(), symbols: Vec::new() }
    }

    pub fn x86_64() -> Self {
        Self::new(EM_X86_64)
    }

    pub fn arm() -> Self {
        Self::new(EM_ARM)
    }

    fn is_64(&self) -> bool {
        !matches!(self.machine, EM_ARM | EM_386)
    }

    pub fn section(mut self, name: &str, addr: u64, flags: u32, data: Vec<u8>) -> Self {
        self.sections.push(SectionSpec {
            name: name.to_string(),
            sh_type: SHT_PROGBITS,
            flags,
            addr,
            size: data.len() as u64,
            data,
        });
        self
    }

    /// Allocatable, executable code section.
    pub fn text(self, name: &str, addr: u64, code: Vec<u8>) -> Self {
        self.section(name, addr, SHF_ALLOC | SHF_EXECINSTR, code)
    }

    pub fn data(self, name: &str, addr: u64, data: Vec<u8>) -> Self {
        self.section(name, addr, SHF_ALLOC | SHF_WRITE, data)
    }

    pub fn bss(mut self, name: &str, addr: u64, size: u64) -> Self {
        self.sections.push(SectionSpec {
            name: name.to_string(),
            sh_type: SHT_NOBITS,
            flags: SHF_ALLOC | SHF_WRITE,
            addr,
            size,
            data: Vec::new(),
        });
        self
    }

    pub fn symbol(mut self, name: &str, value: u64, size: u64, kind: u8, bind: u8) -> Self {
        self.symbols.push(SymbolSpec { name: name.to_string(), value, size, kind, bind });
        self
    }

    /// Global function symbol.
    pub fn func(self, name: &str, value: u64, size: u64) -> Self {
        self.symbol(name, value, size, STT_FUNC, STB_GLOBAL)
    }

    /// Global Thumb function: the table value has bit 0 set.
    pub fn thumb_func(self, name: &str, addr: u64, size: u64) -> Self {
        self.func(name, addr | 1, size)
    }

    /// Position of the section containing `value`.
    fn section_for(&self, value: u64) -> Option<usize> {
        self.sections.iter().position(|s| value >= s.addr && value < s.addr + s.size)
    }

    pub fn build(&self) -> Vec<u8> {
        // Locals must precede globals in a symbol table.
        let mut ordered: Vec<&SymbolSpec> = self.symbols.iter().collect();
        ordered.sort_by_key(|s| s.bind != STB_LOCAL);
        let num_local = 1 + ordered.iter().filter(|s| s.bind == STB_LOCAL).count() as u32;

        let entry = self
            .sections
            .iter()
            .find(|s| s.flags & SHF_EXECINSTR != 0)
            .map(|s| s.addr)
            .unwrap_or(0);

        let mut out = Vec::new();
        {
            let mut writer = Writer::new(Endianness::Little, self.is_64(), &mut out);

            // Sections 1..=n in declaration order, then .symtab, .strtab, .shstrtab.
            writer.reserve_file_header();
            writer.reserve_null_section_index();
            let mut section_names = Vec::new();
            let mut section_indices = Vec::new();
            for section in &self.sections {
                section_names.push(writer.add_section_name(section.name.as_bytes()));
                section_indices.push(writer.reserve_section_index());
            }
            let index_for = |value| self.section_for(value).map(|pos| section_indices[pos]);
            writer.reserve_symtab_section_index();
            writer.reserve_strtab_section_index();
            writer.reserve_shstrtab_section_index();

            writer.reserve_null_symbol_index();
            let mut symbol_names = Vec::new();
            for sym in &ordered {
                let name = (!sym.name.is_empty()).then(|| writer.add_string(sym.name.as_bytes()));
                symbol_names.push(name);
                writer.reserve_symbol_index(index_for(sym.value));
            }

            let offsets: Vec<usize> = self
                .sections
                .iter()
                .map(|s| writer.reserve(s.data.len(), SECTION_ALIGN))
                .collect();
            writer.reserve_symtab();
            writer.reserve_strtab();
            writer.reserve_shstrtab();
            writer.reserve_section_headers();

            writer
                .write_file_header(&FileHeader {
                    os_abi: elf::ELFOSABI_NONE,
                    abi_version: 0,
                    e_type: elf::ET_EXEC,
                    e_machine: self.machine,
                    e_entry: entry,
                    e_flags: 0,
                })
                .expect("write ELF header");
            for section in &self.sections {
                writer.write_align(SECTION_ALIGN);
                writer.write(&section.data);
            }

            writer.write_null_symbol();
            for (sym, name) in ordered.iter().zip(&symbol_names) {
                let section = index_for(sym.value);
                writer.write_symbol(&Sym {
                    name: *name,
                    section,
                    st_info: (sym.bind << 4) | (sym.kind & 0xf),
                    st_other: elf::STV_DEFAULT,
                    st_shndx: if section.is_some() { 0 } else { elf::SHN_ABS },
                    st_value: sym.value,
                    st_size: sym.size,
                });
            }
            writer.write_strtab();
            writer.write_shstrtab();

            writer.write_null_section_header();
            let headers = self.sections.iter().zip(&section_names).zip(&offsets);
            for ((section, name), offset) in headers {
                writer.write_section_header(&SectionHeader {
                    name: Some(*name),
                    sh_type: section.sh_type,
                    sh_flags: u64::from(section.flags),
                    sh_addr: section.addr,
                    sh_offset: *offset as u64,
                    sh_size: section.size,
                    sh_link: 0,
                    sh_info: 0,
                    sh_addralign: SECTION_ALIGN as u64,
                    sh_entsize: 0,
                });
            }
            writer.write_symtab_section_header(num_local);
            writer.write_strtab_section_header();
            writer.write_shstrtab_section_header();
        }
        out
    }

    pub fn write(&self, dir: &Path, file_name: &str) -> PathBuf {
        let path = dir.join(file_name);
        fs::write(&path, self.build()).expect("write ELF fixture");
        path
    }
}

/// Thumb-2 encoder for the instructions fixtures need.
pub struct ThumbAsm {
    base: u64,
    code: Vec<u8>,
}

impl ThumbAsm {
    pub fn at(base: u64) -> Self {
        Self { base, code: Vec::new() }
    }

    pub fn pc(&self) -> u64 {
        self.base + self.code.len() as u64
    }

    fn halfword(&mut self, hw: u16) -> &mut Self {
        self.code.extend_from_slice(&hw.to_le_bytes());
        self
    }

    /// `bl target` (encoding T1).
    pub fn bl(&mut self, target: u64) -> &mut Self {
        let offset = (target as i64 - (self.pc() as i64 + 4)) as i32;
        let imm = (offset >> 1) as u32;
        let s = (imm >> 23) & 1;
        let i1 = (imm >> 22) & 1;
        let i2 = (imm >> 21) & 1;
        let j1 = (1 - (i1 ^ s)) & 1;
        let j2 = (1 - (i2 ^ s)) & 1;
        let imm10 = (imm >> 11) & 0x3ff;
        let imm11 = imm & 0x7ff;
        self.halfword((0xf000 | (s << 10) | imm10) as u16);
        self.halfword((0xd000 | (j1 << 13) | (j2 << 11) | imm11) as u16)
    }

    /// `svc #imm`
    pub fn svc(&mut self, imm: u8) -> &mut Self {
        self.halfword(0xdf00 | u16::from(imm))
    }

    pub fn nop(&mut self) -> &mut Self {
        self.halfword(0xbf00)
    }

    /// `bx lr`
    pub fn ret(&mut self) -> &mut Self {
        self.halfword(0x4770)
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.code.clone()
    }
}

/// x86-64 encoder for the instructions fixtures need.
pub struct Asm {
    base: u64,
    code: Vec<u8>,
}

impl Asm {
    pub fn at(base: u64) -> Self {
        Self { base, code: Vec::new() }
    }

    pub fn pc(&self) -> u64 {
        self.base + self.code.len() as u64
    }

    fn rel32(&mut self, opcode: u8, target: u64) -> &mut Self {
        let next = self.pc() + 5;
        let rel = (target as i64 - next as i64) as i32;
        self.code.push(opcode);
        self.code.extend_from_slice(&rel.to_le_bytes());
        self
    }

    /// `call rel32`
    pub fn call(&mut self, target: u64) -> &mut Self {
        self.rel32(0xe8, target)
    }

    /// `jmp rel32`
    pub fn jmp(&mut self, target: u64) -> &mut Self {
        self.rel32(0xe9, target)
    }

    /// `call rax`
    pub fn call_rax(&mut self) -> &mut Self {
        self.code.extend_from_slice(&[0xff, 0xd0]);
        self
    }

    pub fn syscall(&mut self) -> &mut Self {
        self.code.extend_from_slice(&[0x0f, 0x05]);
        self
    }

    pub fn int3(&mut self) -> &mut Self {
        self.code.push(0xcc);
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.code.push(0x90);
        self
    }

    pub fn ret(&mut self) -> &mut Self {
        self.code.push(0xc3);
        self
    }

    /// Byte that does not decode in 64-bit mode.
    pub fn invalid(&mut self) -> &mut Self {
        self.code.push(0x06);
        self
    }

    pub fn pad_to(&mut self, address: u64) -> &mut Self {
        while self.pc() < address {
            self.nop();
        }
        self
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.code.clone()
    }
}

/// Scripted instruction set for driving the stages without capstone.
///
/// | byte | instruction | length |
/// |---|---|---|
/// | `0x00` | other | 1 |
/// | `0xc3` | return | 1 |
/// | `0xcc` | trap | 1 |
/// | `0xff` | indirect call | 1 |
/// | `0xe8 t32` | call to absolute `t32` | 5 |
/// | `0xe9 t32` | jump to absolute `t32` | 5 |
///
/// Anything else is an invalid opcode.
#[derive(Default)]
pub struct ScriptDecoder {
    pub seen: Vec<(u64, usize)>,
}

impl InstructionDecoder for ScriptDecoder {
    fn decode(&mut self, bytes: &[u8], address: u64) -> Result<DecodedInstruction, DecodeError> {
        self.seen.push((address, bytes.len()));
        let simple = |flow| Ok(DecodedInstruction { length: 1, flow, target: None });
        match bytes.first().copied() {
            None => Err(DecodeError::Truncated),
            Some(0x00) => simple(FlowKind::Other),
            Some(0xc3) => simple(FlowKind::Return),
            Some(0xcc) => simple(FlowKind::Trap),
            Some(0xff) => simple(FlowKind::Call),
            Some(op @ (0xe8 | 0xe9)) => {
                let imm: [u8; 4] = bytes.get(1..5).ok_or(DecodeError::Truncated)?.try_into().unwrap();
                let flow = if op == 0xe8 { FlowKind::Call } else { FlowKind::Branch };
                Ok(DecodedInstruction {
                    length: 5,
                    flow,
                    target: Some(u64::from(u32::from_le_bytes(imm))),
                })
            }
            Some(_) => Err(DecodeError::InvalidOpcode),
        }
    }

    fn name(&self) -> &'static str {
        "script"
    }
}

/// Assembler for [`ScriptDecoder`] programs.
pub struct Script(Vec<u8>);

impl Script {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn call(mut self, target: u32) -> Self {
        self.0.push(0xe8);
        self.0.extend_from_slice(&target.to_le_bytes());
        self
    }

    pub fn jmp(mut self, target: u32) -> Self {
        self.0.push(0xe9);
        self.0.extend_from_slice(&target.to_le_bytes());
        self
    }

    pub fn call_indirect(mut self) -> Self {
        self.0.push(0xff);
        self
    }

    pub fn trap(mut self) -> Self {
        self.0.push(0xcc);
        self
    }

    pub fn other(mut self, count: usize) -> Self {
        self.0.extend(std::iter::repeat(0x00).take(count));
        self
    }

    pub fn ret(mut self) -> Self {
        self.0.push(0xc3);
        self
    }

    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.0.extend_from_slice(bytes);
        self
    }

    pub fn len(&self) -> u64 {
        self.0.len() as u64
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// In-memory loaded bytes keyed by start address.
#[derive(Default)]
pub struct Memory {
    regions: BTreeMap<u64, Vec<u8>>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, address: u64, bytes: Vec<u8>) -> Self {
        self.regions.insert(address, bytes);
        self
    }
}

impl ByteSource for Memory {
    fn read(&self, address: u64, len: u64) -> Option<&[u8]> {
        let (start, bytes) = self.regions.range(..=address).next_back()?;
        let within = (address - start) as usize;
        if within >= bytes.len() {
            return None;
        }
        let end = (within + len as usize).min(bytes.len());
        Some(&bytes[within..end])
    }
}

/// Synthetic image for driving the whole pipeline with [`ScriptDecoder`].
#[derive(Default)]
pub struct World {
    pub sections: Vec<RawSection>,
    pub symbols: Vec<RawSymbol>,
    pub memory: Memory,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executable section `name` holding `code` at `address`.
    pub fn code(mut self, name: &str, address: u64, code: Vec<u8>) -> Self {
        self.sections.push(RawSection::new(name, address, code.len() as u64, SectionFlags::text()));
        self.memory.regions.insert(address, code);
        self
    }

    pub fn section(mut self, section: RawSection) -> Self {
        self.sections.push(section);
        self
    }

    pub fn func(mut self, name: &str, address: u64, size: u64) -> Self {
        self.symbols.push(RawSymbol::function(name, address, size));
        self
    }

    pub fn raw_symbol(mut self, symbol: RawSymbol) -> Self {
        self.symbols.push(symbol);
        self
    }

    pub fn audit_with(&self, policy: PrivilegePolicy, options: AuditOptions) -> Analysis {
        Auditor::new(policy, options)
            .analyze(&self.sections, &self.symbols, &self.memory, || Ok(ScriptDecoder::default()))
            .expect("synthetic audit")
    }

    pub fn audit(&self) -> Analysis {
        self.audit_with(PrivilegePolicy::default(), AuditOptions::default())
    }
}
