use std::fs::File;
use std::path::{Path, PathBuf};

use goblin::elf::{header, section_header, sym, Elf};
use memmap2::Mmap;
use tracing::debug;

use super::{Arch, ByteSource, ImageError};
use crate::model::{RawSection, RawSymbol, RawSymbolKind, SectionFlags};
use crate::ranges::{RangeIndex, RangeIndexBuilder};

enum ImageBytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl ImageBytes {
    fn as_slice(&self) -> &[u8] {
        match self {
            ImageBytes::Mapped(map) => &map[..],
            ImageBytes::Owned(bytes) => bytes.as_slice(),
        }
    }
}

/// File-backed bytes of one loaded section.
#[derive(Debug, Clone, Copy)]
struct Backing {
    address: u64,
    offset: usize,
    len: usize,
}

/// An ELF image: sections, symbols, and read-only access to its bytes.
///
/// The file is memory-mapped once and never written.
pub struct BinaryImage {
    path: Option<PathBuf>,
    bytes: ImageBytes,
    arch: Arch,
    sections: Vec<RawSection>,
    symbols: Vec<RawSymbol>,
    backings: Vec<Backing>,
    backing_index: RangeIndex<usize>,
}

struct Parsed {
    arch: Arch,
    sections: Vec<RawSection>,
    symbols: Vec<RawSymbol>,
    backings: Vec<Backing>,
    backing_index: RangeIndex<usize>,
}

fn arch_from_machine(machine: u16) -> Result<Arch, ImageError> {
    match machine {
        header::EM_X86_64 => Ok(Arch::X86_64),
        header::EM_386 => Ok(Arch::X86),
        header::EM_AARCH64 => Ok(Arch::Aarch64),
        header::EM_ARM => Ok(Arch::Arm),
        other => Err(ImageError::UnsupportedMachine(other)),
    }
}

fn section_flags(sh: &section_header::SectionHeader) -> SectionFlags {
    SectionFlags {
        executable: sh.sh_flags & u64::from(section_header::SHF_EXECINSTR) != 0,
        writable: sh.sh_flags & u64::from(section_header::SHF_WRITE) != 0,
        allocatable: sh.sh_flags & u64::from(section_header::SHF_ALLOC) != 0,
    }
}

fn collect_sections(
    elf: &Elf,
    bytes_len: usize,
) -> Result<(Vec<RawSection>, Vec<Backing>, RangeIndex<usize>), ImageError> {
    let mut sections = Vec::new();
    let mut backings = Vec::new();
    let mut index = RangeIndexBuilder::new();

    for sh in &elf.section_headers {
        if sh.sh_type == section_header::SHT_NULL {
            continue;
        }
        let name = elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("").to_string();
        let flags = section_flags(sh);

        if flags.allocatable && sh.sh_type != section_header::SHT_NOBITS && sh.sh_size > 0 {
            let end = sh.sh_offset.checked_add(sh.sh_size);
            if end.map_or(true, |end| end > bytes_len as u64) {
                return Err(ImageError::Truncated { section: name });
            }
            let backing = Backing {
                address: sh.sh_addr,
                offset: sh.sh_offset as usize,
                len: sh.sh_size as usize,
            };
            index.claim(sh.sh_addr, sh.sh_addr.saturating_add(sh.sh_size), backings.len());
            backings.push(backing);
        }

        sections.push(RawSection::new(name, sh.sh_addr, sh.sh_size, flags));
    }

    if sections.is_empty() {
        return Err(ImageError::MissingSections);
    }
    Ok((sections, backings, index.build()))
}

fn collect_symbols(elf: &Elf, arch: Arch) -> Result<Vec<RawSymbol>, ImageError> {
    // Stripped images usually keep only the dynamic table.
    let (table, strtab) = if !elf.syms.is_empty() {
        (&elf.syms, &elf.strtab)
    } else {
        debug!("no .symtab; falling back to .dynsym");
        (&elf.dynsyms, &elf.dynstrtab)
    };
    if table.is_empty() {
        return Err(ImageError::MissingSymbols);
    }

    let mut symbols = Vec::new();
    for s in table.iter() {
        if s.st_shndx == section_header::SHN_UNDEF as usize {
            continue;
        }
        let kind = match s.st_type() {
            sym::STT_FUNC | sym::STT_GNU_IFUNC => RawSymbolKind::Function,
            sym::STT_OBJECT => RawSymbolKind::Object,
            sym::STT_SECTION | sym::STT_FILE | sym::STT_TLS => continue,
            _ => RawSymbolKind::Other,
        };
        if s.st_shndx == section_header::SHN_ABS as usize && kind != RawSymbolKind::Function {
            continue;
        }

        // Thumb entry points carry the mode in bit 0.
        let thumb = arch == Arch::Arm && kind == RawSymbolKind::Function && s.st_value & 1 != 0;
        let address = if thumb { s.st_value & !1 } else { s.st_value };
        let name = strtab.get_at(s.st_name).filter(|n| !n.is_empty()).map(str::to_string);

        symbols.push(RawSymbol {
            name,
            address,
            size: s.st_size,
            kind,
            global: s.st_bind() != sym::STB_LOCAL,
            thumb,
        });
    }
    Ok(symbols)
}

fn parse(bytes: &[u8]) -> Result<Parsed, ImageError> {
    if bytes.is_empty() {
        return Err(ImageError::UnsupportedFormat("empty file".into()));
    }
    if bytes.get(..4) != Some(b"\x7fELF".as_slice()) {
        return Err(ImageError::UnsupportedFormat("not an ELF image".into()));
    }
    let elf = Elf::parse(bytes).map_err(|e| ImageError::Malformed(e.to_string()))?;
    let arch = arch_from_machine(elf.header.e_machine)?;
    let (sections, backings, backing_index) = collect_sections(&elf, bytes.len())?;
    let symbols = collect_symbols(&elf, arch)?;
    debug!(
        arch = %arch,
        sections = sections.len(),
        symbols = symbols.len(),
        "parsed ELF image"
    );
    Ok(Parsed { arch, sections, symbols, backings, backing_index })
}

impl BinaryImage {
    /// Memory-map and parse the image at `path`.
    pub fn open(path: &Path) -> Result<Self, ImageError> {
        let io_err = |source| ImageError::Io { path: path.to_path_buf(), source };
        let file = File::open(path).map_err(io_err)?;
        let len = file.metadata().map_err(io_err)?.len();
        let bytes = if len == 0 {
            ImageBytes::Owned(Vec::new())
        } else {
            // Safety: read-only mapping of a regular file; the image is treated
            // as immutable for the whole run.
            ImageBytes::Mapped(unsafe { Mmap::map(&file) }.map_err(io_err)?)
        };
        let mut image = Self::from_image_bytes(bytes)?;
        image.path = Some(path.to_path_buf());
        Ok(image)
    }

    /// Parse an image already in memory.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ImageError> {
        Self::from_image_bytes(ImageBytes::Owned(bytes))
    }

    fn from_image_bytes(bytes: ImageBytes) -> Result<Self, ImageError> {
        let parsed = parse(bytes.as_slice())?;
        Ok(Self {
            path: None,
            bytes,
            arch: parsed.arch,
            sections: parsed.sections,
            symbols: parsed.symbols,
            backings: parsed.backings,
            backing_index: parsed.backing_index,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn sections(&self) -> &[RawSection] {
        &self.sections
    }

    pub fn symbols(&self) -> &[RawSymbol] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.bytes.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ByteSource for BinaryImage {
    fn read(&self, address: u64, len: u64) -> Option<&[u8]> {
        let backing = self.backings[self.backing_index.lookup(address)?];
        let within = usize::try_from(address - backing.address).ok()?;
        let available = backing.len.checked_sub(within)?;
        let take = usize::try_from(len).map_or(available, |len| len.min(available));
        let start = backing.offset + within;
        self.bytes.as_slice().get(start..start + take)
    }
}
