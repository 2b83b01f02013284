//! Core data model (IR) for sections, symbols, instructions, and privilege labels.
//!
//! Every stage of the pipeline produces values from this module and hands them
//! to the next stage by shared reference. Nothing here is mutated after the
//! stage that created it returns.

use std::fmt;

use serde::{Deserialize, Serialize};

mod anomaly;

pub use anomaly::Anomaly;

/// Privilege label attached to sections and symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeLevel {
    /// Supervisor, kernel, or secure-monitor code.
    Privileged,
    /// Ordinary user or normal-world code.
    Unprivileged,
    /// Sanctioned transition stub (syscall trampoline, monitor entry).
    Gate,
    /// Not executable, or not matched by any policy rule.
    Unknown,
}

impl PrivilegeLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            PrivilegeLevel::Privileged => "privileged",
            PrivilegeLevel::Unprivileged => "unprivileged",
            PrivilegeLevel::Gate => "gate",
            PrivilegeLevel::Unknown => "unknown",
        }
    }

    /// Whether code at this level may legitimately call privileged code.
    pub fn may_enter_privileged(self) -> bool {
        matches!(self, PrivilegeLevel::Privileged | PrivilegeLevel::Gate)
    }
}

impl fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Dense index of a section in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SectionId(pub usize);

/// Dense index of a symbol in ascending address order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolId(pub usize);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionFlags {
    pub executable: bool,
    pub writable: bool,
    pub allocatable: bool,
}

impl SectionFlags {
    /// Flags for an ordinary loaded code section.
    pub fn text() -> Self {
        Self { executable: true, writable: false, allocatable: true }
    }

    /// Flags for an ordinary loaded data section.
    pub fn data() -> Self {
        Self { executable: false, writable: true, allocatable: true }
    }
}

/// Section as reported by the format reader, before classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSection {
    pub name: String,
    pub address: u64,
    pub size: u64,
    pub flags: SectionFlags,
}

impl RawSection {
    pub fn new(name: impl Into<String>, address: u64, size: u64, flags: SectionFlags) -> Self {
        Self { name: name.into(), address, size, flags }
    }
}

/// Classified section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub id: SectionId,
    pub name: String,
    pub address: u64,
    pub size: u64,
    pub flags: SectionFlags,
    pub privilege: PrivilegeLevel,
}

impl Section {
    pub fn end(&self) -> u64 {
        self.address.saturating_add(self.size)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address < self.end()
    }
}

/// Symbol type as carried by the symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawSymbolKind {
    Function,
    Object,
    Other,
}

/// Symbol table entry as reported by the format reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSymbol {
    /// `None` (or empty) for stripped entries.
    pub name: Option<String>,
    pub address: u64,
    /// Zero when the format carries no size.
    pub size: u64,
    pub kind: RawSymbolKind,
    pub global: bool,
    /// ARM entry point encoded in Thumb state (bit 0 of the table value).
    #[serde(default)]
    pub thumb: bool,
}

impl RawSymbol {
    pub fn function(name: impl Into<String>, address: u64, size: u64) -> Self {
        Self {
            name: Some(name.into()),
            address,
            size,
            kind: RawSymbolKind::Function,
            global: true,
            thumb: false,
        }
    }

    /// Function entry in Thumb state.
    pub fn thumb_function(name: impl Into<String>, address: u64, size: u64) -> Self {
        Self { thumb: true, ..Self::function(name, address, size) }
    }
}

/// Where a symbol's size came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeSource {
    /// Taken from the symbol table.
    Declared,
    /// Approximated from the next symbol or the section end.
    Inferred,
    /// Declared size ran past the section end and was cut back.
    Clamped,
    /// Nothing to infer from (symbol outside every section).
    Unknown,
}

impl SizeSource {
    pub fn as_str(self) -> &'static str {
        match self {
            SizeSource::Declared => "declared",
            SizeSource::Inferred => "inferred",
            SizeSource::Clamped => "clamped",
            SizeSource::Unknown => "unknown",
        }
    }

    pub fn is_approximate(self) -> bool {
        !matches!(self, SizeSource::Declared)
    }
}

/// A callable, function-like entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub id: SymbolId,
    pub name: String,
    /// True when the table had no name and one was made up as `sub_<addr>`.
    pub name_synthesized: bool,
    pub address: u64,
    pub size: u64,
    pub size_source: SizeSource,
    pub section: Option<SectionId>,
    pub privilege: PrivilegeLevel,
    pub executable: bool,
    /// Decode with the Thumb instruction set.
    #[serde(default)]
    pub thumb: bool,
    /// Other names found at the same address, in table order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

impl Symbol {
    pub fn end(&self) -> u64 {
        self.address.saturating_add(self.size)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address < self.end()
    }
}

/// Name given to symbols the table left unnamed.
pub fn synthesized_name(address: u64) -> String {
    format!("sub_{address:x}")
}

/// Target of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transfer", rename_all = "snake_case")]
pub enum Transfer {
    /// Statically encoded destination. `callee` is `None` when the address
    /// lies outside every known symbol.
    Direct { target: u64, callee: Option<SymbolId> },
    /// Register- or memory-indirect destination.
    Indirect,
}

impl Transfer {
    pub fn target(&self) -> Option<u64> {
        match self {
            Transfer::Direct { target, .. } => Some(*target),
            Transfer::Indirect => None,
        }
    }

    pub fn callee(&self) -> Option<SymbolId> {
        match self {
            Transfer::Direct { callee, .. } => *callee,
            Transfer::Indirect => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstructionKind {
    Call(Transfer),
    Branch(Transfer),
    Return,
    /// Supervisor call or software trap: a sanctioned privilege transition.
    Trap,
    Other,
}

/// Decoded instruction inside a symbol's range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub address: u64,
    pub length: u32,
    pub kind: InstructionKind,
}

impl Instruction {
    pub fn end(&self) -> u64 {
        self.address.saturating_add(u64::from(self.length))
    }
}
