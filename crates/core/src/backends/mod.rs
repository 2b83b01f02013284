//! Adapters for the external collaborators: the container-format reader and
//! the instruction decoder.
//!
//! The analysis stages only see the traits defined here, so they can be driven
//! by synthetic inputs in tests and by goblin/capstone in production.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "capstone-backend")]
pub mod capstone;
#[cfg(feature = "capstone-backend")]
pub mod elf;

#[cfg(feature = "capstone-backend")]
pub use capstone::CapstoneDecoder;
#[cfg(feature = "capstone-backend")]
pub use elf::BinaryImage;

/// Instruction-set architecture of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    X86,
    X86_64,
    Arm,
    Aarch64,
}

impl Arch {
    pub fn as_str(self) -> &'static str {
        match self {
            Arch::X86 => "x86",
            Arch::X86_64 => "x86_64",
            Arch::Arm => "arm",
            Arch::Aarch64 => "aarch64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Read-only access to the loaded bytes of an image by virtual address.
pub trait ByteSource: Sync {
    /// Bytes for `[address, address + len)`.
    ///
    /// Returns the file-backed prefix of the range when it runs past the end
    /// of its section's data, and `None` when `address` has no file backing.
    fn read(&self, address: u64, len: u64) -> Option<&[u8]>;
}

/// Fatal problems with the input image. Any of these aborts the run.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Failed to read image {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("Malformed ELF image: {0}")]
    Malformed(String),
    #[error("Unsupported machine type {0}")]
    UnsupportedMachine(u16),
    #[error("Section `{section}` extends past the end of the image")]
    Truncated { section: String },
    #[error("Image has no section headers")]
    MissingSections,
    #[error("Image has no symbol table")]
    MissingSymbols,
}

/// Control-flow class assigned by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    Call,
    Branch,
    Return,
    Trap,
    Other,
}

/// One decoded instruction, before call targets are resolved to symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub length: u32,
    pub flow: FlowKind,
    /// Statically encoded destination of a call or branch; `None` for
    /// register- or memory-indirect operands.
    pub target: Option<u64>,
}

/// Instruction encoding a symbol is decoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsaMode {
    /// The architecture's default encoding.
    Native,
    /// ARM Thumb / Thumb-2.
    Thumb,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid or unsupported opcode")]
    InvalidOpcode,
    #[error("instruction truncated at end of range")]
    Truncated,
    #[error("{0:?} mode is not supported by this decoder")]
    UnsupportedMode(IsaMode),
    #[error("decoder error: {0}")]
    Backend(String),
}

/// Byte-level instruction decoder.
pub trait InstructionDecoder {
    /// Decode the single instruction at the start of `bytes`, located at
    /// virtual address `address`.
    fn decode(&mut self, bytes: &[u8], address: u64) -> Result<DecodedInstruction, DecodeError>;

    /// Switch the encoding used by later `decode` calls.
    fn set_mode(&mut self, mode: IsaMode) -> Result<(), DecodeError> {
        match mode {
            IsaMode::Native => Ok(()),
            IsaMode::Thumb => Err(DecodeError::UnsupportedMode(mode)),
        }
    }

    /// Human-readable backend name.
    fn name(&self) -> &'static str;
}
