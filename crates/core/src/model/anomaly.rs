use std::fmt;

use serde::{Deserialize, Serialize};

/// Recoverable condition noticed while analysing an image.
///
/// Anomalies never stop a run. They are collected by each stage and carried
/// into the final report next to the findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "anomaly", rename_all = "snake_case")]
pub enum Anomaly {
    /// Two executable sections claim the same addresses; `kept` owns them.
    OverlappingSections { kept: String, overlapped: String, start: u64, end: u64 },
    /// Executable section that no rule could label.
    UnclassifiedSection { section: String, address: u64 },
    /// Function symbol whose address is in no known section.
    SymbolOutsideSections { symbol: String, address: u64 },
    /// Size was not in the symbol table and had to be inferred.
    ApproximatedSize { symbol: String, address: u64, size: u64 },
    /// Declared size ran past the end of the owning section.
    SizeClamped { symbol: String, address: u64, declared: u64, clamped: u64 },
    /// Decoding stopped early; the rest of the symbol was not examined.
    DecodeFailure { symbol: String, address: u64, undecoded_bytes: u64, reason: String },
    /// Per-symbol instruction budget reached before the symbol end.
    InstructionLimit { symbol: String, address: u64, limit: usize },
    /// Direct call or jump whose destination is inside no known symbol.
    UnresolvedTarget { symbol: String, site: u64, target: u64 },
    /// Jump into another symbol that did not become a call edge.
    CrossSymbolBranch { symbol: String, site: u64, target: u64, callee: String },
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::OverlappingSections { kept, overlapped, start, end } => write!(
                f,
                "sections `{kept}` and `{overlapped}` overlap at 0x{start:x}-0x{end:x}; `{kept}` keeps the range"
            ),
            Anomaly::UnclassifiedSection { section, address } => {
                write!(f, "executable section `{section}` at 0x{address:x} is unclassified")
            }
            Anomaly::SymbolOutsideSections { symbol, address } => {
                write!(f, "symbol `{symbol}` at 0x{address:x} lies outside every section")
            }
            Anomaly::ApproximatedSize { symbol, address, size } => write!(
                f,
                "symbol `{symbol}` at 0x{address:x}: size approximated as 0x{size:x} bytes"
            ),
            Anomaly::SizeClamped { symbol, address, declared, clamped } => write!(
                f,
                "symbol `{symbol}` at 0x{address:x}: declared size 0x{declared:x} clamped to 0x{clamped:x}"
            ),
            Anomaly::DecodeFailure { symbol, address, undecoded_bytes, reason } => write!(
                f,
                "symbol `{symbol}`: decoding stopped at 0x{address:x} ({undecoded_bytes} bytes skipped: {reason})"
            ),
            Anomaly::InstructionLimit { symbol, address, limit } => write!(
                f,
                "symbol `{symbol}`: instruction limit {limit} reached at 0x{address:x}"
            ),
            Anomaly::UnresolvedTarget { symbol, site, target } => write!(
                f,
                "symbol `{symbol}`: transfer at 0x{site:x} targets 0x{target:x}, which is in no known symbol"
            ),
            Anomaly::CrossSymbolBranch { symbol, site, target, callee } => write!(
                f,
                "symbol `{symbol}`: jump at 0x{site:x} leaves for `{callee}` at 0x{target:x} and is not counted as a call"
            ),
        }
    }
}
