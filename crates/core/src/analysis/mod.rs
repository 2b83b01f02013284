//! The four analysis stages, leaf-first.
//!
//! Each stage takes the previous stage's output by shared reference and
//! returns a new, immutable fact base:
//!
//! sections -> symbols -> disassembly -> call graph

pub mod call_graph;
pub mod disassembly;
pub mod sections;
pub mod symbols;

pub use call_graph::{
    is_violation, CallEdge, CallGraph, CallGraphBuilder, Callee, EdgeKind, Finding,
    FindingCategory, SymbolRef,
};
pub use disassembly::{Disassembly, DisassemblyAnalyzer, SymbolListing};
pub use sections::{PrivilegeMap, SectionClassifier};
pub use symbols::{SymbolAnalyzer, SymbolIndex, SymbolTable};
