//! Privilege-annotated call graph and the boundary check over its edges.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span};

use crate::analysis::disassembly::Disassembly;
use crate::analysis::symbols::SymbolTable;
use crate::model::{Anomaly, Instruction, InstructionKind, PrivilegeLevel, Symbol, SymbolId, Transfer};

/// Destination node of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Callee {
    Symbol(SymbolId),
    /// Sink for indirect calls and targets outside every symbol.
    Unresolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Direct,
    Indirect,
}

impl EdgeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EdgeKind::Direct => "direct",
            EdgeKind::Indirect => "indirect",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEdge {
    pub caller: SymbolId,
    pub callee: Callee,
    /// Address of the call instruction.
    pub site: u64,
    pub kind: EdgeKind,
    pub target: Option<u64>,
    /// Edge comes from a jump to another symbol's entry rather than a call.
    #[serde(default)]
    pub tail_call: bool,
}

/// Whether a call from `caller` into `callee` crosses the boundary illegally.
pub fn is_violation(caller: PrivilegeLevel, callee: PrivilegeLevel) -> bool {
    callee == PrivilegeLevel::Privileged && !caller.may_enter_privileged()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingCategory {
    /// Non-privileged code calls privileged code directly.
    Violation,
    /// Callee privilege could not be determined.
    UndeterminedCallee,
    /// Call target could not be resolved statically.
    UnresolvedCall,
}

impl FindingCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FindingCategory::Violation => "violation",
            FindingCategory::UndeterminedCallee => "undetermined_callee",
            FindingCategory::UnresolvedCall => "unresolved_call",
        }
    }
}

impl fmt::Display for FindingCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Name, address, and privilege of one end of an edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolRef {
    pub name: String,
    pub address: u64,
    pub privilege: PrivilegeLevel,
}

impl From<&Symbol> for SymbolRef {
    fn from(sym: &Symbol) -> Self {
        Self { name: sym.name.clone(), address: sym.address, privilege: sym.privilege }
    }
}

impl fmt::Display for SymbolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} `{}` @ 0x{:x}", self.privilege, self.name, self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub category: FindingCategory,
    pub caller: SymbolRef,
    /// `None` for unresolved calls.
    pub callee: Option<SymbolRef>,
    pub site: u64,
    pub kind: EdgeKind,
    pub target: Option<u64>,
    #[serde(default)]
    pub tail_call: bool,
    pub reason: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.category {
            FindingCategory::Violation => "VIOLATION",
            FindingCategory::UndeterminedCallee => "UNDETERMINED",
            FindingCategory::UnresolvedCall => "UNRESOLVED",
        };
        write!(f, "{label:<12} {} -> ", self.caller)?;
        match (&self.callee, self.target) {
            (Some(callee), _) => write!(f, "{callee}")?,
            (None, Some(target)) => write!(f, "0x{target:x}")?,
            (None, None) => f.write_str("<indirect>")?,
        }
        write!(f, " (site 0x{:x}, {}", self.site, self.kind.as_str())?;
        if self.tail_call {
            f.write_str(", tail call")?;
        }
        write!(f, "): {}", self.reason)
    }
}

/// Directed graph with one node per symbol plus the `Unresolved` sink.
///
/// Edges are kept in caller-address order, then site order, which is the
/// order findings are reported in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallGraph {
    nodes: usize,
    edges: Vec<CallEdge>,
    #[serde(skip)]
    outgoing: Vec<Vec<usize>>,
    #[serde(skip)]
    incoming: Vec<Vec<usize>>,
    /// Jumps between symbols that were not turned into edges.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    anomalies: Vec<Anomaly>,
}

impl CallGraph {
    fn from_edges(nodes: usize, edges: Vec<CallEdge>, anomalies: Vec<Anomaly>) -> Self {
        let mut outgoing = vec![Vec::new(); nodes];
        let mut incoming = vec![Vec::new(); nodes];
        for (idx, edge) in edges.iter().enumerate() {
            outgoing[edge.caller.0].push(idx);
            if let Callee::Symbol(id) = edge.callee {
                incoming[id.0].push(idx);
            }
        }
        Self { nodes, edges, outgoing, incoming, anomalies }
    }

    pub fn node_count(&self) -> usize {
        self.nodes
    }

    pub fn edges(&self) -> &[CallEdge] {
        &self.edges
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn callees(&self, id: SymbolId) -> impl Iterator<Item = &CallEdge> + '_ {
        let idx = self.outgoing.get(id.0).map(Vec::as_slice).unwrap_or_default();
        idx.iter().map(|&i| &self.edges[i])
    }

    pub fn callers(&self, id: SymbolId) -> impl Iterator<Item = &CallEdge> + '_ {
        let idx = self.incoming.get(id.0).map(Vec::as_slice).unwrap_or_default();
        idx.iter().map(|&i| &self.edges[i])
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &CallEdge> + '_ {
        self.edges.iter().filter(|e| e.callee == Callee::Unresolved)
    }

    pub fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }

    fn judge(&self, edge: &CallEdge, symbols: &SymbolTable) -> Option<Finding> {
        let caller = symbols.get(edge.caller)?;
        let finding = |category, callee: Option<&Symbol>, reason: String| Finding {
            category,
            caller: SymbolRef::from(caller),
            callee: callee.map(SymbolRef::from),
            site: edge.site,
            kind: edge.kind,
            target: edge.target,
            tail_call: edge.tail_call,
            reason,
        };

        match edge.callee {
            Callee::Unresolved => {
                let reason = match edge.target {
                    Some(target) => format!("target 0x{target:x} lies outside every symbol"),
                    None => "indirect call; target not statically known".to_string(),
                };
                Some(finding(FindingCategory::UnresolvedCall, None, reason))
            }
            Callee::Symbol(id) => {
                let callee = symbols.get(id)?;
                if is_violation(caller.privilege, callee.privilege) {
                    let reason = format!(
                        "{} code enters privileged code without a gate",
                        caller.privilege
                    );
                    Some(finding(FindingCategory::Violation, Some(callee), reason))
                } else if callee.privilege == PrivilegeLevel::Unknown {
                    let reason = "callee privilege is unknown".to_string();
                    Some(finding(FindingCategory::UndeterminedCallee, Some(callee), reason))
                } else {
                    None
                }
            }
        }
    }

    /// Apply the boundary check to every edge, in edge order.
    pub fn evaluate(&self, symbols: &SymbolTable) -> Vec<Finding> {
        let _span = info_span!("evaluate", edges = self.edges.len()).entered();
        let findings: Vec<Finding> =
            self.edges.iter().filter_map(|edge| self.judge(edge, symbols)).collect();
        info!(
            violations =
                findings.iter().filter(|f| f.category == FindingCategory::Violation).count(),
            findings = findings.len(),
            "call graph evaluated"
        );
        findings
    }

    /// Graphviz rendering of the symbols that take part in at least one edge.
    /// Violating edges are drawn red.
    pub fn to_dot(&self, symbols: &SymbolTable) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_dot(symbols, &mut out);
        out
    }

    pub fn write_dot<W: fmt::Write>(&self, symbols: &SymbolTable, out: &mut W) -> fmt::Result {
        writeln!(out, "digraph privgate {{")?;
        writeln!(out, "  node [shape=box, style=filled, fontname=\"monospace\"];")?;

        let mut used = vec![false; self.nodes];
        let mut sink = false;
        for edge in &self.edges {
            used[edge.caller.0] = true;
            match edge.callee {
                Callee::Symbol(id) => used[id.0] = true,
                Callee::Unresolved => sink = true,
            }
        }

        for sym in symbols.symbols().iter().filter(|s| used.get(s.id.0).copied().unwrap_or(false))
        {
            writeln!(
                out,
                "  n{} [label=\"{}\\n0x{:x}\\n{}\", fillcolor=\"{}\"];",
                sym.id.0,
                escape_dot(&sym.name),
                sym.address,
                sym.privilege,
                fill_color(sym.privilege)
            )?;
        }
        if sink {
            writeln!(
                out,
                "  unresolved [label=\"<unresolved>\", shape=ellipse, fillcolor=\"white\"];"
            )?;
        }

        for edge in &self.edges {
            let to = match edge.callee {
                Callee::Symbol(id) => format!("n{}", id.0),
                Callee::Unresolved => "unresolved".to_string(),
            };
            let violation = self
                .judge(edge, symbols)
                .map_or(false, |f| f.category == FindingCategory::Violation);
            let mut attrs = vec![format!("label=\"0x{:x}\"", edge.site)];
            if violation {
                attrs.push("color=red".into());
                attrs.push("penwidth=2".into());
            }
            if edge.kind == EdgeKind::Indirect || edge.tail_call {
                attrs.push("style=dashed".into());
            }
            writeln!(out, "  n{} -> {} [{}];", edge.caller.0, to, attrs.join(", "))?;
        }
        writeln!(out, "}}")
    }
}

fn escape_dot(name: &str) -> String {
    name.replace('\\', "\\\\").replace('"', "\\\"")
}

fn fill_color(level: PrivilegeLevel) -> &'static str {
    match level {
        PrivilegeLevel::Privileged => "lightcoral",
        PrivilegeLevel::Unprivileged => "lightblue",
        PrivilegeLevel::Gate => "palegreen",
        PrivilegeLevel::Unknown => "lightgrey",
    }
}

pub struct CallGraphBuilder<'a> {
    symbols: &'a SymbolTable,
    tail_calls: bool,
}

impl<'a> CallGraphBuilder<'a> {
    pub fn new(symbols: &'a SymbolTable) -> Self {
        Self { symbols, tail_calls: false }
    }

    /// Also treat jumps to the entry of another symbol as calls.
    pub fn with_tail_calls(mut self, enabled: bool) -> Self {
        self.tail_calls = enabled;
        self
    }

    /// Edge or anomaly for a direct jump from `caller` into another symbol.
    /// Jumps that stay inside `caller`, or leave every symbol, yield neither.
    fn branch_edge(
        &self,
        caller: SymbolId,
        insn: &Instruction,
        transfer: &Transfer,
        anomalies: &mut Vec<Anomaly>,
    ) -> Option<CallEdge> {
        let Transfer::Direct { target, callee: Some(id) } = *transfer else {
            return None;
        };
        if id == caller {
            return None;
        }
        let callee = self.symbols.get(id)?;
        if self.tail_calls && callee.address == target {
            return Some(CallEdge {
                caller,
                callee: Callee::Symbol(id),
                site: insn.address,
                kind: EdgeKind::Direct,
                target: Some(target),
                tail_call: true,
            });
        }

        let from = self.symbols.get(caller)?;
        debug!(
            symbol = %from.name,
            site = insn.address,
            callee = %callee.name,
            "jump leaves symbol"
        );
        anomalies.push(Anomaly::CrossSymbolBranch {
            symbol: from.name.clone(),
            site: insn.address,
            target,
            callee: callee.name.clone(),
        });
        None
    }

    pub fn build(&self, disassembly: &Disassembly) -> CallGraph {
        let _span = info_span!("build_call_graph", tail_calls = self.tail_calls).entered();
        let mut edges = Vec::new();
        let mut anomalies = Vec::new();

        for listing in disassembly.listings() {
            let caller = listing.symbol;
            for insn in &listing.instructions {
                let edge = match &insn.kind {
                    InstructionKind::Call(Transfer::Direct { target, callee }) => CallEdge {
                        caller,
                        callee: callee.map_or(Callee::Unresolved, Callee::Symbol),
                        site: insn.address,
                        kind: EdgeKind::Direct,
                        target: Some(*target),
                        tail_call: false,
                    },
                    InstructionKind::Call(Transfer::Indirect) => CallEdge {
                        caller,
                        callee: Callee::Unresolved,
                        site: insn.address,
                        kind: EdgeKind::Indirect,
                        target: None,
                        tail_call: false,
                    },
                    InstructionKind::Branch(transfer) => {
                        match self.branch_edge(caller, insn, transfer, &mut anomalies) {
                            Some(edge) => edge,
                            None => continue,
                        }
                    }
                    InstructionKind::Return | InstructionKind::Trap | InstructionKind::Other => {
                        continue
                    }
                };
                edges.push(edge);
            }
        }

        let graph = CallGraph::from_edges(self.symbols.len(), edges, anomalies);
        info!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            unresolved = graph.unresolved().count(),
            cross_symbol_jumps = graph.anomalies().len(),
            "call graph built"
        );
        graph
    }
}
