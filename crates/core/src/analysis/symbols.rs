//! Symbol resolution: turns raw symbol-table entries into callable symbols
//! with address ranges, owning sections, and privilege labels.

use std::collections::HashMap;

use tracing::{debug, info, info_span, warn};

use crate::analysis::sections::PrivilegeMap;
use crate::model::{
    synthesized_name, Anomaly, PrivilegeLevel, RawSymbol, RawSymbolKind, SizeSource, Symbol,
    SymbolId,
};
use crate::policy::PrivilegePolicy;
use crate::ranges::{RangeIndex, RangeIndexBuilder};

/// Address-to-symbol lookup.
///
/// An address that is the start of a symbol resolves to it directly. Any
/// other address resolves to the smallest symbol whose range contains it, so
/// calls into the middle of a function still find their owner.
#[derive(Debug, Clone)]
pub struct SymbolIndex {
    starts: Vec<u64>,
    ranges: RangeIndex<SymbolId>,
}

impl SymbolIndex {
    fn new(symbols: &[Symbol]) -> Self {
        let starts = symbols.iter().map(|s| s.address).collect();

        let mut by_size: Vec<&Symbol> = symbols.iter().filter(|s| s.size > 0).collect();
        by_size.sort_by_key(|s| (s.size, s.address));
        let mut builder = RangeIndexBuilder::new();
        for sym in by_size {
            builder.claim(sym.address, sym.end(), sym.id);
        }

        Self { starts, ranges: builder.build() }
    }

    pub fn resolve(&self, address: u64) -> Option<SymbolId> {
        match self.starts.binary_search(&address) {
            Ok(idx) => Some(SymbolId(idx)),
            Err(_) => self.ranges.lookup(address),
        }
    }
}

/// Output of symbol analysis: symbols in ascending address order, where a
/// symbol's id is its position.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    index: SymbolIndex,
    anomalies: Vec<Anomaly>,
}

impl SymbolTable {
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn get(&self, id: SymbolId) -> Option<&Symbol> {
        self.symbols.get(id.0)
    }

    /// Symbols inside executable sections, ascending by address.
    pub fn text_symbols(&self) -> impl Iterator<Item = &Symbol> + '_ {
        self.symbols.iter().filter(|s| s.executable)
    }

    pub fn index(&self) -> &SymbolIndex {
        &self.index
    }

    pub fn resolve(&self, address: u64) -> Option<&Symbol> {
        self.index.resolve(address).and_then(|id| self.get(id))
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name || s.aliases.iter().any(|a| a == name))
    }

    pub fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Canonical entry at one address, before sizes are settled.
struct Candidate {
    name: Option<String>,
    address: u64,
    size: u64,
    thumb: bool,
    aliases: Vec<String>,
}

pub struct SymbolAnalyzer<'a> {
    privilege_map: &'a PrivilegeMap,
    policy: &'a PrivilegePolicy,
}

impl<'a> SymbolAnalyzer<'a> {
    pub fn new(privilege_map: &'a PrivilegeMap, policy: &'a PrivilegePolicy) -> Self {
        Self { privilege_map, policy }
    }

    fn in_executable_section(&self, address: u64) -> bool {
        self.privilege_map.section_at(address).map_or(false, |s| s.flags.executable)
    }

    /// Whether a table entry describes something callable.
    ///
    /// Typed functions always count. Untyped or object entries count when they
    /// sit in executable code with a size, and global untyped labels in code
    /// (hand-written assembly entry points) count even without one.
    fn is_function_like(&self, raw: &RawSymbol) -> bool {
        match raw.kind {
            RawSymbolKind::Function => true,
            RawSymbolKind::Object => raw.size > 0 && self.in_executable_section(raw.address),
            RawSymbolKind::Other => {
                (raw.size > 0 || raw.global) && self.in_executable_section(raw.address)
            }
        }
    }

    pub fn analyze(&self, raw: &[RawSymbol]) -> SymbolTable {
        let _span = info_span!("analyze_symbols", entries = raw.len()).entered();
        let mut anomalies = Vec::new();

        // Any defined address ends the preceding symbol when sizes are inferred.
        let mut boundaries: Vec<u64> = raw.iter().map(|r| r.address).collect();
        boundaries.sort_unstable();
        boundaries.dedup();

        let mut candidates: Vec<Candidate> = Vec::new();
        let mut by_address: HashMap<u64, usize> = HashMap::new();
        for entry in raw.iter().filter(|r| self.is_function_like(r)) {
            let name = entry.name.clone().filter(|n| !n.is_empty());
            match by_address.get(&entry.address) {
                Some(&pos) => {
                    let canonical = &mut candidates[pos];
                    if canonical.size == 0 {
                        canonical.size = entry.size;
                    }
                    canonical.thumb |= entry.thumb;
                    if let Some(alias) = name {
                        if canonical.name.as_deref() != Some(alias.as_str())
                            && !canonical.aliases.contains(&alias)
                        {
                            canonical.aliases.push(alias);
                        }
                    }
                }
                None => {
                    by_address.insert(entry.address, candidates.len());
                    candidates.push(Candidate {
                        name,
                        address: entry.address,
                        size: entry.size,
                        thumb: entry.thumb,
                        aliases: Vec::new(),
                    });
                }
            }
        }
        candidates.sort_by_key(|c| c.address);

        let symbols: Vec<Symbol> = candidates
            .into_iter()
            .enumerate()
            .map(|(idx, c)| self.resolve_candidate(SymbolId(idx), c, &boundaries, &mut anomalies))
            .collect();

        let index = SymbolIndex::new(&symbols);
        let table = SymbolTable { symbols, index, anomalies };
        info!(
            symbols = table.len(),
            text = table.text_symbols().count(),
            aliased = table.symbols.iter().filter(|s| !s.aliases.is_empty()).count(),
            "symbols resolved"
        );
        table
    }

    fn resolve_candidate(
        &self,
        id: SymbolId,
        candidate: Candidate,
        boundaries: &[u64],
        anomalies: &mut Vec<Anomaly>,
    ) -> Symbol {
        let name_synthesized = candidate.name.is_none();
        let name = candidate.name.unwrap_or_else(|| synthesized_name(candidate.address));
        let address = candidate.address;
        let section = self.privilege_map.section_at(address);

        let (size, size_source) = match section {
            Some(sec) => {
                // An earlier overlapping section may own the tail of `sec`.
                let owned_end = self.privilege_map.owned_end(address).unwrap_or(sec.end());
                let limit = owned_end - address;
                if candidate.size > limit {
                    warn!(symbol = %name, declared = candidate.size, clamped = limit, "size clamped");
                    anomalies.push(Anomaly::SizeClamped {
                        symbol: name.clone(),
                        address,
                        declared: candidate.size,
                        clamped: limit,
                    });
                    (limit, SizeSource::Clamped)
                } else if candidate.size > 0 {
                    (candidate.size, SizeSource::Declared)
                } else {
                    let next = boundaries.partition_point(|&b| b <= address);
                    let end = boundaries.get(next).copied().unwrap_or(u64::MAX).min(owned_end);
                    let inferred = end - address;
                    debug!(symbol = %name, size = inferred, "size inferred");
                    anomalies.push(Anomaly::ApproximatedSize {
                        symbol: name.clone(),
                        address,
                        size: inferred,
                    });
                    (inferred, SizeSource::Inferred)
                }
            }
            None => {
                warn!(symbol = %name, address, "symbol outside every section");
                anomalies
                    .push(Anomaly::SymbolOutsideSections { symbol: name.clone(), address });
                if candidate.size > 0 {
                    (candidate.size, SizeSource::Declared)
                } else {
                    (0, SizeSource::Unknown)
                }
            }
        };

        let inherited = section.map(|s| s.privilege).unwrap_or(PrivilegeLevel::Unknown);
        let privilege = std::iter::once(&name)
            .chain(candidate.aliases.iter())
            .find_map(|n| self.policy.symbol_override(n))
            .unwrap_or(inherited);

        Symbol {
            id,
            name,
            name_synthesized,
            address,
            size,
            size_source,
            section: section.map(|s| s.id),
            privilege,
            executable: section.map_or(false, |s| s.flags.executable),
            thumb: candidate.thumb,
            aliases: candidate.aliases,
        }
    }
}
