//! Per-symbol disassembly and call-target extraction.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use crate::analysis::symbols::SymbolTable;
use crate::backends::{
    ByteSource, DecodeError, DecodedInstruction, FlowKind, InstructionDecoder, IsaMode,
};
use crate::model::{Anomaly, Instruction, InstructionKind, Symbol, SymbolId, Transfer};

/// Decoded instructions of one symbol, in address order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolListing {
    pub symbol: SymbolId,
    pub instructions: Vec<Instruction>,
    /// Bytes covered by `instructions`.
    pub decoded_bytes: u64,
    /// False when decoding stopped before the end of the symbol.
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<Anomaly>,
}

impl SymbolListing {
    fn empty(symbol: SymbolId) -> Self {
        Self {
            symbol,
            instructions: Vec::new(),
            decoded_bytes: 0,
            complete: true,
            anomalies: Vec::new(),
        }
    }

    pub fn calls(&self) -> impl Iterator<Item = (&Instruction, &Transfer)> + '_ {
        self.instructions.iter().filter_map(|insn| match &insn.kind {
            InstructionKind::Call(transfer) => Some((insn, transfer)),
            _ => None,
        })
    }

    pub fn trap_count(&self) -> usize {
        self.instructions.iter().filter(|i| i.kind == InstructionKind::Trap).count()
    }
}

/// Listings for every text symbol, ordered by symbol id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disassembly {
    listings: Vec<SymbolListing>,
}

impl Disassembly {
    pub fn listings(&self) -> &[SymbolListing] {
        &self.listings
    }

    pub fn listing(&self, id: SymbolId) -> Option<&SymbolListing> {
        self.listings
            .binary_search_by_key(&id, |l| l.symbol)
            .ok()
            .map(|idx| &self.listings[idx])
    }

    pub fn anomalies(&self) -> impl Iterator<Item = &Anomaly> + '_ {
        self.listings.iter().flat_map(|l| l.anomalies.iter())
    }

    pub fn instruction_count(&self) -> usize {
        self.listings.iter().map(|l| l.instructions.len()).sum()
    }

    pub fn trap_count(&self) -> usize {
        self.listings.iter().map(SymbolListing::trap_count).sum()
    }
}

pub struct DisassemblyAnalyzer<'a> {
    symbols: &'a SymbolTable,
    bytes: &'a dyn ByteSource,
    max_instructions: Option<usize>,
    parallel: bool,
}

impl<'a> DisassemblyAnalyzer<'a> {
    pub fn new(symbols: &'a SymbolTable, bytes: &'a dyn ByteSource) -> Self {
        Self { symbols, bytes, max_instructions: None, parallel: true }
    }

    /// Stop each symbol after `limit` instructions.
    pub fn with_instruction_limit(mut self, limit: Option<usize>) -> Self {
        self.max_instructions = limit;
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    fn transfer(&self, target: Option<u64>) -> Transfer {
        match target {
            Some(target) => Transfer::Direct { target, callee: self.symbols.index().resolve(target) },
            None => Transfer::Indirect,
        }
    }

    fn classify(&self, decoded: &DecodedInstruction) -> InstructionKind {
        match decoded.flow {
            FlowKind::Call => InstructionKind::Call(self.transfer(decoded.target)),
            FlowKind::Branch => InstructionKind::Branch(self.transfer(decoded.target)),
            FlowKind::Return => InstructionKind::Return,
            FlowKind::Trap => InstructionKind::Trap,
            FlowKind::Other => InstructionKind::Other,
        }
    }

    /// Decode `symbol` front to back.
    ///
    /// The decoder never sees bytes past the symbol end. A failure ends the
    /// listing at the failing offset and is recorded as an anomaly.
    pub fn disassemble_symbol(
        &self,
        symbol: &Symbol,
        decoder: &mut dyn InstructionDecoder,
    ) -> SymbolListing {
        let mut listing = SymbolListing::empty(symbol.id);
        if symbol.size == 0 {
            return listing;
        }

        let mode = if symbol.thumb { IsaMode::Thumb } else { IsaMode::Native };
        if let Err(err) = decoder.set_mode(mode) {
            warn!(symbol = %symbol.name, error = %err, "symbol skipped");
            listing.complete = false;
            listing.anomalies.push(Anomaly::DecodeFailure {
                symbol: symbol.name.clone(),
                address: symbol.address,
                undecoded_bytes: symbol.size,
                reason: err.to_string(),
            });
            return listing;
        }

        let bytes = self.bytes.read(symbol.address, symbol.size).unwrap_or(&[]);
        let available = bytes.len() as u64;

        let mut offset = 0usize;
        while offset < bytes.len() {
            let address = symbol.address + offset as u64;
            if let Some(limit) = self.max_instructions {
                if listing.instructions.len() >= limit {
                    debug!(symbol = %symbol.name, limit, "instruction limit reached");
                    listing.complete = false;
                    listing.anomalies.push(Anomaly::InstructionLimit {
                        symbol: symbol.name.clone(),
                        address,
                        limit,
                    });
                    break;
                }
            }

            let decoded = decoder.decode(&bytes[offset..], address).and_then(|d| {
                let len = d.length as usize;
                if len == 0 || len > bytes.len() - offset {
                    Err(DecodeError::Truncated)
                } else {
                    Ok(d)
                }
            });
            let decoded = match decoded {
                Ok(decoded) => decoded,
                Err(err) => {
                    warn!(symbol = %symbol.name, address, error = %err, "decoding stopped");
                    listing.complete = false;
                    listing.anomalies.push(Anomaly::DecodeFailure {
                        symbol: symbol.name.clone(),
                        address,
                        undecoded_bytes: symbol.size - offset as u64,
                        reason: err.to_string(),
                    });
                    break;
                }
            };

            let kind = self.classify(&decoded);
            if let InstructionKind::Call(Transfer::Direct { target, callee: None })
            | InstructionKind::Branch(Transfer::Direct { target, callee: None }) = kind
            {
                debug!(symbol = %symbol.name, site = address, target, "target outside symbols");
                listing.anomalies.push(Anomaly::UnresolvedTarget {
                    symbol: symbol.name.clone(),
                    site: address,
                    target,
                });
            }
            listing.instructions.push(Instruction { address, length: decoded.length, kind });
            offset += decoded.length as usize;
        }
        listing.decoded_bytes = offset as u64;

        if listing.complete && available < symbol.size {
            let address = symbol.address + available;
            warn!(symbol = %symbol.name, address, "symbol runs past file-backed data");
            listing.complete = false;
            listing.anomalies.push(Anomaly::DecodeFailure {
                symbol: symbol.name.clone(),
                address,
                undecoded_bytes: symbol.size - available,
                reason: "no file-backed bytes".to_string(),
            });
        }
        listing
    }

    /// Disassemble every text symbol.
    ///
    /// `factory` builds one decoder per worker. Listings come back ordered by
    /// symbol id whether or not the work ran in parallel.
    pub fn disassemble_all<F, D>(&self, factory: F) -> Result<Disassembly, DecodeError>
    where
        F: Fn() -> Result<D, DecodeError> + Sync + Send,
        D: InstructionDecoder,
    {
        let _span = info_span!("disassemble", parallel = self.parallel).entered();
        let targets: Vec<&Symbol> = self.symbols.text_symbols().collect();

        let mut listings = if self.parallel {
            targets
                .par_iter()
                .map_init(&factory, |decoder, symbol| match decoder {
                    Ok(decoder) => Ok(self.disassemble_symbol(symbol, decoder)),
                    Err(err) => Err(err.clone()),
                })
                .collect::<Result<Vec<_>, _>>()?
        } else {
            let mut decoder = factory()?;
            targets.iter().map(|symbol| self.disassemble_symbol(symbol, &mut decoder)).collect()
        };
        listings.sort_by_key(|l| l.symbol);

        let disassembly = Disassembly { listings };
        info!(
            symbols = disassembly.listings.len(),
            instructions = disassembly.instruction_count(),
            traps = disassembly.trap_count(),
            "disassembly complete"
        );
        Ok(disassembly)
    }
}
