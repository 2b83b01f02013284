use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span};

use crate::analysis::{
    CallGraph, CallGraphBuilder, Disassembly, DisassemblyAnalyzer, Finding, PrivilegeMap,
    SectionClassifier, SymbolAnalyzer, SymbolTable,
};
use crate::backends::{ByteSource, DecodeError, ImageError, InstructionDecoder};
use crate::model::{Anomaly, RawSection, RawSymbol};
use crate::policy::{PolicyConfig, PolicyError, PrivilegePolicy};
use crate::services::report::{AuditReport, AuditSummary};

#[cfg(feature = "capstone-backend")]
use crate::backends::{BinaryImage, CapstoneDecoder};
#[cfg(feature = "capstone-backend")]
use std::path::Path;

/// Knobs for one audit run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditOptions {
    /// Count jumps to another symbol's entry as calls.
    pub tail_calls: bool,
    /// Per-symbol instruction budget.
    pub max_instructions: Option<usize>,
    /// Disassemble symbols on the rayon pool.
    pub parallel: bool,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self { tail_calls: false, max_instructions: None, parallel: true }
    }
}

/// Fatal errors. Anything recoverable becomes an [`Anomaly`] instead.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("Failed to initialise instruction decoder: {0}")]
    Decoder(#[from] DecodeError),
}

/// Every stage's output for one image.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub privilege_map: PrivilegeMap,
    pub symbols: SymbolTable,
    pub disassembly: Disassembly,
    pub graph: CallGraph,
    pub findings: Vec<Finding>,
}

impl Analysis {
    /// Anomalies from all stages, in stage order.
    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.privilege_map
            .anomalies()
            .iter()
            .chain(self.symbols.anomalies())
            .chain(self.disassembly.anomalies())
            .chain(self.graph.anomalies())
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> AuditSummary {
        let sections = self.privilege_map.sections();
        AuditSummary {
            sections: sections.len(),
            executable_sections: sections.iter().filter(|s| s.flags.executable).count(),
            symbols: self.symbols.len(),
            text_symbols: self.symbols.text_symbols().count(),
            instructions: self.disassembly.instruction_count(),
            call_edges: self.graph.edge_count(),
            traps: self.disassembly.trap_count(),
            ..AuditSummary::default()
        }
    }

    pub fn report(&self) -> AuditReport {
        AuditReport::new(self.summary(), self.findings.clone(), self.anomalies())
    }

    pub fn to_dot(&self) -> String {
        self.graph.to_dot(&self.symbols)
    }
}

/// Runs the four stages in order with a fixed policy and options.
#[derive(Debug, Clone, Default)]
pub struct Auditor {
    policy: PrivilegePolicy,
    options: AuditOptions,
}

impl Auditor {
    pub fn new(policy: PrivilegePolicy, options: AuditOptions) -> Self {
        Self { policy, options }
    }

    /// Compile `config` and build an auditor from it.
    pub fn from_config(config: &PolicyConfig, options: AuditOptions) -> Result<Self, AuditError> {
        Ok(Self::new(config.compile()?, options))
    }

    pub fn policy(&self) -> &PrivilegePolicy {
        &self.policy
    }

    pub fn options(&self) -> &AuditOptions {
        &self.options
    }

    /// Full pipeline over already-extracted image facts.
    pub fn analyze<F, D>(
        &self,
        sections: &[RawSection],
        symbols: &[RawSymbol],
        bytes: &dyn ByteSource,
        decoder_factory: F,
    ) -> Result<Analysis, AuditError>
    where
        F: Fn() -> Result<D, DecodeError> + Sync + Send,
        D: InstructionDecoder,
    {
        let _span = info_span!("audit").entered();

        let privilege_map = SectionClassifier::new(&self.policy).classify(sections);
        let table = SymbolAnalyzer::new(&privilege_map, &self.policy).analyze(symbols);
        let disassembly = DisassemblyAnalyzer::new(&table, bytes)
            .with_instruction_limit(self.options.max_instructions)
            .parallel(self.options.parallel)
            .disassemble_all(decoder_factory)?;
        let graph = CallGraphBuilder::new(&table)
            .with_tail_calls(self.options.tail_calls)
            .build(&disassembly);
        let findings = graph.evaluate(&table);

        info!(findings = findings.len(), "audit finished");
        Ok(Analysis { privilege_map, symbols: table, disassembly, graph, findings })
    }

    #[cfg(feature = "capstone-backend")]
    pub fn analyze_image(&self, image: &BinaryImage) -> Result<Analysis, AuditError> {
        let arch = image.arch();
        self.analyze(image.sections(), image.symbols(), image, move || CapstoneDecoder::new(arch))
    }

    #[cfg(feature = "capstone-backend")]
    pub fn audit_image(&self, image: &BinaryImage) -> Result<AuditReport, AuditError> {
        Ok(self.analyze_image(image)?.report().with_arch(image.arch()))
    }

    #[cfg(feature = "capstone-backend")]
    pub fn audit_path(&self, path: &Path) -> Result<AuditReport, AuditError> {
        let image = BinaryImage::open(path)?;
        self.audit_image(&image)
    }
}
