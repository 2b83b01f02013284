use std::fmt;

use serde::{Deserialize, Serialize};

use crate::analysis::{Finding, FindingCategory};
use crate::backends::Arch;
use crate::model::Anomaly;

/// Identity of the audited file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub path: String,
    pub sha256: String,
}

/// Counts over one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub sections: usize,
    pub executable_sections: usize,
    pub symbols: usize,
    pub text_symbols: usize,
    pub instructions: usize,
    pub call_edges: usize,
    /// Trap and supervisor-call instructions seen (sanctioned transitions).
    pub traps: usize,
    pub violations: usize,
    pub undetermined: usize,
    pub unresolved: usize,
    pub anomalies: usize,
}

/// Final output of an audit: findings, anomalies, and a summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<Arch>,
    pub summary: AuditSummary,
    pub findings: Vec<Finding>,
    pub anomalies: Vec<Anomaly>,
}

impl AuditReport {
    pub fn new(mut summary: AuditSummary, findings: Vec<Finding>, anomalies: Vec<Anomaly>) -> Self {
        let count = |category| findings.iter().filter(|f| f.category == category).count();
        summary.violations = count(FindingCategory::Violation);
        summary.undetermined = count(FindingCategory::UndeterminedCallee);
        summary.unresolved = count(FindingCategory::UnresolvedCall);
        summary.anomalies = anomalies.len();
        Self { image: None, arch: None, summary, findings, anomalies }
    }

    pub fn with_image(mut self, path: impl Into<String>, sha256: impl Into<String>) -> Self {
        self.image = Some(ImageInfo { path: path.into(), sha256: sha256.into() });
        self
    }

    pub fn with_arch(mut self, arch: Arch) -> Self {
        self.arch = Some(arch);
        self
    }

    pub fn violations(&self) -> impl Iterator<Item = &Finding> + '_ {
        self.findings.iter().filter(|f| f.category == FindingCategory::Violation)
    }

    pub fn violation_count(&self) -> usize {
        self.summary.violations
    }

    pub fn has_violations(&self) -> bool {
        self.violation_count() > 0
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for AuditReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(image) = &self.image {
            writeln!(f, "Image: {}", image.path)?;
            writeln!(f, "SHA-256: {}", image.sha256)?;
        }
        if let Some(arch) = self.arch {
            writeln!(f, "Arch: {arch}")?;
        }

        if self.findings.is_empty() {
            writeln!(f, "No findings.")?;
        } else {
            writeln!(f, "Findings:")?;
            for finding in &self.findings {
                writeln!(f, "  {finding}")?;
            }
        }

        if !self.anomalies.is_empty() {
            writeln!(f, "Anomalies:")?;
            for anomaly in &self.anomalies {
                writeln!(f, "  {anomaly}")?;
            }
        }

        let s = &self.summary;
        writeln!(
            f,
            "Summary: {} sections ({} executable), {} symbols ({} in text), {} instructions, {} call edges, {} traps",
            s.sections,
            s.executable_sections,
            s.symbols,
            s.text_symbols,
            s.instructions,
            s.call_edges,
            s.traps
        )?;
        write!(
            f,
            "Result: {} violation(s), {} undetermined callee(s), {} unresolved call(s), {} anomaly(ies)",
            s.violations, s.undetermined, s.unresolved, s.anomalies
        )
    }
}
