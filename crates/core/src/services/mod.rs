//! Orchestration on top of the analysis stages.

pub mod audit;
pub mod report;

pub use audit::{Analysis, AuditError, AuditOptions, Auditor};
pub use report::{AuditReport, AuditSummary, ImageInfo};
