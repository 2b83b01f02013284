use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use privgate_core::backends::BinaryImage;
use privgate_core::{AuditOptions, Auditor};
use tracing::info;

use crate::{emit, load_policy, sha256_file};

#[derive(Args, Debug, Clone)]
pub struct AuditArgs {
    /// ELF image to audit.
    pub image: PathBuf,

    /// Classification policy (YAML, or JSON by `.json` extension).
    #[arg(long)]
    pub policy: Option<PathBuf>,

    /// Emit the report as JSON instead of text.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Write the report to this file instead of stdout.
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// Also write the call graph as Graphviz DOT to this file.
    #[arg(long)]
    pub dot: Option<PathBuf>,

    /// Treat jumps to another symbol's entry as calls.
    #[arg(long, default_value_t = false)]
    pub tail_calls: bool,

    /// Stop decoding a symbol after this many instructions.
    #[arg(long)]
    pub max_instructions: Option<usize>,

    /// Disassemble on a single thread.
    #[arg(long, default_value_t = false)]
    pub sequential: bool,
}

impl AuditArgs {
    pub fn options(&self) -> AuditOptions {
        AuditOptions {
            tail_calls: self.tail_calls,
            max_instructions: self.max_instructions,
            parallel: !self.sequential,
        }
    }
}

/// Run the full audit. Returns whether any violation was found.
pub fn audit_command(args: &AuditArgs) -> Result<bool> {
    let config = load_policy(args.policy.as_deref())?;
    let auditor = Auditor::from_config(&config, args.options()).context("Invalid policy")?;

    let image = BinaryImage::open(&args.image)
        .with_context(|| format!("Failed to load image {}", args.image.display()))?;
    let sha256 = sha256_file(&args.image)?;
    let analysis = auditor
        .analyze_image(&image)
        .with_context(|| format!("Failed to audit {}", args.image.display()))?;

    let report = analysis
        .report()
        .with_arch(image.arch())
        .with_image(args.image.display().to_string(), sha256);

    if let Some(dot_path) = &args.dot {
        fs::write(dot_path, analysis.to_dot())
            .with_context(|| format!("Failed to write DOT graph to {}", dot_path.display()))?;
        info!(path = %dot_path.display(), "call graph written");
    }

    let body = if args.json {
        report.to_json().context("Failed to serialize report")?
    } else {
        report.to_string()
    };
    emit(args.output.as_deref(), &body)?;
    info!(
        image = %args.image.display(),
        violations = report.summary.violations,
        findings = report.findings.len(),
        "audit complete"
    );

    Ok(report.has_violations())
}
