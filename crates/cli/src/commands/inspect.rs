use std::path::Path;

use anyhow::{Context, Result};
use privgate_core::analysis::{PrivilegeMap, SectionClassifier, SymbolAnalyzer};
use privgate_core::backends::BinaryImage;
use privgate_core::policy::PrivilegePolicy;

use crate::load_policy;

fn open_classified(
    image_path: &Path,
    policy_path: Option<&Path>,
) -> Result<(BinaryImage, PrivilegePolicy, PrivilegeMap)> {
    let policy = load_policy(policy_path)?.compile().context("Invalid policy")?;
    let image = BinaryImage::open(image_path)
        .with_context(|| format!("Failed to load image {}", image_path.display()))?;
    let map = SectionClassifier::new(&policy).classify(image.sections());
    Ok((image, policy, map))
}

fn flag_string(executable: bool, writable: bool, allocatable: bool) -> String {
    format!(
        "{}{}{}",
        if allocatable { 'a' } else { '-' },
        if writable { 'w' } else { '-' },
        if executable { 'x' } else { '-' }
    )
}

/// List sections with their privilege labels.
pub fn sections_command(image: &Path, policy: Option<&Path>, json: bool) -> Result<()> {
    let (_image, _policy, map) = open_classified(image, policy)?;

    if json {
        let out = serde_json::to_string_pretty(map.sections())?;
        println!("{}", out);
        return Ok(());
    }

    println!("Sections ({}):", map.sections().len());
    for s in map.sections() {
        println!(
            "  [{:>2}] {:<24} 0x{:08x}-0x{:08x} {} {}",
            s.id.0,
            s.name,
            s.address,
            s.end(),
            flag_string(s.flags.executable, s.flags.writable, s.flags.allocatable),
            s.privilege
        );
    }
    for anomaly in map.anomalies() {
        println!("  ! {anomaly}");
    }
    Ok(())
}

/// List resolved symbols.
pub fn symbols_command(image: &Path, policy: Option<&Path>, json: bool) -> Result<()> {
    let (image, policy, map) = open_classified(image, policy)?;
    let table = SymbolAnalyzer::new(&map, &policy).analyze(image.symbols());

    if json {
        let out = serde_json::to_string_pretty(table.symbols())?;
        println!("{}", out);
        return Ok(());
    }

    println!("Symbols ({}):", table.len());
    for sym in table.symbols() {
        let section = sym
            .section
            .and_then(|id| map.section(id))
            .map(|s| s.name.as_str())
            .unwrap_or("-");
        print!(
            "  0x{:08x} {:>6} {:<9} {:<12} {:<16} {}",
            sym.address,
            sym.size,
            sym.size_source.as_str(),
            sym.privilege,
            section,
            sym.name
        );
        if sym.aliases.is_empty() {
            println!();
        } else {
            println!(" (aliases: {})", sym.aliases.join(", "));
        }
    }
    Ok(())
}
