use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use privgate::commands::{
    audit_command, policy_command, sections_command, symbols_command, AuditArgs,
};
use privgate::init_logging;

/// Static privilege-boundary auditor.
///
/// This CLI is a thin wrapper around `privgate-core` (exposed in code as
/// `privgate_core`). All substantive logic lives in the library so it can be
/// tested thoroughly and reused from other frontends.
///
/// Exit status: 0 when no violations are found, 1 when at least one is, 2 on
/// any fatal error.
#[derive(Parser, Debug)]
#[command(
    name = "privgate",
    version,
    about = "Audit executable images for privilege-boundary violations",
    long_about = None
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace). Logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full pipeline and report direct calls that cross into
    /// privileged code without a gate.
    Audit(AuditArgs),

    /// Show every section with its privilege label.
    Sections {
        /// ELF image to inspect.
        image: PathBuf,

        /// Classification policy (YAML, or JSON by `.json` extension).
        #[arg(long)]
        policy: Option<PathBuf>,

        /// Emit JSON instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Show resolved symbols with privilege, size source, and aliases.
    Symbols {
        /// ELF image to inspect.
        image: PathBuf,

        /// Classification policy (YAML, or JSON by `.json` extension).
        #[arg(long)]
        policy: Option<PathBuf>,

        /// Emit JSON instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Print the built-in classification policy.
    ///
    /// The output is a valid policy file and a starting point for
    /// project-specific rules.
    Policy {
        /// Emit JSON instead of YAML.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn run(cli: Cli) -> Result<ExitCode> {
    let Some(command) = cli.command else {
        banner();
        return Ok(ExitCode::SUCCESS);
    };

    match command {
        Command::Audit(args) => {
            if audit_command(&args)? {
                return Ok(ExitCode::from(1));
            }
        }
        Command::Sections { image, policy, json } => {
            sections_command(&image, policy.as_deref(), json)?
        }
        Command::Symbols { image, policy, json } => {
            symbols_command(&image, policy.as_deref(), json)?
        }
        Command::Policy { json } => policy_command(json)?,
    }

    Ok(ExitCode::SUCCESS)
}

fn banner() {
    println!("privgate v{}", privgate_core::version());
    println!(
        "decoder: capstone {}",
        privgate_core::backends::capstone::capstone_version()
    );
    println!("Run `privgate --help` for usage.");
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(2)
        }
    }
}
