use anyhow::{Context, Result};
use privgate_core::PolicyConfig;

/// Print the built-in policy so it can be saved and edited.
pub fn policy_command(json: bool) -> Result<()> {
    let config = PolicyConfig::default();
    let out = (if json { config.to_json() } else { config.to_yaml() })
        .context("Failed to serialize default policy")?;
    print!("{}", out);
    if json {
        println!();
    }
    Ok(())
}
