//! Init and Config commands.

use std::path::PathBuf;

use anyhow::{Result, anyhow, bail};

use crate::config::Settings;

/// Create `.sheetdex/settings.toml` with default settings.
pub fn run_init(force: bool) -> Result<()> {
    let config_path = PathBuf::from(".sheetdex/settings.toml");
    if config_path.exists() && !force {
        bail!(
            "Configuration file already exists at: {} (use --force to overwrite)",
            config_path.display()
        );
    }

    let path = Settings::init_config_file(force).map_err(|e| anyhow!("{e}"))?;
    println!("Created configuration file at: {}", path.display());
    println!("Edit this file to customize your settings.");
    Ok(())
}

/// Print the effective configuration as TOML.
pub fn run_config(config: &Settings) -> Result<()> {
    println!("Current Configuration:");
    println!("{}", "=".repeat(50));
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
