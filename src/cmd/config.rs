//! Configuration view and validation commands (`buildforge config`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::super::ConfigCommands;
use buildforge::config::{CONFIG_DIR, CONFIG_FILE, Config};

fn project_config_path(project_dir: &Path, explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| project_dir.join(CONFIG_DIR).join(CONFIG_FILE))
}

pub fn cmd_config(config: &Config, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!("# Effective configuration (file, environment and CLI overrides)");
            println!("# Database: {}", config.db_path().display());
            println!();
            let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
            println!("{}", rendered);
            if !config.seed_keys.is_empty() {
                println!("# {} provider key(s) from BUILDFORGE_PROVIDER_KEYS", config.seed_keys.len());
            }
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        // Handled before the config is resolved.
        Some(ConfigCommands::Init { .. }) => {}
    }

    Ok(())
}

pub fn cmd_config_init(project_dir: &Path, explicit: Option<&Path>, force: bool) -> Result<()> {
    let path = project_config_path(project_dir, explicit);
    if path.exists() && !force {
        println!("buildforge.toml already exists at {}", path.display());
        println!("Pass --force to overwrite it.");
        return Ok(());
    }

    Config::default().save(&path)?;

    println!("Created buildforge.toml at {}", path.display());
    println!();
    println!("You can now customize:");
    println!("  - [provider] kind, default_model, timeouts");
    println!("  - [queue] workers, max_attempts, backoff");
    println!("  - [plans.<name>] daily, monthly, concurrent");
    Ok(())
}
