//! Provider credential management (`buildforge keys`).

use anyhow::Result;
use chrono::Utc;

use super::super::KeysCommands;
use super::provider_or;
use buildforge::config::Config;
use buildforge::runtime::open_database;

pub fn cmd_keys(config: &Config, command: KeysCommands) -> Result<()> {
    let db = open_database(config)?;

    match command {
        KeysCommands::Add { secret, provider } => {
            let provider = provider_or(provider.as_deref(), config.provider.kind)?;
            let secret = secret.trim();
            if secret.is_empty() {
                anyhow::bail!("Key secret must not be empty");
            }
            let key = db.add_provider_key(provider, secret)?;
            println!(
                "Added {} key {} (id {}, position {})",
                key.provider,
                key.fingerprint(),
                key.id,
                key.position
            );
        }
        KeysCommands::List { provider } => {
            let filter = match provider {
                Some(name) => Some(provider_or(Some(&name), config.provider.kind)?),
                None => None,
            };
            let keys = db.list_provider_keys(filter)?;
            if keys.is_empty() {
                println!("No provider keys configured.");
                println!("Add one with 'buildforge keys add <secret>'.");
                return Ok(());
            }
            let now = Utc::now();
            println!("{:<6} {:<10} {:<4} {:<14} {:<9} STATUS", "ID", "PROVIDER", "POS", "FINGERPRINT", "FAILURES");
            for key in keys {
                let status = match key.rate_limited_until {
                    Some(until) if until > now => format!("cooling down until {}", until.to_rfc3339()),
                    _ => "available".to_string(),
                };
                println!(
                    "{:<6} {:<10} {:<4} {:<14} {:<9} {}",
                    key.id,
                    key.provider.as_str(),
                    key.position,
                    key.fingerprint(),
                    key.failure_count,
                    status
                );
            }
        }
        KeysCommands::Reset => {
            let changed = db.reset_key_cooldowns()?;
            println!("Cleared cooldowns on {} key(s).", changed);
        }
    }

    Ok(())
}
