//! Plan assignment (`buildforge plans`).

use anyhow::{Result, bail};

use super::super::PlansCommands;
use buildforge::config::Config;
use buildforge::runtime::open_database;

fn limit(value: Option<u32>) -> String {
    value.map_or_else(|| "unlimited".to_string(), |v| v.to_string())
}

pub fn cmd_plans(config: &Config, command: PlansCommands) -> Result<()> {
    let table = config.plan_table();

    match command {
        PlansCommands::Set { user, plan } => {
            if !table.contains(&plan) {
                bail!(
                    "Unknown plan '{}'. Known plans: {}",
                    plan,
                    table.names().join(", ")
                );
            }
            let db = open_database(config)?;
            let plan = plan.to_lowercase();
            db.set_user_plan(&user, &plan)?;
            println!("User {} is now on plan {}", user, plan);
        }
        PlansCommands::List => {
            println!("{:<12} {:<10} {:<10} CONCURRENT", "PLAN", "DAILY", "MONTHLY");
            for name in table.names() {
                let limits = table.limits(name);
                println!(
                    "{:<12} {:<10} {:<10} {}",
                    name,
                    limit(limits.daily),
                    limit(limits.monthly),
                    limits.concurrent
                );
            }
        }
    }

    Ok(())
}
