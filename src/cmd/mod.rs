//! CLI command implementations.
//!
//! | Module    | Commands handled  |
//! |-----------|-------------------|
//! | `serve`   | `Serve`           |
//! | `build`   | `Build`           |
//! | `keys`    | `Keys`            |
//! | `plans`   | `Plans`           |
//! | `config`  | `Config`          |
//! | `stats`   | `Stats`           |

pub mod build;
pub mod config;
pub mod keys;
pub mod plans;
pub mod serve;
pub mod stats;

pub use build::{BuildArgs, cmd_build};
pub use config::{cmd_config, cmd_config_init};
pub use keys::cmd_keys;
pub use plans::cmd_plans;
pub use serve::cmd_serve;
pub use stats::cmd_stats;

use std::str::FromStr;

use anyhow::Result;
use buildforge::store::ProviderKind;

/// `--provider` flag, falling back to the configured provider.
fn provider_or(flag: Option<&str>, fallback: ProviderKind) -> Result<ProviderKind> {
    match flag {
        Some(name) => ProviderKind::from_str(name).map_err(anyhow::Error::msg),
        None => Ok(fallback),
    }
}
