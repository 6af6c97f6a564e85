//! Layered configuration: `.buildforge/buildforge.toml` (or the user-level
//! file), then `BUILDFORGE_*` environment variables, then CLI flags.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//!
//! [provider]
//! kind = "anthropic"
//! default_model = "claude-sonnet-4-5"
//! inline_timeout_secs = 120
//!
//! [pipeline]
//! max_fix_iterations = 3
//! stagnation_limit = 2
//!
//! [queue]
//! workers = 4
//! max_attempts = 3
//!
//! [plans.pro]
//! daily = 100
//! monthly = 2000
//! concurrent = 10
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::capacity::{PlanLimits, PlanTable};
use crate::orchestrator::admission::MAX_FIX_ITERATIONS_CAP;
use crate::orchestrator::{AdmissionDefaults, OrchestratorSettings};
use crate::queue::QueueConfig;
use crate::store::ProviderKind;

pub const CONFIG_DIR: &str = ".buildforge";
pub const CONFIG_FILE: &str = "buildforge.toml";
const ENV_PREFIX: &str = "BUILDFORGE_";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Relative paths resolve against the config directory.
    pub db_path: PathBuf,
    /// Permissive CORS for local front-end development.
    pub dev_cors: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            db_path: PathBuf::from("buildforge.db"),
            dev_cors: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderSection {
    pub kind: ProviderKind,
    /// Override the provider endpoint (proxies, compatible servers).
    pub base_url: Option<String>,
    pub default_model: String,
    pub inline_timeout_secs: u64,
    pub worker_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_tokens: u32,
    /// Consecutive failures before a key is cooled down.
    pub failure_threshold: u32,
    pub health_cooldown_secs: u64,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Anthropic,
            base_url: None,
            default_model: "claude-sonnet-4-5".into(),
            inline_timeout_secs: 120,
            worker_timeout_secs: 300,
            connect_timeout_secs: 10,
            max_tokens: 16_000,
            failure_threshold: 3,
            health_cooldown_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSection {
    pub max_fix_iterations: u32,
    pub strict_mode: bool,
    /// 0 disables the early exit.
    pub stagnation_limit: u32,
    pub explain_fixes: bool,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_fix_iterations: 3,
            strict_mode: false,
            stagnation_limit: 2,
            explain_fixes: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CapacitySection {
    pub store_timeout_ms: u64,
}

impl Default for CapacitySection {
    fn default() -> Self {
        Self {
            store_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSection {
    pub format: LogFormat,
    /// Directive used when `RUST_LOG` is unset.
    pub filter: Option<String>,
    /// Daily-rotated log files are written here when set.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub provider: ProviderSection,
    pub pipeline: PipelineSection,
    pub queue: QueueConfig,
    pub capacity: CapacitySection,
    /// Overrides and additions to the built-in plan table.
    pub plans: HashMap<String, PlanLimits>,
    pub logging: LoggingSection,
    /// Directory holding the config file; never serialized.
    #[serde(skip)]
    pub base_dir: PathBuf,
    /// Secrets from `BUILDFORGE_PROVIDER_KEYS`, seeded into the pool at start.
    #[serde(skip)]
    pub seed_keys: Vec<String>,
}

/// Flags that override file and environment settings.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub workers: Option<usize>,
    pub model: Option<String>,
    pub log_format: Option<LogFormat>,
}

impl Config {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse buildforge.toml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = Self::parse(&content)?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(config)
    }

    /// Project file, else the user-level file, else defaults rooted at
    /// `<project>/.buildforge`.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let project_file = project_dir.join(CONFIG_DIR).join(CONFIG_FILE);
        if project_file.exists() {
            return Self::load(&project_file);
        }
        if let Some(user_file) = user_config_file()
            && user_file.exists()
        {
            return Self::load(&user_file);
        }
        Ok(Self {
            base_dir: project_dir.join(CONFIG_DIR),
            ..Default::default()
        })
    }

    /// Full layering for the binary: `.env`, file, environment, CLI.
    pub fn resolve(project_dir: &Path, config_file: Option<&Path>, cli: &CliOverrides) -> Result<Self> {
        // A missing .env is normal.
        let _ = dotenvy::from_path(project_dir.join(".env"));
        let mut config = match config_file {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(project_dir)?,
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.apply_cli(cli);
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize buildforge.toml")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `BUILDFORGE_*` variables. The lookup is injectable for tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty())
        };
        if let Some(host) = var("HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("PORT") {
            self.server.port = port.parse().context("BUILDFORGE_PORT must be a port number")?;
        }
        if let Some(path) = var("DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Some(kind) = var("PROVIDER") {
            self.provider.kind = ProviderKind::from_str(&kind).map_err(anyhow::Error::msg)?;
        }
        if let Some(url) = var("PROVIDER_BASE_URL") {
            self.provider.base_url = Some(url);
        }
        if let Some(model) = var("MODEL") {
            self.provider.default_model = model;
        }
        if let Some(workers) = var("WORKERS") {
            self.queue.workers = workers
                .parse()
                .context("BUILDFORGE_WORKERS must be a number")?;
        }
        if let Some(n) = var("MAX_FIX_ITERATIONS") {
            self.pipeline.max_fix_iterations = n
                .parse()
                .context("BUILDFORGE_MAX_FIX_ITERATIONS must be a number")?;
        }
        if let Some(format) = var("LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        if let Some(dir) = var("LOG_DIR") {
            self.logging.dir = Some(PathBuf::from(dir));
        }
        if let Some(keys) = var("PROVIDER_KEYS") {
            self.seed_keys = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(())
    }

    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(host) = &cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(path) = &cli.db_path {
            self.server.db_path = path.clone();
        }
        if let Some(workers) = cli.workers {
            self.queue.workers = workers;
        }
        if let Some(model) = &cli.model {
            self.provider.default_model = model.clone();
        }
        if let Some(format) = cli.log_format {
            self.logging.format = format;
        }
    }

    pub fn db_path(&self) -> PathBuf {
        if self.server.db_path.is_absolute() {
            self.server.db_path.clone()
        } else {
            self.base_dir.join(&self.server.db_path)
        }
    }

    pub fn plan_table(&self) -> PlanTable {
        PlanTable::with_overrides(&self.plans)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.capacity.store_timeout_ms.max(1))
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            inline_timeout: Duration::from_secs(self.provider.inline_timeout_secs.max(1)),
            worker_timeout: Duration::from_secs(self.provider.worker_timeout_secs.max(1)),
            stagnation_limit: self.pipeline.stagnation_limit,
            explain_fixes: self.pipeline.explain_fixes,
        }
    }

    pub fn admission_defaults(&self) -> AdmissionDefaults {
        AdmissionDefaults {
            model: self.provider.default_model.clone(),
            provider: self.provider.kind,
            max_fix_iterations: self.pipeline.max_fix_iterations.min(MAX_FIX_ITERATIONS_CAP),
            strict_mode: self.pipeline.strict_mode,
        }
    }

    /// Human-readable problems that do not prevent startup.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.queue.workers == 0 {
            warnings.push("queue.workers is 0; one worker will be started".to_string());
        }
        if self.queue.max_attempts == 0 {
            warnings.push("queue.max_attempts is 0; jobs get a single attempt".to_string());
        }
        if self.queue.visibility_timeout_secs <= self.provider.worker_timeout_secs {
            warnings.push(format!(
                "queue.visibility_timeout_secs ({}) should exceed provider.worker_timeout_secs ({}), \
                 otherwise a slow but healthy job can be redelivered",
                self.queue.visibility_timeout_secs, self.provider.worker_timeout_secs
            ));
        }
        if self.queue.backoff_base_ms > self.queue.backoff_max_ms {
            warnings.push(format!(
                "queue.backoff_base_ms ({}) is larger than queue.backoff_max_ms ({})",
                self.queue.backoff_base_ms, self.queue.backoff_max_ms
            ));
        }
        if self.pipeline.max_fix_iterations > MAX_FIX_ITERATIONS_CAP {
            warnings.push(format!(
                "pipeline.max_fix_iterations ({}) is capped at {}",
                self.pipeline.max_fix_iterations, MAX_FIX_ITERATIONS_CAP
            ));
        }
        if self.provider.inline_timeout_secs == 0 || self.provider.worker_timeout_secs == 0 {
            warnings.push("provider timeouts of 0 are raised to 1 second".to_string());
        }
        let mut names: Vec<&String> = self.plans.keys().collect();
        names.sort();
        for name in names {
            let limits = &self.plans[name];
            if limits.concurrent == 0 {
                warnings.push(format!(
                    "plans.{}.concurrent is 0; users on this plan can never build",
                    name
                ));
            }
            if let (Some(daily), Some(monthly)) = (limits.daily, limits.monthly)
                && daily > monthly
            {
                warnings.push(format!(
                    "plans.{}.daily ({}) exceeds plans.{}.monthly ({})",
                    name, daily, name, monthly
                ));
            }
        }
        if let Some(url) = &self.provider.base_url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            warnings.push(format!("provider.base_url '{}' is not an http(s) URL", url));
        }

        warnings
    }
}

fn user_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("buildforge").join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.pipeline.max_fix_iterations, 3);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.backoff_base_ms, 1000);
        assert_eq!(config.provider.kind, ProviderKind::Anthropic);
    }

    #[test]
    fn test_parse_sections_and_plans() {
        let config = Config::parse(
            r#"
[server]
port = 9000

[provider]
kind = "openai"
default_model = "gpt-4o"

[queue]
workers = 8

[plans.team]
daily = 50
concurrent = 5
"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.provider.kind, ProviderKind::OpenAi);
        assert_eq!(config.queue.workers, 8);
        assert_eq!(config.queue.max_attempts, 3);
        let table = config.plan_table();
        assert_eq!(table.limits("team").concurrent, 5);
        assert_eq!(table.limits("team").monthly, None);
        assert_eq!(table.limits("pro").concurrent, 10);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(Config::parse("[server\nport = 1").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::parse("[server]\nport = 9000\n").unwrap();
        config
            .apply_env(env(&[
                ("BUILDFORGE_PORT", "9100"),
                ("BUILDFORGE_WORKERS", "6"),
                ("BUILDFORGE_PROVIDER", "openai"),
                ("BUILDFORGE_LOG_FORMAT", "json"),
                ("BUILDFORGE_PROVIDER_KEYS", "sk-a, sk-b,,"),
            ]))
            .unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.queue.workers, 6);
        assert_eq!(config.provider.kind, ProviderKind::OpenAi);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.seed_keys, ["sk-a", "sk-b"]);
    }

    #[test]
    fn test_bad_env_value_is_an_error() {
        let mut config = Config::default();
        assert!(config.apply_env(env(&[("BUILDFORGE_PORT", "lots")])).is_err());
    }

    #[test]
    fn test_cli_overrides_env() {
        let mut config = Config::default();
        config.apply_env(env(&[("BUILDFORGE_PORT", "9100")])).unwrap();
        config.apply_cli(&CliOverrides {
            port: Some(9200),
            model: Some("claude-opus".into()),
            ..Default::default()
        });
        assert_eq!(config.server.port, 9200);
        assert_eq!(config.admission_defaults().model, "claude-opus");
    }

    #[test]
    fn test_db_path_resolves_against_base_dir() {
        let config = Config {
            base_dir: PathBuf::from("/srv/app/.buildforge"),
            ..Default::default()
        };
        assert_eq!(config.db_path(), PathBuf::from("/srv/app/.buildforge/buildforge.db"));
    }

    #[test]
    fn test_validate_flags_short_visibility_timeout() {
        let mut config = Config::default();
        assert!(config.validate().is_empty(), "{:?}", config.validate());
        config.queue.visibility_timeout_secs = 60;
        config.plans.insert(
            "broken".into(),
            PlanLimits {
                daily: Some(10),
                monthly: Some(5),
                concurrent: 0,
            },
        );
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("visibility_timeout_secs")));
        assert!(warnings.iter().any(|w| w.contains("plans.broken.concurrent")));
        assert!(warnings.iter().any(|w| w.contains("plans.broken.daily")));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_DIR).join(CONFIG_FILE);
        let mut config = Config::default();
        config.queue.workers = 5;
        config.save(&path).unwrap();

        let loaded = Config::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.queue.workers, 5);
        assert_eq!(loaded.base_dir, dir.path().join(CONFIG_DIR));
    }
}
