use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use buildforge::config::{CliOverrides, Config, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "buildforge")]
#[command(version, about = "AI build orchestrator: prompt in, validated source files out")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Config file to use instead of .buildforge/buildforge.toml
    #[arg(long, global = true, env = "BUILDFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// SQLite database shared by the server, workers and CLI
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    /// Log output: pretty or json
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API and the background worker pool
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Worker pool size
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Run one build inline and print its events as JSON lines
    Build {
        /// What to build
        prompt: String,

        /// Caller identity used for plan limits and ownership
        #[arg(long, env = "BUILDFORGE_USER", default_value = "local")]
        user: String,

        /// Re-run an existing build id (supersedes its files)
        #[arg(long)]
        build_id: Option<String>,

        #[arg(long)]
        project_id: Option<String>,

        #[arg(short, long)]
        model: Option<String>,

        /// Treat validator warnings as errors
        #[arg(long)]
        strict: bool,

        #[arg(long)]
        max_fix_iterations: Option<u32>,

        /// Existing files passed to the model as context (repeatable)
        #[arg(long = "context")]
        context: Vec<PathBuf>,

        /// Suppress raw generation chunks
        #[arg(long)]
        no_chunks: bool,
    },
    /// Manage provider credentials
    Keys {
        #[command(subcommand)]
        command: KeysCommands,
    },
    /// Manage user plan assignments
    Plans {
        #[command(subcommand)]
        command: PlansCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Show queue statistics
    Stats {
        /// Include active build count for this user
        #[arg(long, default_value = "local")]
        user: String,

        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum KeysCommands {
    /// Add a credential at the end of a provider's failover order
    Add {
        secret: String,

        #[arg(long)]
        provider: Option<String>,
    },
    /// List credentials (fingerprints only)
    List {
        #[arg(long)]
        provider: Option<String>,
    },
    /// Clear every rate-limit and health cooldown
    Reset,
}

#[derive(Subcommand, Clone)]
pub enum PlansCommands {
    /// Assign a plan to a user
    Set { user: String, plan: String },
    /// List known plans and their limits
    List,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default buildforge.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let mut overrides = CliOverrides {
        db_path: cli.db_path.clone(),
        log_format: cli.log_format,
        ..Default::default()
    };
    match &cli.command {
        Commands::Serve {
            host,
            port,
            workers,
        } => {
            overrides.host = host.clone();
            overrides.port = *port;
            overrides.workers = *workers;
        }
        Commands::Build { model, .. } => overrides.model = model.clone(),
        _ => {}
    }

    // `config init` must work even when the existing file is broken.
    if let Commands::Config {
        command: Some(ConfigCommands::Init { force }),
    } = &cli.command
    {
        return cmd::cmd_config_init(&project_dir, cli.config.as_deref(), *force);
    }

    let config = Config::resolve(&project_dir, cli.config.as_deref(), &overrides)?;
    let _log_guard = buildforge::logging::init(&config.logging, cli.verbose)?;

    match &cli.command {
        Commands::Serve { .. } => cmd::cmd_serve(config).await?,
        Commands::Build {
            prompt,
            user,
            build_id,
            project_id,
            model,
            strict,
            max_fix_iterations,
            context,
            no_chunks,
        } => {
            let args = cmd::BuildArgs {
                prompt: prompt.clone(),
                user: user.clone(),
                build_id: build_id.clone(),
                project_id: project_id.clone(),
                model: model.clone(),
                strict: *strict,
                max_fix_iterations: *max_fix_iterations,
                context: context.clone(),
                chunks: !*no_chunks,
            };
            cmd::cmd_build(config, &project_dir, args).await?;
        }
        Commands::Keys { command } => cmd::cmd_keys(&config, command.clone())?,
        Commands::Plans { command } => cmd::cmd_plans(&config, command.clone())?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
        Commands::Stats { user, json } => cmd::cmd_stats(config, user, *json).await?,
    }

    Ok(())
}
