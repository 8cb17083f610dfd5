mod check_cmd;
mod config;
mod logging;
mod run_cmd;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use roost_core::error::{EX_USAGE, HarnessError};

use config::{CliOverrides, ConfigFile, InteractiveSection, QueueSection, RoostConfig};

#[derive(Parser)]
#[command(name = "roost", version, about = "Interactive execution harness for queued agent jobs")]
struct Cli {
    /// Config file (defaults to $XDG_CONFIG_HOME/roost/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log file (defaults to $XDG_STATE_HOME/roost/roost.log)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Queue API root (overrides ROOST_QUEUE_URL)
    #[arg(long, global = true)]
    queue_url: Option<String>,

    /// Habitat to claim work for (overrides ROOST_HABITAT)
    #[arg(long, global = true)]
    habitat: Option<String>,

    /// Queue within the habitat (overrides ROOST_QUEUE)
    #[arg(long, global = true)]
    queue: Option<String>,

    /// Worker identifier (overrides ROOST_WORKER_ID; random when unset)
    #[arg(long, global = true)]
    worker_id: Option<String>,

    /// Installed asset bundle directory
    #[arg(long, global = true)]
    asset_dir: Option<PathBuf>,

    /// Interactive CLI binary (overrides ROOST_INTERACTIVE_BINARY)
    #[arg(long, global = true)]
    interactive_binary: Option<String>,

    /// Only offer the subprocess backend
    #[arg(long, global = true)]
    no_interactive: bool,

    /// Never show the sidebar panel
    #[arg(long, global = true)]
    no_sidebar: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Claim and run jobs until stopped (default)
    Run,
    /// Write a roost config file
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Check backends, bundle and terminal without claiming work
    Check,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            config: self.config.clone(),
            queue_url: self.queue_url.clone(),
            habitat: self.habitat.clone(),
            queue: self.queue.clone(),
            worker_id: self.worker_id.clone(),
            asset_dir: self.asset_dir.clone(),
            interactive_binary: self.interactive_binary.clone(),
            no_interactive: self.no_interactive,
            no_sidebar: self.no_sidebar,
        }
    }
}

// -----------------------------------------------------------------------
// Commands
// -----------------------------------------------------------------------

/// Execute the `roost init` command: write a config file from flags.
fn cmd_init(cli: &Cli, force: bool) -> anyhow::Result<()> {
    let path = cli.config.clone().unwrap_or_else(config::config_path);

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }
    let Some(url) = cli.queue_url.clone() else {
        anyhow::bail!("--queue-url is required for `roost init`");
    };
    let Some(habitat) = cli.habitat.clone() else {
        anyhow::bail!("--habitat is required for `roost init`");
    };

    let token = std::env::var("ROOST_TOKEN").ok().filter(|t| !t.is_empty());
    let cfg = ConfigFile {
        queue: QueueSection {
            url: Some(url.clone()),
            habitat: Some(habitat.clone()),
            queue: Some(cli.queue.clone().unwrap_or_else(|| config::DEFAULT_QUEUE.to_string())),
            token: token.clone(),
        },
        interactive: InteractiveSection {
            enabled: Some(!cli.no_interactive),
            binary: cli.interactive_binary.clone(),
            ..InteractiveSection::default()
        },
        ..ConfigFile::default()
    };

    config::save_config(&path, &cfg)?;

    println!("Config written to {}", path.display());
    println!("  queue.url = {url}");
    println!("  queue.habitat = {habitat}");
    if token.is_some() {
        println!("  queue.token = (from ROOST_TOKEN)");
    } else {
        println!("  queue.token not set; export ROOST_TOKEN or edit the file.");
    }
    println!();
    println!("Next: run `roost check`, then `roost`.");
    Ok(())
}

/// Execute `roost run`. Setup failures map to `EX_USAGE`.
async fn cmd_run(cli: &Cli) -> anyhow::Result<i32> {
    let resolved = match RoostConfig::resolve(&cli.overrides()) {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("roost: {e:#}");
            return Ok(EX_USAGE);
        }
    };
    let log_path = logging::init(cli.log_file.as_deref())?;
    tracing::info!(log = %log_path.display(), "logging initialised");

    match run_cmd::run(resolved).await {
        Ok(report) => {
            println!("{}", run_cmd::summary(&report));
            Ok(0)
        }
        Err(e) => match e.downcast_ref::<HarnessError>() {
            Some(setup) => {
                tracing::error!(error = %setup, "setup failed");
                eprintln!("roost: {setup}");
                Ok(setup.exit_code())
            }
            None => Err(e),
        },
    }
}

/// Execute `roost check`.
async fn cmd_check(cli: &Cli) -> anyhow::Result<i32> {
    logging::init_stderr();
    let resolved = RoostConfig::resolve(&cli.overrides()).context("configuration is incomplete")?;
    if check_cmd::run_check(&resolved).await {
        Ok(0)
    } else {
        Ok(EX_USAGE)
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Some(Commands::Init { force }) => cmd_init(&cli, force).map(|()| 0),
        Some(Commands::Check) => cmd_check(&cli).await,
        Some(Commands::Run) | None => cmd_run(&cli).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("roost: {e:#}");
            1
        }
    };
    std::process::exit(code);
}


#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn bare_invocation_runs() {
        let cli = Cli::try_parse_from(["roost", "--habitat", "h", "--no-sidebar"]).unwrap();
        assert!(cli.command.is_none());
        let overrides = cli.overrides();
        assert_eq!(overrides.habitat.as_deref(), Some("h"));
        assert!(overrides.no_sidebar);
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from(["roost", "check", "--no-interactive", "--queue", "q2"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Check)));
        assert!(cli.no_interactive);
        assert_eq!(cli.queue.as_deref(), Some("q2"));
    }
}
