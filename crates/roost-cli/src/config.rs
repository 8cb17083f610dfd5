//! Configuration file management for roost.
//!
//! Provides a TOML-based config file at `~/.config/roost/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use roost_core::backend::interactive::InteractiveConfig;
use roost_core::config::HarnessConfig;
use roost_core::queue::HttpQueueConfig;
use roost_core::snapshot::SessionInfo;

/// Queue used when none is configured.
pub const DEFAULT_QUEUE: &str = "default";

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub harness: HarnessSection,
    #[serde(default)]
    pub interactive: InteractiveSection,
    #[serde(default)]
    pub ui: UiSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct QueueSection {
    /// API root of the remote queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub habitat: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    /// Bearer token presented to the queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Intervals and timeouts. Unset keys keep the core defaults.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct HarnessSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_jitter_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_call_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_grace_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_attempts: Option<u32>,
    /// Installed asset bundle directory (contains `bundle.json`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_dir: Option<PathBuf>,
    /// JSONL transcript of all backend output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct InteractiveSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Generate the Claude Code `Stop` hook settings file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_hook: Option<bool>,
    /// Sent after each completed turn; empty disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker_poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UiSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidebar: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_tick_ms: Option<u64>,
}

const APP_DIR: &str = "roost";

/// `$var/roost`, or `~/<home_fallback>/roost` when `var` is unset or
/// empty. XDG layout is used on every platform.
fn xdg_dir(var: &str, home_fallback: &[&str]) -> PathBuf {
    if let Some(base) = std::env::var_os(var).filter(|v| !v.is_empty()) {
        return PathBuf::from(base).join(APP_DIR);
    }
    let mut dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    dir.extend(home_fallback);
    dir.join(APP_DIR)
}

pub fn config_dir() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", &[".config"])
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Where the log file and transcripts go.
pub fn state_dir() -> PathBuf {
    xdg_dir("XDG_STATE_HOME", &[".local", "state"])
}

/// Load and parse a config file.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Write `config` to `path`, creating parent dirs.
///
/// The file may hold the queue token: it is created 0600 in the target
/// directory and renamed over `path`, so readers see the old or the new
/// file and never a partial one.
pub fn save_config(path: &Path, config: &ConfigFile) -> Result<()> {
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    let mut staged = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to stage config in {}", dir.display()))?;
    staged
        .write_all(contents.as_bytes())
        .context("failed to write staged config")?;
    staged
        .persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

/// Values given on the command line; `None` defers to env and file.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub config: Option<PathBuf>,
    pub queue_url: Option<String>,
    pub habitat: Option<String>,
    pub queue: Option<String>,
    pub worker_id: Option<String>,
    pub asset_dir: Option<PathBuf>,
    pub interactive_binary: Option<String>,
    pub no_interactive: bool,
    pub no_sidebar: bool,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct RoostConfig {
    pub queue: HttpQueueConfig,
    pub session: SessionInfo,
    pub harness: HarnessConfig,
    /// `None` when the interactive backend is disabled.
    pub interactive: Option<InteractiveConfig>,
    pub asset_dir: Option<PathBuf>,
    pub transcript: PathBuf,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    match env_var(name) {
        None => Ok(None),
        Some(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => bail!("{name} must be a boolean, got {v:?}"),
        },
    }
}

/// First present value of CLI flag, env var, config file.
fn pick(cli: Option<&str>, env: &str, file: Option<&String>) -> Option<String> {
    cli.map(str::to_string)
        .or_else(|| env_var(env))
        .or_else(|| file.cloned())
}

impl RoostConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - Queue URL: `--queue-url` > `ROOST_QUEUE_URL` > `queue.url` > error
    /// - Habitat: `--habitat` > `ROOST_HABITAT` > `queue.habitat` > error
    /// - Queue: `--queue` > `ROOST_QUEUE` > `queue.queue` > `default`
    /// - Token: `ROOST_TOKEN` > `queue.token` > none
    /// - Worker id: `--worker-id` > `ROOST_WORKER_ID` > random UUID
    ///
    /// An explicit `--config` must exist; the default path is optional.
    pub fn resolve(cli: &CliOverrides) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => load_config(path)?,
            None => {
                let path = config_path();
                if path.exists() {
                    load_config(&path)?
                } else {
                    ConfigFile::default()
                }
            }
        };
        Self::resolve_with(cli, file)
    }

    fn resolve_with(cli: &CliOverrides, file: ConfigFile) -> Result<Self> {
        let Some(base_url) = pick(cli.queue_url.as_deref(), "ROOST_QUEUE_URL", file.queue.url.as_ref()) else {
            bail!("queue URL not set; pass --queue-url, set ROOST_QUEUE_URL or run `roost init`");
        };
        let Some(habitat_id) = pick(cli.habitat.as_deref(), "ROOST_HABITAT", file.queue.habitat.as_ref()) else {
            bail!("habitat not set; pass --habitat, set ROOST_HABITAT or run `roost init`");
        };
        let queue_id = pick(cli.queue.as_deref(), "ROOST_QUEUE", file.queue.queue.as_ref())
            .unwrap_or_else(|| DEFAULT_QUEUE.to_string());
        let token = env_var("ROOST_TOKEN").or(file.queue.token);
        let worker_id = pick(cli.worker_id.as_deref(), "ROOST_WORKER_ID", None)
            .unwrap_or_else(|| format!("roost-{}", uuid::Uuid::new_v4().simple()));

        let harness = harness_config(cli, &file.harness, &file.ui)?;
        let queue = HttpQueueConfig {
            base_url,
            token,
            request_timeout: harness.remote_call_timeout,
        };

        let interactive_enabled = if cli.no_interactive {
            false
        } else {
            env_bool("ROOST_INTERACTIVE")?
                .or(file.interactive.enabled)
                .unwrap_or(true)
        };
        let interactive = interactive_enabled.then(|| interactive_config(cli, file.interactive));

        let asset_dir = cli
            .asset_dir
            .clone()
            .or_else(|| env_var("ROOST_ASSET_DIR").map(PathBuf::from))
            .or(file.harness.asset_dir);
        let transcript = env_var("ROOST_TRANSCRIPT")
            .map(PathBuf::from)
            .or(file.harness.transcript)
            .unwrap_or_else(|| state_dir().join("transcripts").join(format!("{worker_id}.jsonl")));

        Ok(Self {
            queue,
            session: SessionInfo {
                habitat_id,
                queue_id,
                worker_id,
            },
            harness,
            interactive,
            asset_dir,
            transcript,
        })
    }
}

fn harness_config(cli: &CliOverrides, section: &HarnessSection, ui: &UiSection) -> Result<HarnessConfig> {
    let defaults = HarnessConfig::default();
    let sidebar_enabled = if cli.no_sidebar {
        false
    } else {
        env_bool("ROOST_SIDEBAR")?.or(ui.sidebar).unwrap_or(defaults.sidebar_enabled)
    };
    let ms = |v: Option<u64>, d: Duration| v.map_or(d, Duration::from_millis);
    let secs = |v: Option<u64>, d: Duration| v.map_or(d, Duration::from_secs);

    let config = HarnessConfig {
        poll_interval: ms(section.poll_interval_ms, defaults.poll_interval),
        poll_jitter: ms(section.poll_jitter_ms, defaults.poll_jitter),
        max_backoff: secs(section.max_backoff_secs, defaults.max_backoff),
        heartbeat_interval: secs(section.heartbeat_interval_secs, defaults.heartbeat_interval),
        remote_call_timeout: secs(section.remote_call_timeout_secs, defaults.remote_call_timeout),
        default_job_timeout: secs(section.job_timeout_secs, defaults.default_job_timeout),
        shutdown_grace: secs(section.shutdown_grace_secs, defaults.shutdown_grace),
        render_tick: ms(ui.render_tick_ms, defaults.render_tick),
        report_attempts: section.report_attempts.unwrap_or(defaults.report_attempts),
        sidebar_enabled,
    };
    if config.poll_interval.is_zero() {
        bail!("harness.poll_interval_ms must be greater than zero");
    }
    if config.heartbeat_interval.is_zero() {
        bail!("harness.heartbeat_interval_secs must be greater than zero");
    }
    if config.render_tick.is_zero() {
        bail!("ui.render_tick_ms must be greater than zero");
    }
    Ok(config)
}

fn interactive_config(cli: &CliOverrides, section: InteractiveSection) -> InteractiveConfig {
    let defaults = InteractiveConfig::default();
    InteractiveConfig {
        binary: pick(
            cli.interactive_binary.as_deref(),
            "ROOST_INTERACTIVE_BINARY",
            section.binary.as_ref(),
        )
        .unwrap_or(defaults.binary),
        args: section.args,
        settings_hook: section.settings_hook.unwrap_or(defaults.settings_hook),
        reset_command: match section.reset_command {
            Some(cmd) if cmd.trim().is_empty() => None,
            Some(cmd) => Some(cmd),
            None => defaults.reset_command,
        },
        marker_poll_interval: section
            .marker_poll_interval_ms
            .filter(|ms| *ms > 0)
            .map_or(defaults.marker_poll_interval, Duration::from_millis),
        ..InteractiveConfig::default()
    }
}
