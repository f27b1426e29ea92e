pub mod app;
pub mod icons;
#[cfg(windows)]
pub mod window;

use anyhow::{bail, Context};
use app::{Backends, Services};
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tsswitch_core::config::Settings;
use tsswitch_core::orchestrator::ToggleOutcome;
use tsswitch_core::OutputMode;

#[derive(Parser, Debug, Default)]
#[command(name = "tsswitch")]
#[command(about = "Toggle the Bopomofo IME between Traditional and Simplified output")]
pub struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Print the foreground layout and stored mode, then exit
    #[arg(long, conflicts_with_all = ["set", "toggle"])]
    pub status: bool,

    /// Print the status as JSON
    #[arg(long, requires = "status")]
    pub json: bool,

    /// Store an explicit mode and exit
    #[arg(long, value_name = "simplified|traditional", conflicts_with = "toggle")]
    pub set: Option<OutputMode>,

    /// Toggle once without starting the tray, then exit
    #[arg(long)]
    pub toggle: bool,

    /// Use an in-memory registry and skip the live refresh
    #[arg(long)]
    pub dry_run: bool,

    /// Write the default settings file and exit
    #[arg(long)]
    pub write_default_config: bool,
}

pub fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .try_init();
}

fn settings_path(cli: &Cli) -> Option<PathBuf> {
    cli.config.clone().or_else(Settings::default_path)
}

fn report(outcome: &ToggleOutcome) -> String {
    match outcome {
        ToggleOutcome::Confirmed { mode, location, refresh } => {
            let note = if refresh.degraded() {
                " (live refresh incomplete)"
            } else {
                ""
            };
            format!("{mode} output stored at {location}{note}")
        }
        ToggleOutcome::Unconfirmed {
            target,
            observed,
            location,
            ..
        } => format!("wrote {target} to {location}, but it still reads {observed}"),
        ToggleOutcome::Skipped(reason) => format!("skipped: {reason}"),
    }
}

fn backends(cli: &Cli, settings: &Settings) -> anyhow::Result<Backends> {
    if cli.dry_run {
        info!("Dry run: registry changes stay in memory");
        return Ok(Backends::dry_run(settings));
    }
    #[cfg(windows)]
    {
        Ok(Backends::native())
    }
    #[cfg(not(windows))]
    {
        bail!("this needs Windows; use --dry-run to try it elsewhere")
    }
}

pub fn run(cli: Cli) -> anyhow::Result<()> {
    let started = Instant::now();
    let path = settings_path(&cli);

    if cli.write_default_config {
        let Some(path) = path else {
            bail!("no config directory available; pass --config");
        };
        Settings::default()
            .save(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("{}", path.display());
        return Ok(());
    }

    let settings = Settings::load_or_default(path.as_deref());
    let services = Services::build(settings.clone(), backends(&cli, &settings)?);

    if cli.status {
        let status = services.status();
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&status)?);
        } else {
            println!("{status}");
        }
        return Ok(());
    }
    if let Some(mode) = cli.set {
        let outcome = services.orchestrator.apply(mode)?;
        println!("{}", report(&outcome));
        return Ok(());
    }
    if cli.toggle {
        let outcome = services.orchestrator.toggle()?;
        if matches!(outcome, ToggleOutcome::Skipped(_)) {
            warn!("{}", report(&outcome));
        }
        println!("{}", report(&outcome));
        return Ok(());
    }

    run_tray(services, started)
}

#[cfg(windows)]
fn run_tray(services: Services, started: Instant) -> anyhow::Result<()> {
    window::run_tray(services, started)
}

#[cfg(not(windows))]
fn run_tray(_services: Services, _started: Instant) -> anyhow::Result<()> {
    bail!("the tray needs Windows; try --status, --set or --toggle")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_one_shot_flags() {
        let cli = Cli::parse_from(["tsswitch", "--dry-run", "--set", "simplified"]);
        assert!(cli.dry_run);
        assert_eq!(cli.set, Some(OutputMode::Simplified));

        assert!(Cli::try_parse_from(["tsswitch", "--status", "--toggle"]).is_err());
        assert!(Cli::try_parse_from(["tsswitch", "--set", "purple"]).is_err());
        assert!(Cli::try_parse_from(["tsswitch", "--json"]).is_err());
    }

    #[test]
    fn write_default_config_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        run(Cli {
            config: Some(path.clone()),
            write_default_config: true,
            ..Cli::default()
        })
        .unwrap();
        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.layout.target, Settings::default().layout.target);
    }

    #[test]
    fn dry_run_toggle_and_set() {
        let dir = tempfile::tempdir().unwrap();
        let config = Some(dir.path().join("missing.json"));
        run(Cli {
            config: config.clone(),
            dry_run: true,
            toggle: true,
            ..Cli::default()
        })
        .unwrap();
        run(Cli {
            config,
            dry_run: true,
            set: Some(OutputMode::Traditional),
            ..Cli::default()
        })
        .unwrap();
    }
}
