// src/main.rs

//! debstrap - CLI entry point

use anyhow::Result;
use clap::Parser;
use debstrap::progress::CliProgress;
use debstrap::{BootstrapConfig, Bootstrapper};
use std::io::IsTerminal;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "debstrap")]
#[command(version)]
#[command(about = "Bootstrap a Debian or Ubuntu root filesystem from a package archive")]
struct Cli {
    /// Distribution suite (e.g. xenial, bookworm)
    suite: String,

    /// Directory to bootstrap into
    target: PathBuf,

    /// Archive mirror URL
    mirror: Option<String>,

    /// Resolve and print the package set without installing
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Target architecture (defaults to the host architecture)
    #[arg(short, long)]
    arch: Option<String>,

    /// Archive components, comma separated
    #[arg(long, value_delimiter = ',')]
    components: Option<Vec<String>>,

    /// Extra packages to install, comma separated
    #[arg(long, value_delimiter = ',')]
    packages: Option<Vec<String>>,

    /// Keyring file copied into the target for archive verification
    #[arg(long)]
    keyring: Option<PathBuf>,

    /// Include Priority: required packages (default)
    #[arg(long, overrides_with = "no_required")]
    required: bool,

    /// Exclude Priority: required packages
    #[arg(long)]
    no_required: bool,

    /// Include Priority: important packages (default)
    #[arg(long, overrides_with = "no_important")]
    important: bool,

    /// Exclude Priority: important packages
    #[arg(long)]
    no_important: bool,

    /// Follow Recommends when resolving dependencies (default)
    #[arg(long, overrides_with = "no_recommends")]
    recommends: bool,

    /// Ignore Recommends when resolving dependencies
    #[arg(long)]
    no_recommends: bool,

    /// Directory to cache downloaded .deb files in
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// More log output
    #[arg(short, long)]
    verbose: bool,

    /// Full debug output, including chroot command lines
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn into_config(self) -> BootstrapConfig {
        let mut config = BootstrapConfig::new(self.suite, self.target);
        if let Some(mirror) = self.mirror {
            config.url = mirror;
        }
        if let Some(arch) = self.arch {
            config.arch = arch;
        }
        if let Some(components) = self.components {
            config.components = components;
        }
        if let Some(packages) = self.packages {
            config.packages = packages;
        }
        if self.keyring.is_some() {
            config.keyring = self.keyring;
        }
        config.required = self.required || !self.no_required;
        config.important = self.important || !self.no_important;
        config.recommends = self.recommends || !self.no_recommends;
        config.dry_run = self.dry_run;
        config.debug = self.debug;
        config.cache_dir = self.cache_dir;
        config
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let interactive = std::io::stderr().is_terminal();
    let config = cli.into_config();

    let mut bootstrapper = Bootstrapper::new(config)?;
    if interactive {
        bootstrapper = bootstrapper.with_progress(Box::new(CliProgress::bytes()));
    }
    bootstrapper.run()?;
    Ok(())
}
