#![forbid(unsafe_code)]

//! `boxd` — the Box broker daemon.

use clap::Parser;
use std::path::PathBuf;

use box_daemon::{Runtime, RuntimeOptions};

/// Exit code for a refused privileged launch.
const EXIT_REFUSED: i32 = 77;

#[derive(Debug, Parser)]
#[command(name = "boxd", about = "Box queue broker daemon", version)]
struct Cli {
    /// Home directory holding the .box tree (defaults to $HOME).
    #[arg(long)]
    home: Option<PathBuf>,

    /// Configuration file (defaults to <home>/.box/Box.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// UDP listen port override.
    #[arg(long)]
    port: Option<u16>,

    /// Log level override (error, warn, info, debug, trace).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if running_as_root() {
        eprintln!("boxd: refusing to run as root");
        std::process::exit(EXIT_REFUSED);
    }

    let runtime = Runtime::start(RuntimeOptions {
        home: cli.home,
        config: cli.config,
        port: cli.port,
        log_level: cli.log_level,
    })
    .await?;
    runtime.run_until_signal().await
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}
