//! # appctl
//! Node-side tool that manages the lifecycle of application containers.
//! Only teardown touches the node: `destroy` releases every resource a
//! container holds and prints the outcome as JSON.
mod commands;
mod observability;
mod rootpath;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{crate_version, Parser};

// High-level commandline option definition
#[derive(Parser, Debug)]
#[clap(version = crate_version!(), author = env!("CARGO_PKG_AUTHORS"))]
struct Opts {
    #[clap(flatten)]
    global: GlobalOpts,

    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Parser, Debug)]
struct GlobalOpts {
    /// set the log file to write appctl logs to (default is '/dev/stderr')
    #[clap(short, long, overrides_with("log"))]
    log: Option<PathBuf>,
    /// change log level to debug, but the `log-level` flag takes precedence
    #[clap(long)]
    debug: bool,
    /// set the log format
    #[clap(long, value_enum, default_value_t)]
    log_format: observability::LogFormat,
    /// set the log level (default is 'error')
    #[clap(long)]
    log_level: Option<tracing::Level>,
    /// also send logs to the systemd journal
    #[clap(long)]
    systemd_log: bool,
    /// root directory holding container records and node config
    #[clap(short, long)]
    root: Option<PathBuf>,
    /// seconds processes get to exit after SIGTERM, overrides the node config
    #[clap(long)]
    grace_period: Option<u64>,
}

#[derive(Parser, Debug)]
enum SubCommand {
    Destroy(commands::destroy::Destroy),
    List(commands::list::List),
    State(commands::state::State),
    Recover(commands::recover::Recover),
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if let Err(e) = observability::init(&opts.global) {
        eprintln!("log init failed: {e:?}");
    }

    tracing::debug!(
        "started by user {} with {:?}",
        nix::unistd::geteuid(),
        std::env::args_os()
    );
    let root_path = rootpath::determine(opts.global.root.to_owned())
        .context("failed to determine the state root")?;
    let manager = commands::lifecycle_manager(&root_path, opts.global.grace_period)?;
    let mut stdout = std::io::stdout();

    let cmd_result = match opts.subcmd {
        SubCommand::Destroy(destroy) => commands::destroy::destroy(destroy, &manager, &mut stdout),
        SubCommand::List(list) => commands::list::list(list, &manager, &mut stdout),
        SubCommand::State(state) => commands::state::state(state, &manager, &mut stdout),
        SubCommand::Recover(recover) => commands::recover::recover(recover, &manager, &mut stdout),
    };

    if let Err(ref e) = cmd_result {
        tracing::error!("error in executing command: {:?}", e);
    }
    cmd_result
}
