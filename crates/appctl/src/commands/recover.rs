use std::io::Write;

use anyhow::{Context, Result};
use clap::Parser;
use libappcontainer::container::LifecycleManager;

/// Finish destroys that were interrupted or only partially succeeded
#[derive(Parser, Debug)]
pub struct Recover {}

pub fn recover<W: Write>(_: Recover, manager: &LifecycleManager, out: &mut W) -> Result<()> {
    let results = manager
        .recover()
        .context("failed to resume interrupted destroys")?;
    writeln!(out, "{}", serde_json::to_string_pretty(&results)?)?;
    Ok(())
}
