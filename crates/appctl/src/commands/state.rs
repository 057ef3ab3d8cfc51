use std::io::Write;

use anyhow::{bail, Result};
use clap::Parser;
use libappcontainer::container::LifecycleManager;

/// Show the record of a container
#[derive(Parser, Debug)]
pub struct State {
    #[clap(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_uuid: String,
}

pub fn state<W: Write>(args: State, manager: &LifecycleManager, out: &mut W) -> Result<()> {
    let Some(record) = manager.load(&args.container_uuid)? else {
        bail!("container {} does not exist.", args.container_uuid)
    };
    writeln!(out, "{}", serde_json::to_string_pretty(&record)?)?;
    Ok(())
}
