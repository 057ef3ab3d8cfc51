//! Contains Functionality of list container command
use std::fmt::Write as _;
use std::io::Write;

use anyhow::{bail, Result};
use chrono::{DateTime, Local};
use clap::Parser;
use libappcontainer::container::LifecycleManager;
use tabwriter::TabWriter;

/// List the containers known to this node
#[derive(Parser, Debug)]
pub struct List {
    /// Specify the format (table or json)
    #[clap(long, default_value = "table")]
    pub format: String,

    /// Only display container uuids
    #[clap(long, short)]
    pub quiet: bool,
}

pub fn list<W: Write>(args: List, manager: &LifecycleManager, out: &mut W) -> Result<()> {
    let records = manager.list()?;

    if args.quiet {
        for record in &records {
            writeln!(out, "{}", record.uuid())?;
        }
        return Ok(());
    }

    match args.format.as_str() {
        "json" => {
            writeln!(out, "{}", serde_json::to_string_pretty(&records)?)?;
            return Ok(());
        }
        "table" => {}
        unknown => bail!("unknown format: {unknown}"),
    }

    let mut content = String::new();
    for record in &records {
        let ports = record
            .ports
            .iter()
            .map(|port| port.reservation_name())
            .collect::<Vec<_>>()
            .join(",");
        let created = if let Some(utc) = record.created {
            let local: DateTime<Local> = DateTime::from(utc);
            local.to_rfc3339_opts(chrono::SecondsFormat::Secs, false)
        } else {
            "".to_owned()
        };

        let _ = writeln!(
            content,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            record.uuid(),
            record.container_name,
            record.namespace,
            record.application_name,
            record.state(),
            ports,
            created,
        );
    }

    let mut tab_writer = TabWriter::new(out);
    writeln!(
        &mut tab_writer,
        "UUID\tNAME\tNAMESPACE\tAPPLICATION\tSTATE\tPORTS\tCREATED"
    )?;
    write!(&mut tab_writer, "{content}")?;
    tab_writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;
    use crate::commands::fixtures;

    fn run(args: &[&str], manager: &LifecycleManager) -> Result<String> {
        let mut out = Vec::new();
        list(
            List::parse_from(std::iter::once("list").chain(args.iter().copied())),
            manager,
            &mut out,
        )?;
        Ok(String::from_utf8(out)?)
    }

    #[test]
    fn test_table() -> Result<()> {
        let node = fixtures::node()?;
        let output = run(&[], &node.manager)?;
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("UUID"));
        assert!(lines[1].starts_with("c-1 "));
        assert!(lines[1].contains("Running"));
        assert!(lines[1].contains("35531-tcp"));
        assert!(lines[2].starts_with("c-2 "));
        Ok(())
    }

    #[test]
    fn test_quiet_and_json() -> Result<()> {
        let node = fixtures::node()?;
        assert_eq!(run(&["-q"], &node.manager)?, "c-1\nc-2\n");

        let output = run(&["--format", "json"], &node.manager)?;
        let value: serde_json::Value = serde_json::from_str(&output)?;
        assert_eq!(value[1]["containerUuid"], "c-2");

        assert!(run(&["--format", "yaml"], &node.manager).is_err());
        Ok(())
    }
}
