use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use clap::Subcommand;

use crate::build_order::load_build_order;
use crate::commands::ExitStatus;

#[derive(Subcommand)]
pub(crate) enum BuildOrderCommands {
    /// List the entries of a build-order file in build order.
    List {
        build_order_file: PathBuf,
    },
    /// Summarize a build-order file: counts by source type and pre-built
    /// flag.
    Summary {
        build_order_file: PathBuf,
    },
}

pub(crate) fn run(command: BuildOrderCommands) -> Result<ExitStatus> {
    match command {
        BuildOrderCommands::List { build_order_file } => {
            for entry in load_build_order(&build_order_file)? {
                println!(
                    "{}=={} ({}, from {})",
                    entry.dist, entry.version, entry.source_url_type, entry.source_url
                );
            }
        }
        BuildOrderCommands::Summary { build_order_file } => {
            let entries = load_build_order(&build_order_file)?;
            let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
            let mut prebuilt = 0usize;
            for entry in &entries {
                *by_type.entry(entry.source_url_type.to_string()).or_default() += 1;
                if entry.prebuilt {
                    prebuilt += 1;
                }
            }
            println!("{} wheels in build order", entries.len());
            for (source_type, count) in by_type {
                println!("  {source_type}: {count}");
            }
            println!("  pre-built: {prebuilt}");
        }
    }
    Ok(ExitStatus::Success)
}
