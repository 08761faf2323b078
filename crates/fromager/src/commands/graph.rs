use std::path::PathBuf;

use anyhow::Result;
use clap::Subcommand;

use fromager_graph::DependencyGraph;

use crate::commands::ExitStatus;
use crate::constraints_writer::write_constraints_file;

#[derive(Subcommand)]
pub(crate) enum GraphCommands {
    /// Convert a graph file into a pip-compatible constraints file.
    ToConstraints {
        /// The graph file produced by a bootstrap run.
        graph_file: PathBuf,
        /// Where to write the constraints; stdout when omitted.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Show every package the graph holds at more than one version, and
    /// which requirements asked for each.
    ExplainDuplicates {
        graph_file: PathBuf,
    },
}

pub(crate) fn run(command: GraphCommands) -> Result<ExitStatus> {
    match command {
        GraphCommands::ToConstraints { graph_file, output } => {
            let graph = DependencyGraph::from_file(&graph_file)?;
            let ok = match output {
                Some(path) => {
                    let mut file = fs_err::File::create(&path)?;
                    write_constraints_file(&graph, &mut file)?
                }
                None => {
                    let mut stdout = std::io::stdout();
                    write_constraints_file(&graph, &mut stdout)?
                }
            };
            Ok(if ok {
                ExitStatus::Success
            } else {
                ExitStatus::Error
            })
        }
        GraphCommands::ExplainDuplicates { graph_file } => {
            let graph = DependencyGraph::from_file(&graph_file)?;
            explain_duplicates(&graph);
            Ok(ExitStatus::Success)
        }
    }
}

fn explain_duplicates(graph: &DependencyGraph) {
    for (name, nodes) in graph.get_install_dependency_versions() {
        if nodes.len() < 2 {
            continue;
        }
        println!("{name}");
        for node in nodes {
            println!("  {}", node.key);
            for edge in node.get_incoming_install_edges() {
                let parent = edge.key.as_str();
                let parent = if parent.is_empty() { "(toplevel)" } else { parent };
                println!("    {} matches {}", parent, edge.req);
            }
        }
    }
}
