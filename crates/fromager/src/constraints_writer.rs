use std::collections::BTreeMap;
use std::io::Write;

use tracing::{debug, error};

use fromager_graph::DependencyGraph;
use fromager_pep440::Version;

use crate::error::BootstrapError;

/// Write a pip-compatible constraints file pinning one version per
/// installed package.
///
/// Most names have a single version and are emitted directly. For names the
/// graph holds at several versions, the writer iterates: a version is
/// acceptable when every still-relevant parent's requirement admits it,
/// where "still relevant" means the parent's own chosen version matches the
/// edge. Resolving one name can unlock another, so passes repeat until a
/// full pass resolves nothing new.
///
/// Returns false when conflicts remain; those names are emitted with an
/// `# ERROR` comment listing every version.
pub(crate) fn write_constraints_file(
    graph: &DependencyGraph,
    output: &mut dyn Write,
) -> Result<bool, BootstrapError> {
    let conflicts = graph.get_install_dependency_versions();
    let mut ret = true;

    // Already-chosen version per name.
    let mut resolved: BTreeMap<String, Version> = BTreeMap::new();

    // Names with more than one version, processed iteratively.
    let mut unresolved: Vec<&str> = Vec::new();
    let mut multiple_versions: BTreeMap<&str, Vec<Version>> = BTreeMap::new();

    let mut names: Vec<&String> = conflicts.keys().collect();
    names.sort();

    for name in &names {
        let nodes = &conflicts[name.as_str()];
        let versions: Vec<Version> = nodes.iter().map(|node| node.version.clone()).collect();
        match versions.len() {
            0 => {
                return Err(BootstrapError::Other(format!(
                    "no versions of {name} supported"
                )))
            }
            1 => {
                // The usual case: only one version was ever used.
                resolved.insert(name.to_string(), versions[0].clone());
            }
            _ => {
                unresolved.push(name.as_str());
                multiple_versions.insert(name.as_str(), versions);
            }
        }
    }

    // Below this point the graph holds multiple versions of the same thing,
    // so we try to find one of those versions that satisfies every user.
    let mut resolved_something = true;
    while !unresolved.is_empty() && resolved_something {
        resolved_something = false;
        for name in unresolved.clone() {
            let nodes = &conflicts[name];
            // Which versions can be used by which parent, and how many
            // distinct parent-uses exist in total.
            let mut usable_versions: BTreeMap<Version, usize> = BTreeMap::new();
            let mut user_counter = 0usize;
            let dep_versions: Vec<Version> =
                nodes.iter().map(|node| node.version.clone()).collect();

            for node in nodes {
                for parent_edge in node.get_incoming_install_edges() {
                    let Some(parent_node) = graph.get_node(&parent_edge.key) else {
                        continue;
                    };
                    // Skip parents whose chosen version is not the version
                    // this edge hangs off; their requirement no longer
                    // applies.
                    if let Some(chosen) = resolved.get(&parent_node.canonicalized_name) {
                        if !parent_node.is_root() && *chosen != parent_node.version {
                            continue;
                        }
                    }
                    for matching in dep_versions.iter().filter(|candidate| {
                        parent_edge
                            .req
                            .specifiers
                            .contains_with_prereleases(candidate, true)
                    }) {
                        *usable_versions.entry(matching.clone()).or_default() += 1;
                    }
                    user_counter += 1;
                }
            }

            // The highest version acceptable to every parent-use wins.
            for (candidate, users) in usable_versions.iter().rev() {
                if *users != user_counter {
                    debug!(
                        "{name}: version {candidate} is usable by {users} of {user_counter} consumers, skipping it"
                    );
                    continue;
                }
                debug!("{name}: selecting {candidate} from multiple candidates");
                resolved.insert(name.to_string(), candidate.clone());
                resolved_something = true;
                unresolved.retain(|pending| *pending != name);
                break;
            }
        }
    }

    // Resolved names first, in alphabetical order.
    for (name, version) in &resolved {
        if let Some(versions) = multiple_versions.get(name.as_str()) {
            let mut ordered: Vec<&Version> = versions.iter().collect();
            ordered.sort();
            let listed: Vec<String> = ordered.iter().map(ToString::to_string).collect();
            writeln!(
                output,
                "# NOTE: fromager selected {name}=={version} from: {listed:?}"
            )?;
        }
        writeln!(output, "{name}=={version}")?;
    }

    // No single version worked; print everything with a warning so a human
    // can decide.
    for name in &unresolved {
        ret = false;
        error!("{name}: no single version meets all requirements");
        writeln!(
            output,
            "# ERROR: no single version of {name} met all requirements"
        )?;
        let mut versions = multiple_versions[name].clone();
        versions.sort();
        for version in versions {
            writeln!(output, "{name}=={version}")?;
        }
    }

    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fromager_graph::RequirementKind;
    use fromager_normalize::PackageName;
    use fromager_pep508::Requirement;
    use std::str::FromStr;

    fn name(s: &str) -> PackageName {
        PackageName::new(s).unwrap()
    }

    fn version(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn req(s: &str) -> Requirement {
        Requirement::from_str(s).unwrap()
    }

    fn write(graph: &DependencyGraph) -> (bool, String) {
        let mut buffer = Vec::new();
        let ok = write_constraints_file(graph, &mut buffer).unwrap();
        (ok, String::from_utf8(buffer).unwrap())
    }

    #[test]
    fn single_versions_emit_directly() {
        let mut graph = DependencyGraph::new();
        graph
            .add_dependency(None, None, RequirementKind::TopLevel, &req("a"), &version("1.0"), "", false)
            .unwrap();
        graph
            .add_dependency(
                Some(&name("a")),
                Some(&version("1.0")),
                RequirementKind::Install,
                &req("b>=2"),
                &version("2.3"),
                "",
                false,
            )
            .unwrap();
        let (ok, content) = write(&graph);
        assert!(ok);
        assert_eq!(content, "a==1.0\nb==2.3\n");
    }

    #[test]
    fn multi_version_conflict_resolves_to_shared_version() {
        // Two top-levels both depend on pbr: a wants >=5,<7 (settled to 6),
        // b wants >=5 (settled to 7). Version 6 satisfies both.
        let mut graph = DependencyGraph::new();
        graph
            .add_dependency(None, None, RequirementKind::TopLevel, &req("a"), &version("1"), "", false)
            .unwrap();
        graph
            .add_dependency(None, None, RequirementKind::TopLevel, &req("b"), &version("1"), "", false)
            .unwrap();
        graph
            .add_dependency(
                Some(&name("a")),
                Some(&version("1")),
                RequirementKind::Install,
                &req("pbr>=5,<7"),
                &version("6"),
                "",
                false,
            )
            .unwrap();
        graph
            .add_dependency(
                Some(&name("b")),
                Some(&version("1")),
                RequirementKind::Install,
                &req("pbr>=5"),
                &version("7"),
                "",
                false,
            )
            .unwrap();

        let (ok, content) = write(&graph);
        assert!(ok);
        assert!(content.contains("pbr==6\n"), "{content}");
        assert!(
            content.contains("# NOTE: fromager selected pbr==6 from: [\"6\", \"7\"]"),
            "{content}"
        );
    }

    #[test]
    fn unresolvable_conflict_reports_error() {
        let mut graph = DependencyGraph::new();
        graph
            .add_dependency(None, None, RequirementKind::TopLevel, &req("a"), &version("1"), "", false)
            .unwrap();
        graph
            .add_dependency(None, None, RequirementKind::TopLevel, &req("b"), &version("1"), "", false)
            .unwrap();
        graph
            .add_dependency(
                Some(&name("a")),
                Some(&version("1")),
                RequirementKind::Install,
                &req("pbr==6"),
                &version("6"),
                "",
                false,
            )
            .unwrap();
        graph
            .add_dependency(
                Some(&name("b")),
                Some(&version("1")),
                RequirementKind::Install,
                &req("pbr==7"),
                &version("7"),
                "",
                false,
            )
            .unwrap();

        let (ok, content) = write(&graph);
        assert!(!ok);
        assert!(content.contains("# ERROR: no single version of pbr met all requirements"));
        assert!(content.contains("pbr==6\n"));
        assert!(content.contains("pbr==7\n"));
    }

    #[test]
    fn resolving_one_name_unlocks_another() {
        // d is used by c==1 and c==2; c itself is disputed and resolves to
        // 1, which drops c==2's veto on d.
        let mut graph = DependencyGraph::new();
        graph
            .add_dependency(None, None, RequirementKind::TopLevel, &req("a"), &version("1"), "", false)
            .unwrap();
        graph
            .add_dependency(None, None, RequirementKind::TopLevel, &req("b"), &version("1"), "", false)
            .unwrap();
        graph
            .add_dependency(
                Some(&name("a")),
                Some(&version("1")),
                RequirementKind::Install,
                &req("c<2"),
                &version("1"),
                "",
                false,
            )
            .unwrap();
        graph
            .add_dependency(
                Some(&name("b")),
                Some(&version("1")),
                RequirementKind::Install,
                &req("c>=1"),
                &version("2"),
                "",
                false,
            )
            .unwrap();
        // c==1 wants d==1; c==2 wants d==2.
        graph
            .add_dependency(
                Some(&name("c")),
                Some(&version("1")),
                RequirementKind::Install,
                &req("d==1"),
                &version("1"),
                "",
                false,
            )
            .unwrap();
        graph
            .add_dependency(
                Some(&name("c")),
                Some(&version("2")),
                RequirementKind::Install,
                &req("d==2"),
                &version("2"),
                "",
                false,
            )
            .unwrap();

        let (ok, content) = write(&graph);
        assert!(ok, "{content}");
        assert!(content.contains("c==1\n"), "{content}");
        assert!(content.contains("d==1\n"), "{content}");
    }
}
