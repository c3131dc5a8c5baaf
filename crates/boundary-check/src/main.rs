use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{Context, Result};
use cargo_metadata::{DependencyKind, Metadata, MetadataCommand, PackageId};

/// Crates that must stay free of I/O so the engine can be exercised
/// without a database, runtime or network.
const PURE_PACKAGE_NAMES: &[&str] = &["podtrack-policy", "podtrack-contracts"];
const FORBIDDEN_DEPENDENCIES: &[&str] = &[
    "axum",
    "podtrack-gateway",
    "podtrack-ledger",
    "reqwest",
    "sqlx",
    "tokio",
];

fn main() -> Result<()> {
    let metadata = MetadataCommand::new()
        .exec()
        .context("failed to run `cargo metadata`")?;

    let mut failed = false;
    for package_name in PURE_PACKAGE_NAMES {
        let violations = forbidden_reachable(&metadata, package_name)?;
        if violations.is_empty() {
            println!(
                "OK: `{}` has no dependency edge to {}",
                package_name,
                FORBIDDEN_DEPENDENCIES.join(", ")
            );
        } else {
            eprintln!(
                "FAIL: `{}` depends on forbidden crate(s): {}",
                package_name,
                violations.join(", ")
            );
            failed = true;
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Walks normal and build dependencies of `package_name`. Dev-dependencies
/// are ignored since they never reach a consumer of the crate.
fn forbidden_reachable(metadata: &Metadata, package_name: &str) -> Result<Vec<String>> {
    let resolve = metadata
        .resolve
        .as_ref()
        .context("`cargo metadata` did not include a resolved dependency graph")?;

    let root = metadata
        .packages
        .iter()
        .find(|p| p.name == package_name)
        .with_context(|| format!("package `{}` not found in workspace", package_name))?;

    let id_to_name: HashMap<&PackageId, &str> = metadata
        .packages
        .iter()
        .map(|p| (&p.id, p.name.as_str()))
        .collect();

    let adjacency: HashMap<&PackageId, Vec<&PackageId>> = resolve
        .nodes
        .iter()
        .map(|node| {
            let deps = node
                .deps
                .iter()
                .filter(|dep| {
                    dep.dep_kinds
                        .iter()
                        .any(|info| info.kind != DependencyKind::Development)
                })
                .map(|dep| &dep.pkg)
                .collect();
            (&node.id, deps)
        })
        .collect();

    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(&root.id);
    visited.insert(&root.id);

    let mut violations = Vec::new();

    while let Some(current) = queue.pop_front() {
        let Some(deps) = adjacency.get(current) else {
            continue;
        };

        for dep in deps.iter().copied() {
            if !visited.insert(dep) {
                continue;
            }

            if let Some(name) = id_to_name.get(dep)
                && FORBIDDEN_DEPENDENCIES.contains(name)
            {
                violations.push((*name).to_string());
            }

            queue.push_back(dep);
        }
    }

    violations.sort();
    violations.dedup();
    Ok(violations)
}
