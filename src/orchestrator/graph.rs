//! Container dependency graph and startup ordering.
//!
//! Startup order is a topological sort (Kahn's algorithm) over the
//! `depends_on` edges. Containers whose indegree reaches zero in the same
//! round are appended in sorted-by-name order, so the order is deterministic
//! across runs. Teardown uses the exact reverse of this order.

use std::collections::{BTreeMap, HashMap};

use crate::config::ContainerSpec;
use crate::error::GraphError;

/// Compute the startup order for the declared containers.
///
/// # Errors
///
/// Returns `GraphError::CircularDependency` when the `depends_on` edges form
/// a cycle. Dangling references are a configuration error and are validated
/// before this point.
pub fn start_order(containers: &BTreeMap<String, ContainerSpec>) -> Result<Vec<String>, GraphError> {
    let mut indegree: HashMap<&str, usize> = containers
        .keys()
        .map(|name| (name.as_str(), 0))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for (name, spec) in containers {
        for dependency in &spec.depends_on {
            if let Some(count) = indegree.get_mut(name.as_str()) {
                *count += 1;
            }
            dependents
                .entry(dependency.as_str())
                .or_default()
                .push(name.as_str());
        }
    }

    let mut queue: Vec<&str> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    queue.sort_unstable();

    let mut order = Vec::with_capacity(containers.len());
    while let Some(name) = queue.first().copied() {
        queue.remove(0);
        order.push(String::from(name));

        let mut released = Vec::new();
        for dependent in dependents.get(name).map(Vec::as_slice).unwrap_or_default() {
            if let Some(count) = indegree.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    released.push(*dependent);
                }
            }
        }
        if !released.is_empty() {
            queue.extend(released);
            queue.sort_unstable();
        }
    }

    if order.len() != containers.len() {
        return Err(GraphError::CircularDependency);
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn containers(edges: &[(&str, &[&str])]) -> BTreeMap<String, ContainerSpec> {
        edges
            .iter()
            .map(|(name, deps)| {
                let spec = ContainerSpec {
                    image: Some(String::from("scratch")),
                    depends_on: deps.iter().map(|d| String::from(*d)).collect(),
                    ..ContainerSpec::default()
                };
                (String::from(*name), spec)
            })
            .collect()
    }

    #[rstest]
    fn independent_containers_start_in_name_order() {
        let graph = containers(&[("zookeeper", &[]), ("postgres", &[]), ("redis", &[])]);
        let order = start_order(&graph).expect("acyclic");
        assert_eq!(order, vec!["postgres", "redis", "zookeeper"]);
    }

    #[rstest]
    fn dependencies_start_before_dependents() {
        let graph = containers(&[
            ("kafka", &["zookeeper"]),
            ("zookeeper", &[]),
            ("app", &["kafka", "postgres"]),
            ("postgres", &[]),
        ]);
        let order = start_order(&graph).expect("acyclic");

        let position = |name: &str| {
            order
                .iter()
                .position(|entry| entry == name)
                .expect("present")
        };
        assert!(position("zookeeper") < position("kafka"));
        assert!(position("kafka") < position("app"));
        assert!(position("postgres") < position("app"));
    }

    #[rstest]
    fn ties_break_alphabetically_within_a_round() {
        let graph = containers(&[
            ("b-cache", &["base"]),
            ("a-cache", &["base"]),
            ("base", &[]),
        ]);
        let order = start_order(&graph).expect("acyclic");
        assert_eq!(order, vec!["base", "a-cache", "b-cache"]);
    }

    #[rstest]
    fn two_node_cycle_is_rejected() {
        let graph = containers(&[("a", &["b"]), ("b", &["a"])]);
        let error = start_order(&graph).expect_err("cycle");
        assert!(matches!(error, GraphError::CircularDependency));
    }

    #[rstest]
    fn self_dependency_is_rejected() {
        let graph = containers(&[("a", &["a"])]);
        assert!(start_order(&graph).is_err());
    }

    #[rstest]
    fn longer_cycle_behind_valid_prefix_is_rejected() {
        let graph = containers(&[
            ("standalone", &[]),
            ("x", &["y"]),
            ("y", &["z"]),
            ("z", &["x"]),
        ]);
        assert!(start_order(&graph).is_err());
    }

    #[rstest]
    fn empty_graph_yields_empty_order() {
        let graph = containers(&[]);
        assert_eq!(start_order(&graph).expect("trivially acyclic").len(), 0);
    }
}
