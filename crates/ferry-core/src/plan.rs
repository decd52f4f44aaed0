//! Migration order.
//!
//! Entity types form a graph with edges `dependency → dependent`. The order
//! is a topological sort that keeps the requested order wherever the
//! dependencies allow it, so a config that already lists entity types in a
//! valid order runs exactly as written.

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use crate::error::ConfigError;
use crate::handler::HandlerRegistry;

/// Resolve the order in which `requested` entity types are migrated.
///
/// Only dependencies that are themselves requested become edges: a handler
/// may read an entity type whose mapping was seeded or filled by an earlier
/// run. Unregistered names keep their requested position and fail later,
/// isolated, when the pipeline reaches them. Duplicates are dropped.
///
/// # Errors
///
/// Returns [`ConfigError::Cycle`] with one cycle path if the requested
/// entity types depend on each other circularly.
pub fn migration_order(
    requested: &[String],
    registry: &HandlerRegistry,
) -> Result<Vec<String>, ConfigError> {
    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for name in requested {
        if !index.contains_key(name.as_str()) {
            index.insert(name.as_str(), graph.add_node(name.clone()));
        }
    }

    for name in requested {
        let Some(deps) = registry.dependencies(name) else {
            continue;
        };
        let dependent = index[name.as_str()];
        for dep in deps {
            let Some(&blocker) = index.get(dep.as_str()) else {
                continue;
            };
            if blocker != dependent && !graph.contains_edge(blocker, dependent) {
                graph.add_edge(blocker, dependent, ());
            }
        }
    }

    let order = stable_toposort(&graph);
    if order.len() < graph.node_count() {
        return Err(ConfigError::Cycle(find_cycle(&graph)));
    }

    let names: Vec<String> = order.into_iter().map(|idx| graph[idx].clone()).collect();
    debug!(order = ?names, "migration order resolved");
    Ok(names)
}

/// Kahn's algorithm, always emitting the earliest-requested ready node.
/// Node indices follow the requested order.
fn stable_toposort(graph: &DiGraph<String, ()>) -> Vec<NodeIndex> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|idx| graph.neighbors_directed(idx, Direction::Incoming).count())
        .collect();
    let mut ready: BTreeSet<NodeIndex> = graph
        .node_indices()
        .filter(|idx| in_degree[idx.index()] == 0)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for dependent in graph.neighbors_directed(next, Direction::Outgoing) {
            let degree = &mut in_degree[dependent.index()];
            *degree -= 1;
            if *degree == 0 {
                ready.insert(dependent);
            }
        }
    }
    order
}

/// One concrete cycle, formatted `a -> b -> ... -> a`.
fn find_cycle(graph: &DiGraph<String, ()>) -> Vec<String> {
    let Some(component) = tarjan_scc(graph)
        .into_iter()
        .filter(|component| component.len() > 1)
        .min_by_key(|component| component.iter().min().copied())
    else {
        return Vec::new();
    };
    let members: HashSet<NodeIndex> = component.iter().copied().collect();

    let Some(start) = component.iter().min().copied() else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut cursor = start;
    loop {
        let Some(next) = graph
            .neighbors_directed(cursor, Direction::Outgoing)
            .filter(|n| members.contains(n))
            .min()
        else {
            break;
        };
        if let Some(pos) = path.iter().position(|idx| *idx == next) {
            path.drain(..pos);
            path.push(next);
            break;
        }
        path.push(next);
        cursor = next;
    }

    path.into_iter().map(|idx| graph[idx].clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{EntitySpec, FieldRule, HandlerSettings};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn default_order_is_already_valid() {
        let registry = HandlerRegistry::with_defaults(HandlerSettings::default());
        let requested = names(crate::handler::builtin::DEFAULT_ORDER);
        let order = migration_order(&requested, &registry).expect("acyclic");
        assert_eq!(order, requested);
    }

    #[test]
    fn dependencies_move_ahead_of_dependents() {
        let registry = HandlerRegistry::with_defaults(HandlerSettings::default());
        let order = migration_order(
            &names(&[
                "product.template.attribute.line",
                "res.users",
                "product.attribute.value",
                "product.template",
                "product.attribute",
            ]),
            &registry,
        )
        .expect("acyclic");

        assert_eq!(
            order,
            names(&[
                "res.users",
                "product.template",
                "product.attribute",
                "product.attribute.value",
                "product.template.attribute.line",
            ])
        );
    }

    #[test]
    fn unscheduled_dependencies_are_not_edges() {
        let registry = HandlerRegistry::with_defaults(HandlerSettings::default());
        let order = migration_order(&names(&["product.attribute.value"]), &registry)
            .expect("acyclic");
        assert_eq!(order, names(&["product.attribute.value"]));
    }

    #[test]
    fn unregistered_names_keep_their_place() {
        let registry = HandlerRegistry::with_defaults(HandlerSettings::default());
        let requested = names(&["res.groups", "x.unknown", "res.users", "res.groups"]);
        let order = migration_order(&requested, &registry).expect("acyclic");
        assert_eq!(order, names(&["res.groups", "x.unknown", "res.users"]));
    }

    #[test]
    fn cycle_is_a_config_error_with_path() {
        let mut registry = HandlerRegistry::new(HandlerSettings::default());
        registry.register_spec(
            EntitySpec::new("a", ["name"]).field(FieldRule::reference("b_id", "b")),
        );
        registry.register_spec(
            EntitySpec::new("b", ["name"]).field(FieldRule::reference("c_id", "c")),
        );
        registry.register_spec(
            EntitySpec::new("c", ["name"]).field(FieldRule::reference("a_id", "a")),
        );
        registry.register_spec(EntitySpec::new("d", ["name"]));

        let err = migration_order(&names(&["d", "a", "b", "c"]), &registry).expect_err("cycle");
        let ConfigError::Cycle(path) = &err else {
            panic!("expected cycle, got {err:?}");
        };
        assert_eq!(path.first(), path.last());
        assert_eq!(path.len(), 4);
        assert_eq!(err.code(), crate::error::ErrorCode::DependencyCycle);
    }
}
