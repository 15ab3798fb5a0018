//! Dependency ordering of rendered resources.
//!
//! Kahn's algorithm over reference edges. Among resources that are ready at
//! the same time, the one declared first in the chart goes first, so the
//! output is stable across runs.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::resource::{RenderedResource, ResourceId};

/// Order resources so every referenced resource precedes its referrers.
pub fn order(resources: &[RenderedResource]) -> CoreResult<Vec<RenderedResource>> {
    let indices = order_indices(resources)?;
    Ok(indices.into_iter().map(|i| resources[i].clone()).collect())
}

/// Reverse of [`order`]: referrers are removed before what they reference.
pub fn teardown_order(resources: &[RenderedResource]) -> CoreResult<Vec<RenderedResource>> {
    let mut ordered = order(resources)?;
    ordered.reverse();
    Ok(ordered)
}

fn order_indices(resources: &[RenderedResource]) -> CoreResult<Vec<usize>> {
    let mut index: HashMap<&ResourceId, usize> = HashMap::with_capacity(resources.len());
    for (i, res) in resources.iter().enumerate() {
        if index.insert(&res.id, i).is_some() {
            return Err(CoreError::InvalidResource {
                resource: res.id.to_string(),
                field: "metadata.name".to_string(),
                reason: "is declared more than once".to_string(),
            });
        }
    }

    // deps[i]: resources i waits for; dependents[j]: resources waiting on j.
    let mut deps: Vec<Vec<usize>> = vec![Vec::new(); resources.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); resources.len()];
    for (i, res) in resources.iter().enumerate() {
        for reference in &res.references {
            let &j = index.get(reference).ok_or_else(|| CoreError::DanglingReference {
                resource: res.id.to_string(),
                reference: reference.to_string(),
            })?;
            if i == j {
                return Err(CoreError::DependencyCycle {
                    participants: vec![res.id.to_string()],
                });
            }
            if !deps[i].contains(&j) {
                deps[i].push(j);
                dependents[j].push(i);
            }
        }
    }

    let mut indegree: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut ordered = Vec::with_capacity(resources.len());
    while let Some(Reverse(i)) = ready.pop() {
        ordered.push(i);
        for &child in &dependents[i] {
            indegree[child] -= 1;
            if indegree[child] == 0 {
                ready.push(Reverse(child));
            }
        }
    }

    if ordered.len() != resources.len() {
        let participants = find_cycle(&deps, &indegree)
            .into_iter()
            .map(|i| resources[i].id.to_string())
            .collect();
        return Err(CoreError::DependencyCycle { participants });
    }

    debug!(resources = ordered.len(), "resources ordered");
    Ok(ordered)
}

/// Walk unresolved dependencies from the first stuck resource until a node
/// repeats; the repeated stretch is the cycle.
fn find_cycle(deps: &[Vec<usize>], indegree: &[usize]) -> Vec<usize> {
    let stuck = |i: usize| indegree[i] > 0;
    let Some(start) = (0..deps.len()).find(|&i| stuck(i)) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut current = start;
    loop {
        // A stuck node always has at least one stuck dependency.
        let Some(&next) = deps[current].iter().find(|&&d| stuck(d)) else {
            return path;
        };
        if let Some(pos) = path.iter().position(|&p| p == next) {
            return path.split_off(pos);
        }
        path.push(next);
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn res(kind: &str, name: &str, refs: &[(&str, &str)]) -> RenderedResource {
        RenderedResource {
            id: ResourceId::new(kind, name),
            namespace: None,
            template: format!("templates/{name}.yaml"),
            body: json!({ "apiVersion": "v1", "kind": kind, "metadata": { "name": name } }),
            references: refs.iter().map(|(k, n)| ResourceId::new(*k, *n)).collect(),
        }
    }

    fn names(resources: &[RenderedResource]) -> Vec<String> {
        resources.iter().map(|r| r.id.to_string()).collect()
    }

    #[test]
    fn referenced_resources_come_first_ties_by_declaration() {
        let resources = vec![
            res("Gateway", "gateway", &[("Service", "client"), ("Service", "account")]),
            res("Service", "client", &[]),
            res("Service", "account", &[]),
        ];

        let ordered = order(&resources).unwrap();

        assert_eq!(names(&ordered), vec!["Service/client", "Service/account", "Gateway/gateway"]);
    }

    #[test]
    fn unconstrained_resources_keep_declaration_order() {
        let resources = vec![
            res("ConfigMap", "c", &[]),
            res("ConfigMap", "a", &[]),
            res("ConfigMap", "b", &[]),
        ];
        assert_eq!(names(&order(&resources).unwrap()), names(&resources));
    }

    #[test]
    fn chains_are_ordered_transitively() {
        let resources = vec![
            res("Ingress", "edge", &[("Service", "web")]),
            res("Service", "web", &[("Deployment", "web")]),
            res("Deployment", "web", &[("ConfigMap", "web")]),
            res("ConfigMap", "web", &[]),
        ];
        assert_eq!(
            names(&order(&resources).unwrap()),
            vec!["ConfigMap/web", "Deployment/web", "Service/web", "Ingress/edge"]
        );
    }

    #[test]
    fn two_node_cycle_names_both_participants() {
        let resources = vec![
            res("Deployment", "a", &[("Deployment", "b")]),
            res("Deployment", "b", &[("Deployment", "a")]),
            res("ConfigMap", "unrelated", &[]),
        ];

        let err = order(&resources).unwrap_err();

        match err {
            CoreError::DependencyCycle { participants } => {
                assert_eq!(participants, vec!["Deployment/a", "Deployment/b"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cycle_excludes_downstream_resources() {
        let resources = vec![
            res("Ingress", "edge", &[("Service", "x")]),
            res("Service", "x", &[("Service", "y")]),
            res("Service", "y", &[("Service", "z")]),
            res("Service", "z", &[("Service", "x")]),
        ];
        let err = order(&resources).unwrap_err();
        match err {
            CoreError::DependencyCycle { participants } => {
                assert_eq!(participants, vec!["Service/x", "Service/y", "Service/z"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let err = order(&[res("Service", "x", &[("Service", "x")])]).unwrap_err();
        assert!(err.is_cycle());
    }

    #[test]
    fn teardown_reverses_apply_order() {
        let resources = vec![
            res("Deployment", "web", &[("ConfigMap", "web")]),
            res("ConfigMap", "web", &[]),
        ];
        assert_eq!(
            names(&teardown_order(&resources).unwrap()),
            vec!["Deployment/web", "ConfigMap/web"]
        );
    }

    #[test]
    fn unknown_reference_is_dangling() {
        let err = order(&[res("Deployment", "web", &[("ConfigMap", "missing")])]).unwrap_err();
        assert!(matches!(err, CoreError::DanglingReference { .. }));
    }
}
