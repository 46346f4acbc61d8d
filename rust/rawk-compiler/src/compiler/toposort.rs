//! Depth-first topological sort of the function call graph.

use std::collections::{BTreeMap, BTreeSet};

/// Order the nodes of `graph` so that callees come before their callers.
///
/// Cycles (mutual recursion) are not an error: a node already on the DFS
/// stack is simply skipped and the fixpoint passes in the resolver fill in
/// whatever this ordering can't. Iteration follows key order, so the result
/// is deterministic.
pub fn topo_sort(graph: &BTreeMap<String, BTreeSet<String>>) -> Vec<String> {
    let mut perm: BTreeSet<&str> = BTreeSet::new();
    let mut temp: BTreeSet<&str> = BTreeSet::new();
    let mut sorted = Vec::new();

    fn visit<'g>(
        node: &'g str,
        graph: &'g BTreeMap<String, BTreeSet<String>>,
        perm: &mut BTreeSet<&'g str>,
        temp: &mut BTreeSet<&'g str>,
        sorted: &mut Vec<String>,
    ) {
        if perm.contains(node) || temp.contains(node) {
            return;
        }
        temp.insert(node);
        if let Some(callees) = graph.get(node) {
            for callee in callees {
                visit(callee, graph, perm, temp, sorted);
            }
        }
        temp.remove(node);
        perm.insert(node);
        sorted.push(node.to_string());
    }

    for node in graph.keys() {
        visit(node, graph, &mut perm, &mut temp, &mut sorted);
    }
    sorted
}
