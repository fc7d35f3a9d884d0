//! Dependency graph over a flow's nodes.

use std::collections::{HashMap, VecDeque};

/// Directed graph of node names. Parallel edges between the same pair of
/// nodes collapse into one dependency.
#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    downstream: Vec<Vec<usize>>,
    upstream: Vec<Vec<usize>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl FlowGraph {
    /// Build a graph. Edges naming unknown nodes are ignored.
    pub fn new<'a>(
        names: impl IntoIterator<Item = &'a str>,
        edges: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let mut graph = FlowGraph::default();
        for name in names {
            if graph.index.contains_key(name) {
                continue;
            }
            graph.index.insert(name.to_string(), graph.names.len());
            graph.names.push(name.to_string());
            graph.downstream.push(Vec::new());
            graph.upstream.push(Vec::new());
        }

        for (from, to) in edges {
            let (Some(&f), Some(&t)) = (graph.index.get(from), graph.index.get(to)) else {
                continue;
            };
            if !graph.downstream[f].contains(&t) {
                graph.downstream[f].push(t);
                graph.upstream[t].push(f);
            }
        }
        graph
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Distinct direct dependents of a node.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.neighbours(name, &self.downstream)
    }

    /// Distinct direct upstreams of a node.
    pub fn upstreams(&self, name: &str) -> Vec<&str> {
        self.neighbours(name, &self.upstream)
    }

    fn neighbours<'a>(&'a self, name: &str, adjacency: &'a [Vec<usize>]) -> Vec<&'a str> {
        self.index
            .get(name)
            .map(|&i| adjacency[i].iter().map(|&j| self.names[j].as_str()).collect())
            .unwrap_or_default()
    }

    /// Number of distinct upstream nodes of every node.
    pub fn in_degrees(&self) -> HashMap<String, usize> {
        self.names
            .iter()
            .zip(&self.upstream)
            .map(|(name, ups)| (name.clone(), ups.len()))
            .collect()
    }

    /// Nodes with no upstream, in declaration order.
    pub fn roots(&self) -> Vec<&str> {
        self.names
            .iter()
            .zip(&self.upstream)
            .filter(|(_, ups)| ups.is_empty())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Find a dependency cycle with a three-colour depth-first search.
    ///
    /// Returns the nodes on the first cycle found, in edge order, starting and
    /// ending with the same node (`[a, b, a]`).
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut color = vec![Color::White; self.names.len()];

        for start in 0..self.names.len() {
            if color[start] == Color::White {
                if let Some(cycle) = self.visit(start, &mut color) {
                    return Some(cycle.into_iter().map(|i| self.names[i].clone()).collect());
                }
            }
        }
        None
    }

    /// Depth-first walk from `start` on an explicit stack of
    /// `(node, next edge to follow)`; the stack doubles as the current path.
    fn visit(&self, start: usize, color: &mut [Color]) -> Option<Vec<usize>> {
        let mut stack = vec![(start, 0usize)];
        color[start] = Color::Gray;

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            let Some(&next) = self.downstream[node].get(top.1) else {
                color[node] = Color::Black;
                stack.pop();
                continue;
            };
            top.1 += 1;

            match color[next] {
                Color::Gray => {
                    let from = stack.iter().position(|&(n, _)| n == next).unwrap_or(0);
                    let mut cycle: Vec<usize> = stack[from..].iter().map(|&(n, _)| n).collect();
                    cycle.push(next);
                    return Some(cycle);
                }
                Color::White => {
                    color[next] = Color::Gray;
                    stack.push((next, 0));
                }
                Color::Black => {}
            }
        }
        None
    }

    /// Kahn topological order, ties broken by declaration order. `None` if the
    /// graph has a cycle.
    pub fn topological_order(&self) -> Option<Vec<&str>> {
        let mut in_degree: Vec<usize> = self.upstream.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = (0..self.names.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.names.len());

        while let Some(node) = queue.pop_front() {
            order.push(self.names[node].as_str());
            for &next in &self.downstream[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        (order.len() == self.names.len()).then_some(order)
    }
}
