//! Wave dependency graph and cycle detection

use crate::model::RecoveryPlan;

/// Wave dependency graph over wave indices
///
/// Node `i` is the wave at index `i`; `edges[i]` lists the waves it depends on.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: Vec<Vec<usize>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

impl DependencyGraph {
    /// Graph with `node_count` waves and no edges
    pub fn with_nodes(node_count: usize) -> Self {
        Self {
            edges: vec![Vec::new(); node_count],
        }
    }

    /// Build from a plan's explicit `depends_on` links
    ///
    /// Links to waves that do not exist are returned as `(wave, missing)` pairs
    /// and left out of the graph.
    pub fn from_plan(plan: &RecoveryPlan) -> (Self, Vec<(usize, usize)>) {
        let mut graph = Self::with_nodes(plan.waves.len());
        let mut dangling = Vec::new();
        for wave in &plan.waves {
            for &predecessor in &wave.depends_on {
                if predecessor < plan.waves.len() && wave.wave_index < plan.waves.len() {
                    graph.add_dependency(wave.wave_index, predecessor);
                } else {
                    dangling.push((wave.wave_index, predecessor));
                }
            }
        }
        (graph, dangling)
    }

    /// Number of waves
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Whether the graph has no waves
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Record that `dependent` must run after `dependency`
    pub fn add_dependency(&mut self, dependent: usize, dependency: usize) {
        let needed = dependent.max(dependency) + 1;
        if self.edges.len() < needed {
            self.edges.resize(needed, Vec::new());
        }
        if !self.edges[dependent].contains(&dependency) {
            self.edges[dependent].push(dependency);
        }
    }

    /// Waves `wave` depends on
    pub fn dependencies_of(&self, wave: usize) -> &[usize] {
        self.edges.get(wave).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Check for circular dependencies using DFS
    pub fn has_cycles(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// First cycle found, as the wave indices along it (first index repeated at the end)
    pub fn find_cycle(&self) -> Option<Vec<usize>> {
        let mut marks = vec![Mark::Unvisited; self.edges.len()];
        let mut stack = Vec::new();

        for start in 0..self.edges.len() {
            if marks[start] == Mark::Unvisited {
                if let Some(cycle) = self.find_cycle_util(start, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn find_cycle_util(
        &self,
        node: usize,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[node] = Mark::OnStack;
        stack.push(node);

        for &next in &self.edges[node] {
            match marks[next] {
                Mark::Unvisited => {
                    if let Some(cycle) = self.find_cycle_util(next, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::OnStack => {
                    let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::Done => {}
            }
        }

        stack.pop();
        marks[node] = Mark::Done;
        None
    }

    /// Dependencies that point at a later wave, as `(wave, later_dependency)` pairs
    ///
    /// Waves run strictly in index order, so such a link can never be satisfied.
    pub fn forward_dependencies(&self) -> Vec<(usize, usize)> {
        self.edges
            .iter()
            .enumerate()
            .flat_map(|(wave, deps)| {
                deps.iter()
                    .filter(move |&&dep| dep >= wave)
                    .map(move |&dep| (wave, dep))
            })
            .collect()
    }

    /// Topological order, dependencies first; `None` if cyclic
    pub fn topological_order(&self) -> Option<Vec<usize>> {
        let n = self.edges.len();
        let mut remaining: Vec<usize> = self.edges.iter().map(Vec::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (wave, deps) in self.edges.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(wave);
            }
        }

        let mut ready: std::collections::VecDeque<usize> =
            (0..n).filter(|&w| remaining[w] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(wave) = ready.pop_front() {
            order.push(wave);
            for &dependent in &dependents[wave] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.push_back(dependent);
                }
            }
        }

        (order.len() == n).then_some(order)
    }
}
