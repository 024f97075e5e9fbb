//! Dependency Graph (C4): builds the adjacency representation of a ride's
//! flow, validates it, and produces the level-grouped execution order used
//! by the scheduler (spec.md §4.4).

use crate::segment::FlowNode;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    fn with_errors(errors: Vec<String>) -> Self {
        Self { valid: errors.is_empty(), errors }
    }
}

/// Derived statistics over a graph's level grouping (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GraphStats {
    /// Number of levels; also the critical-path length through the graph.
    pub level_count: usize,
    pub max_fan_out: usize,
    pub min_fan_out: usize,
    pub avg_fan_out: f64,
    /// `avg_parallelism / total`: how much of the graph's work can run
    /// concurrently at any given level, on average.
    pub parallelization_efficiency: f64,
}

/// A directed graph over segment names derived from a ride's `dependsOn`
/// declarations and flow structure. Node order is the declaration order of
/// the flat segment list (spec.md §4.4 "original list order").
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    order: Vec<String>,
    edges: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// `segments` is the flat declared list (name -> declared dependsOn).
    /// `flow` is used only to validate that every segment referenced by the
    /// flow exists among `segments` and vice versa isn't required (a
    /// segment may be declared but never referenced by flow — that's an
    /// unreachable segment, flagged separately, not a construction error).
    pub fn new(segments: &[(String, Vec<String>)]) -> Self {
        let order = segments.iter().map(|(name, _)| name.clone()).collect();
        let edges = segments
            .iter()
            .map(|(name, deps)| (name.clone(), deps.clone()))
            .collect();
        Self { order, edges }
    }

    pub fn node_count(&self) -> usize {
        self.order.len()
    }

    /// Validates structural flow errors, missing dependencies, flow
    /// completeness, cycles, and unreachable nodes. A segment that is both
    /// missing-as-a-dependency-target and unreachable as a result is
    /// deliberately reported twice — once per check — rather than
    /// deduplicated, matching the two independent passes (spec.md §4.4 Edge
    /// cases: "a segment can appear in more than one error").
    pub fn validate(&self, flow: &FlowNode) -> ValidationReport {
        // An empty `Sequential`/`Parallel` block is a graph-validation error
        // (spec.md §7), not a config-time one, so it's folded in here rather
        // than rejected by `Ride::validate` before the scheduler can return a
        // well-formed, all-SKIPPED result.
        let mut errors = flow.structural_errors();

        let known: HashSet<&str> = self.order.iter().map(|s| s.as_str()).collect();
        for (name, deps) in &self.edges {
            for dep in deps {
                if !known.contains(dep.as_str()) {
                    errors.push(format!(
                        "segment {name:?} depends on unknown segment {dep:?}"
                    ));
                }
            }
        }

        let referenced = flow.segment_names();
        for name in &referenced {
            if !known.contains(name.as_str()) {
                errors.push(format!("flow references undeclared segment {name:?}"));
            }
        }

        let cycle = self.find_cycle();
        if let Some(cycle_path) = &cycle {
            errors.push(format!("cyclic dependency: {}", cycle_path.join(" -> ")));
        }

        // Unreachable: segments that a forward BFS from segments with no
        // unsatisfied dependencies never resolves (spec.md §4.4 check 3).
        // Nodes that are merely downstream of a cycle are excluded here —
        // the cycle error above already accounts for them (spec.md §9 Open
        // Questions: "report only unreachable segments with actually-missing
        // dependencies").
        let topo = self.topo_order();
        let reached: HashSet<&str> = topo.iter().map(String::as_str).collect();
        let cycle_members: HashSet<&str> = cycle
            .as_ref()
            .map(|c| c.iter().map(String::as_str).collect())
            .unwrap_or_default();
        for name in &self.order {
            let name = name.as_str();
            if !reached.contains(name) && !cycle_members.contains(name) {
                errors.push(format!(
                    "segment {name:?} is unreachable: one of its dependencies is missing"
                ));
            }
        }

        ValidationReport::with_errors(errors)
    }

    /// Depth-first search reporting the first cycle found as a list of
    /// segment names, the last entry repeating the first to close the loop.
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut stack: Vec<String> = Vec::new();

        fn visit<'a>(
            node: &'a str,
            edges: &'a HashMap<String, Vec<String>>,
            marks: &mut HashMap<&'a str, Mark>,
            stack: &mut Vec<String>,
        ) -> Option<Vec<String>> {
            match marks.get(node) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|n| n == node).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[start..].to_vec();
                    cycle.push(node.to_string());
                    return Some(cycle);
                }
                None => {}
            }

            marks.insert(node, Mark::Visiting);
            stack.push(node.to_string());

            if let Some(deps) = edges.get(node) {
                for dep in deps {
                    if let Some(cycle) = visit(dep, edges, marks, stack) {
                        return Some(cycle);
                    }
                }
            }

            stack.pop();
            marks.insert(node, Mark::Done);
            None
        }

        for name in &self.order {
            if let Some(cycle) = visit(name, &self.edges, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }

    /// Kahn's-algorithm topological sort grouped into levels: every segment
    /// in a level has all of its dependencies satisfied by segments in
    /// earlier levels, and a level's members are listed in original
    /// declaration order (spec.md §4.4 "parallelizable levels").
    ///
    /// Assumes the graph has already been validated (no missing deps, no
    /// cycles) — callers must check `validate` first; malformed graphs
    /// simply yield a shorter-than-expected level list here.
    pub fn levels(&self) -> Vec<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = self
            .order
            .iter()
            .map(|n| (n.as_str(), 0usize))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for name in &self.order {
            let deps = self.edges.get(name).map(|d| d.as_slice()).unwrap_or(&[]);
            *in_degree.get_mut(name.as_str()).unwrap() = deps.len();
            for dep in deps {
                dependents.entry(dep.as_str()).or_default().push(name.as_str());
            }
        }

        let mut remaining: HashSet<&str> = self.order.iter().map(|s| s.as_str()).collect();
        let mut levels = Vec::new();

        while !remaining.is_empty() {
            let mut ready: Vec<&str> = self
                .order
                .iter()
                .map(|s| s.as_str())
                .filter(|n| remaining.contains(n) && in_degree.get(n).copied().unwrap_or(0) == 0)
                .collect();

            if ready.is_empty() {
                // Residual cycle or dangling reference; stop rather than loop forever.
                break;
            }

            for n in &ready {
                remaining.remove(n);
            }
            for n in &ready {
                if let Some(deps) = dependents.get(n) {
                    for d in deps {
                        if let Some(count) = in_degree.get_mut(d) {
                            *count = count.saturating_sub(1);
                        }
                    }
                }
            }

            ready.dedup();
            levels.push(ready.into_iter().map(|s| s.to_string()).collect());
        }

        levels
    }

    /// Total segment count reachable from a topological sort (used by the
    /// scheduler to sanity-check it processed every node).
    pub fn topo_order(&self) -> Vec<String> {
        self.levels().into_iter().flatten().collect()
    }

    /// Derived statistics over the level grouping (spec.md §4.4 "Derived
    /// statistics"): critical-path length, fan-out per level, and how much
    /// of the theoretically available parallelism the graph's shape permits.
    pub fn stats(&self) -> GraphStats {
        let levels = self.levels();
        let fan_outs: Vec<usize> = levels.iter().map(Vec::len).collect();
        let total = self.node_count();

        if fan_outs.is_empty() || total == 0 {
            return GraphStats {
                level_count: 0,
                max_fan_out: 0,
                min_fan_out: 0,
                avg_fan_out: 0.0,
                parallelization_efficiency: 0.0,
            };
        }

        let max_fan_out = *fan_outs.iter().max().unwrap();
        let min_fan_out = *fan_outs.iter().min().unwrap();
        let avg_fan_out = total as f64 / fan_outs.len() as f64;

        GraphStats {
            level_count: fan_outs.len(),
            max_fan_out,
            min_fan_out,
            avg_fan_out,
            parallelization_efficiency: avg_fan_out / total as f64,
        }
    }

    pub fn direct_dependencies(&self, name: &str) -> &[String] {
        self.edges.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// All transitive dependencies of `name`, used to compute cascading
    /// skip propagation distance in the scheduler.
    pub fn transitive_dependencies(&self, name: &str) -> HashSet<String> {
        let mut out = HashSet::new();
        let mut queue: VecDeque<String> = self.direct_dependencies(name).to_vec().into();
        while let Some(next) = queue.pop_front() {
            if out.insert(next.clone()) {
                for dep in self.direct_dependencies(&next) {
                    queue.push_back(dep.clone());
                }
            }
        }
        out
    }
}
