use std::collections::{HashMap, HashSet, VecDeque};

use mplp_core::error::{MplpError, Result};

use crate::workflow::Step;

/// Dependency graph of the top-level steps, checked once per execution.
///
/// Built with Kahn's algorithm: construction fails if a dependency names an
/// unknown step or the graph has a cycle, so the scheduler can rely on every
/// step eventually becoming ready.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Number of distinct dependencies per step index.
    in_degree: Vec<usize>,
    /// Step indices unblocked by each step index.
    dependents: Vec<Vec<usize>>,
    /// A valid topological order (declaration order among peers).
    order: Vec<usize>,
}

impl ExecutionPlan {
    pub fn new(steps: &[Step]) -> Result<Self> {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if index.insert(step.id.as_str(), i).is_some() {
                return Err(MplpError::Execution(format!(
                    "Duplicate step id '{}'",
                    step.id
                )));
            }
        }

        let mut in_degree = vec![0; steps.len()];
        let mut dependents = vec![Vec::new(); steps.len()];
        for (i, step) in steps.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &step.dependencies {
                let Some(&d) = index.get(dep.as_str()) else {
                    return Err(MplpError::Execution(format!(
                        "Step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                };
                if seen.insert(d) {
                    in_degree[i] += 1;
                    dependents[d].push(i);
                }
            }
        }

        let mut remaining = in_degree.clone();
        let mut queue: VecDeque<usize> = (0..steps.len()).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(steps.len());
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &d in &dependents[i] {
                remaining[d] -= 1;
                if remaining[d] == 0 {
                    queue.push_back(d);
                }
            }
        }

        if order.len() != steps.len() {
            let blocked: Vec<&str> = (0..steps.len())
                .filter(|&i| remaining[i] > 0)
                .map(|i| steps[i].id.as_str())
                .collect();
            return Err(MplpError::Execution(format!(
                "Dependency cycle detected among steps: {}",
                blocked.join(", ")
            )));
        }

        Ok(Self {
            in_degree,
            dependents,
            order,
        })
    }

    /// Steps with no dependencies, in declaration order.
    pub fn roots(&self) -> Vec<usize> {
        (0..self.in_degree.len())
            .filter(|&i| self.in_degree[i] == 0)
            .collect()
    }

    pub fn in_degrees(&self) -> Vec<usize> {
        self.in_degree.clone()
    }

    pub fn dependents(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }

    pub fn order(&self) -> &[usize] {
        &self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> Step {
        Step::agent(id, id, "agent", "run").with_dependencies(deps.iter().copied())
    }

    #[test]
    fn test_linear_order() {
        let steps = vec![step("c", &["b"]), step("b", &["a"]), step("a", &[])];
        let plan = ExecutionPlan::new(&steps).unwrap();
        let ids: Vec<&str> = plan.order().iter().map(|&i| steps[i].id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(plan.roots(), vec![2]);
    }

    #[test]
    fn test_diamond_and_duplicate_edges() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a", "a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ];
        let plan = ExecutionPlan::new(&steps).unwrap();
        assert_eq!(plan.in_degrees(), vec![0, 1, 1, 2]);
        assert_eq!(plan.dependents(0), &[1, 2]);
        assert_eq!(plan.order().first(), Some(&0));
        assert_eq!(plan.order().last(), Some(&3));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let steps = vec![step("a", &["b"]), step("b", &["a"]), step("c", &[])];
        let err = ExecutionPlan::new(&steps).unwrap_err();
        assert!(matches!(err, MplpError::Execution(_)));
        assert!(err.to_string().contains("a, b"));
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let steps = vec![step("a", &["ghost"])];
        let err = ExecutionPlan::new(&steps).unwrap_err();
        assert!(err.to_string().contains("unknown step 'ghost'"));
    }
}
