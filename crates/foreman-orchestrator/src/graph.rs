//! Structural checks and queries over a plan's step graph.

use crate::types::{Step, StepId};
use std::collections::{HashMap, HashSet, VecDeque};

/// Check that `steps` form a well-formed plan: at least one step, unique
/// non-empty ids, no cycles, and every dependency (declared or implied by an
/// input reference) naming an earlier step.
pub fn validate(steps: &[Step]) -> Result<(), String> {
    if steps.is_empty() {
        return Err("plan has no steps".into());
    }

    let mut position: HashMap<&str, usize> = HashMap::new();
    for (i, step) in steps.iter().enumerate() {
        if step.id.trim().is_empty() {
            return Err(format!("step {} has an empty id", i + 1));
        }
        if position.insert(step.id.as_str(), i).is_some() {
            return Err(format!("duplicate step id '{}'", step.id));
        }
    }

    for step in steps {
        for dep in &step.depends_on {
            if !position.contains_key(dep.as_str()) {
                return Err(format!("step '{}' depends on unknown step '{dep}'", step.id));
            }
        }
        for (name, input) in &step.inputs {
            if let Some(source) = input.source_step() {
                if !step.depends_on.iter().any(|d| d == source) {
                    return Err(format!(
                        "input '{name}' of step '{}' reads '{source}' without depending on it",
                        step.id
                    ));
                }
            }
        }
    }

    if let Some(id) = find_cycle(steps) {
        return Err(format!("dependency cycle through step '{id}'"));
    }

    for (i, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            if position[dep.as_str()] >= i {
                return Err(format!(
                    "step '{}' references later step '{dep}'",
                    step.id
                ));
            }
        }
    }
    Ok(())
}

/// First step found on a dependency cycle, if any.
fn find_cycle(steps: &[Step]) -> Option<&str> {
    let edges: HashMap<&str, &[StepId]> = steps
        .iter()
        .map(|s| (s.id.as_str(), s.depends_on.as_slice()))
        .collect();
    let mut visited: HashMap<&str, u8> = HashMap::new();
    steps
        .iter()
        .map(|s| s.id.as_str())
        .find(|&id| dfs_cycle(id, &edges, &mut visited))
}

fn dfs_cycle<'a>(
    id: &'a str,
    edges: &HashMap<&'a str, &'a [StepId]>,
    visited: &mut HashMap<&'a str, u8>,
) -> bool {
    match visited.get(id) {
        Some(1) => return true,  // back edge
        Some(2) => return false, // done
        _ => {}
    }
    visited.insert(id, 1);
    if let Some(&deps) = edges.get(id) {
        for dep in deps {
            if dfs_cycle(dep.as_str(), edges, visited) {
                return true;
            }
        }
    }
    visited.insert(id, 2);
    false
}

/// Ids of steps no other step depends on, in plan order.
pub fn goal_steps(steps: &[Step]) -> Vec<StepId> {
    let depended: HashSet<&str> = steps
        .iter()
        .flat_map(|s| s.depends_on.iter().map(String::as_str))
        .collect();
    steps
        .iter()
        .filter(|s| !depended.contains(s.id.as_str()))
        .map(|s| s.id.clone())
        .collect()
}

/// Every step that depends on `id` directly or transitively, in plan order.
pub fn transitive_dependents(steps: &[Step], id: &str) -> Vec<StepId> {
    let mut reached: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([id]);
    while let Some(current) = queue.pop_front() {
        for step in steps {
            if step.depends_on.iter().any(|d| d == current) && reached.insert(step.id.as_str()) {
                queue.push_back(step.id.as_str());
            }
        }
    }
    steps
        .iter()
        .filter(|s| reached.contains(s.id.as_str()))
        .map(|s| s.id.clone())
        .collect()
}

/// Indices in an order where every step follows its dependencies. Among steps
/// whose dependencies are met, the earlier one in the plan comes first.
pub fn topological_order(steps: &[Step]) -> Vec<usize> {
    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();
    let mut remaining: Vec<usize> = steps
        .iter()
        .map(|s| s.depends_on.iter().filter(|d| index.contains_key(d.as_str())).count())
        .collect();
    let mut placed = vec![false; steps.len()];
    let mut order = Vec::with_capacity(steps.len());

    while order.len() < steps.len() {
        let Some(next) = (0..steps.len()).find(|&i| !placed[i] && remaining[i] == 0) else {
            break;
        };
        placed[next] = true;
        order.push(next);
        for (i, step) in steps.iter().enumerate() {
            if step.depends_on.iter().any(|d| *d == steps[next].id) {
                remaining[i] = remaining[i].saturating_sub(1);
            }
        }
    }
    order
}
