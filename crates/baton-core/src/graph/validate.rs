//! Load-time validation of a `StageGraph`.
//!
//! Checks, in order:
//! 1. per-stage limits (reserved names, empty topic, zero attempts/timeout)
//! 2. entry stage is defined
//! 3. every route points at a defined stage
//! 4. every stage is reachable from the entry stage
//! 5. no cycle through a stage that is not `allow_revisit`

use std::collections::{HashMap, HashSet, VecDeque};

use super::{StageDefinition, StageGraph};
use crate::domain::errors::ConfigurationError;
use crate::domain::stage::StageName;

pub(super) fn validate(graph: &StageGraph) -> Result<(), ConfigurationError> {
    for def in graph.stages() {
        check_limits(def)?;
    }

    if !graph.contains(graph.entry_stage()) {
        return Err(ConfigurationError::UndefinedEntry(
            graph.entry_stage().clone(),
        ));
    }

    for def in graph.stages() {
        for to in successors(def) {
            if !graph.contains(to) {
                return Err(ConfigurationError::UndefinedStage {
                    from: def.name.clone(),
                    to: to.clone(),
                });
            }
        }
    }

    check_reachability(graph)?;

    if let Some(cycle) = detect_cycle(graph) {
        return Err(ConfigurationError::Cycle(cycle));
    }
    Ok(())
}

fn check_limits(def: &StageDefinition) -> Result<(), ConfigurationError> {
    let invalid = |reason: &str| ConfigurationError::InvalidStage {
        stage: def.name.clone(),
        reason: reason.to_string(),
    };

    if def.name.as_str().trim().is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if def.name.is_reserved() {
        return Err(invalid("name is a reserved routing keyword"));
    }
    if def.target_topic.trim().is_empty() {
        return Err(invalid("target topic must not be empty"));
    }
    if def.max_attempts == 0 {
        return Err(invalid("max_attempts must be > 0"));
    }
    if def.timeout.is_zero() {
        return Err(invalid("timeout must be > 0"));
    }
    Ok(())
}

/// Outgoing edges of a stage (retry-same is not an edge).
fn successors(def: &StageDefinition) -> impl Iterator<Item = &StageName> {
    def.next_on_success
        .stage()
        .into_iter()
        .chain(def.next_on_failure.stage())
}

fn check_reachability(graph: &StageGraph) -> Result<(), ConfigurationError> {
    let mut seen: HashSet<&StageName> = HashSet::new();
    let mut queue = VecDeque::new();
    seen.insert(graph.entry_stage());
    queue.push_back(graph.entry_stage());

    while let Some(name) = queue.pop_front() {
        let Some(def) = graph.stage(name) else {
            continue;
        };
        for next in successors(def) {
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }

    match graph.stages().find(|d| !seen.contains(&d.name)) {
        Some(def) => Err(ConfigurationError::Unreachable(def.name.clone())),
        None => Ok(()),
    }
}

/// Every stage on a cycle must be `allow_revisit`; an unmarked stage that
/// can reach itself would be completed more than once.
///
/// Returns the first offending cycle as a closed path (`a -> b -> a`).
fn detect_cycle(graph: &StageGraph) -> Option<Vec<StageName>> {
    graph
        .stages()
        .filter(|def| !def.allow_revisit)
        .find_map(|def| cycle_through(graph, def))
}

/// Shortest route from `from` back to itself (BFS), if there is one.
fn cycle_through<'g>(graph: &'g StageGraph, from: &'g StageDefinition) -> Option<Vec<StageName>> {
    let start = &from.name;
    let mut parent: HashMap<&'g StageName, &'g StageName> = HashMap::new();
    let mut queue: VecDeque<&'g StageDefinition> = VecDeque::from([from]);

    while let Some(def) = queue.pop_front() {
        for next in successors(def) {
            if next == start {
                return Some(closed_path(start, &def.name, &parent));
            }
            if parent.contains_key(next) {
                continue;
            }
            parent.insert(next, &def.name);
            if let Some(next_def) = graph.stage(next) {
                queue.push_back(next_def);
            }
        }
    }
    None
}

fn closed_path<'g>(
    start: &'g StageName,
    last: &'g StageName,
    parent: &HashMap<&'g StageName, &'g StageName>,
) -> Vec<StageName> {
    let mut back = Vec::new();
    let mut node = last;
    while node != start {
        back.push(node.clone());
        match parent.get(node) {
            Some(prev) => node = *prev,
            None => break,
        }
    }

    let mut path = vec![start.clone()];
    path.extend(back.into_iter().rev());
    path.push(start.clone());
    path
}
