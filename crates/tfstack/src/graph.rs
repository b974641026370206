//! execution order of loaded units
//!
//! One node per unit, one edge per dependency reference (from the dependency to the dependent).
//! The order is a topological sort where ties are broken by unit name (then path) so the same
//! set of units always runs in the same order, regardless of the order they were loaded in.
use crate::loader::{Unit, UnitId, Units};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

pub struct ExecutionGraph<'u> {
    units: &'u Units,
    graph: DiGraph<UnitId, ()>,
    order: Vec<UnitId>,
    waves: Vec<Vec<UnitId>>,
    /// serializes visit bodies during [ExecutionGraph::walk]
    execution_lock: Mutex<()>,
}

impl<'u> ExecutionGraph<'u> {
    pub fn build(units: &'u Units) -> Result<Self, GraphError> {
        let mut graph = DiGraph::new();
        let nodes: HashMap<UnitId, NodeIndex> = units
            .iter()
            .map(|unit| (unit.id, graph.add_node(unit.id)))
            .collect();

        for unit in units.iter() {
            for dependency in unit.dependencies.values() {
                graph.add_edge(nodes[dependency], nodes[&unit.id], ());
            }
        }

        let order = sort(units, &graph)?;
        let waves = waves(&graph, &order, &nodes);

        tracing::debug!(?order, "execution order");
        Ok(Self {
            units,
            graph,
            order,
            waves,
            execution_lock: Mutex::new(()),
        })
    }

    /// Dependencies before dependents
    pub fn order(&self) -> impl Iterator<Item = &'u Unit> + '_ {
        self.order.iter().map(|id| &self.units[*id])
    }

    /// Dependents before dependencies
    pub fn teardown_order(&self) -> impl Iterator<Item = &'u Unit> + '_ {
        self.order.iter().rev().map(|id| &self.units[*id])
    }

    /// Groups of units whose dependencies are all in earlier groups
    pub fn waves(&self) -> &[Vec<UnitId>] {
        &self.waves
    }

    /// Units directly depending on `id`
    pub fn dependents(&self, id: UnitId) -> Vec<UnitId> {
        self.graph
            .node_indices()
            .find(|node| self.graph[*node] == id)
            .map(|node| {
                self.graph
                    .neighbors_directed(node, Direction::Outgoing)
                    .map(|dependent| self.graph[dependent])
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Visit all units wave by wave
    ///
    /// Units of one wave are dispatched concurrently, but `visit` itself runs under a single
    /// lock so bodies never overlap. Within a wave bodies run in execution order.
    /// With `reverse` everything is visited in teardown order.
    ///
    /// The first error stops the walk, later units of the same wave are not visited.
    pub fn walk<F, E>(&self, reverse: bool, visit: F) -> Result<(), E>
    where
        F: Fn(&Unit) -> Result<(), E> + Sync,
        E: Send,
    {
        let mut waves = self.waves.clone();
        if reverse {
            waves.reverse();
            waves.iter_mut().for_each(|wave| wave.reverse());
        }

        let failed = AtomicBool::new(false);
        for (index, wave) in waves.iter().enumerate() {
            tracing::debug!(wave = index, units = wave.len(), "dispatching wave");

            let turn = Mutex::new(0usize);
            let signal = Condvar::new();
            let results: Vec<Result<(), E>> = std::thread::scope(|scope| {
                let handles: Vec<_> = wave
                    .iter()
                    .enumerate()
                    .map(|(position, id)| {
                        let unit = &self.units[*id];
                        let (visit, turn, signal, failed) = (&visit, &turn, &signal, &failed);
                        scope.spawn(move || {
                            let _turn = Turn::wait(turn, signal, position);
                            let _execution = self
                                .execution_lock
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner());

                            if failed.load(Ordering::SeqCst) {
                                tracing::debug!(unit=%unit.path.display(), "not visiting after failure");
                                return Ok(());
                            }

                            tracing::trace!(unit=%unit.path.display(), "visiting");
                            let result = visit(unit);
                            if result.is_err() {
                                failed.store(true, Ordering::SeqCst);
                            }
                            result
                        })
                    })
                    .collect();

                handles
                    .into_iter()
                    .map(|handle| match handle.join() {
                        Ok(result) => result,
                        Err(panic) => std::panic::resume_unwind(panic),
                    })
                    .collect()
            });

            for result in results {
                result?;
            }
        }

        Ok(())
    }
}

/// Position of the visit allowed to run next within a wave, advanced on drop
struct Turn<'a> {
    current: MutexGuard<'a, usize>,
    signal: &'a Condvar,
}

impl<'a> Turn<'a> {
    fn wait(turn: &'a Mutex<usize>, signal: &'a Condvar, position: usize) -> Self {
        let mut current = turn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while *current != position {
            current = signal
                .wait(current)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        Self { current, signal }
    }
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        *self.current += 1;
        self.signal.notify_all();
    }
}

/// Kahn's algorithm, always picking the ready unit with the smallest (name, path)
fn sort(units: &Units, graph: &DiGraph<UnitId, ()>) -> Result<Vec<UnitId>, GraphError> {
    let key = |node: NodeIndex| {
        let unit = &units[graph[node]];
        (unit.name(), unit.path.clone(), node)
    };

    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|node| {
            (
                node,
                graph.neighbors_directed(node, Direction::Incoming).count(),
            )
        })
        .collect();

    let mut ready: BTreeSet<(String, PathBuf, NodeIndex)> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(node, _)| key(*node))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some((_, _, node)) = ready.pop_first() {
        order.push(graph[node]);

        for dependent in graph.neighbors_directed(node, Direction::Outgoing) {
            let degree = in_degree.entry(dependent).or_default();
            *degree = degree.saturating_sub(1);
            if *degree == 0 {
                ready.insert(key(dependent));
            }
        }
    }

    if order.len() == graph.node_count() {
        return Ok(order);
    }

    let cycle = tarjan_scc(graph)
        .into_iter()
        .find(|component| {
            component.len() > 1
                || component
                    .first()
                    .is_some_and(|node| graph.contains_edge(*node, *node))
        })
        .unwrap_or_default();

    let mut paths: Vec<PathBuf> = cycle
        .into_iter()
        .map(|node| units[graph[node]].path.clone())
        .collect();
    paths.sort();

    Err(GraphError::Cycle { paths })
}

fn waves(
    graph: &DiGraph<UnitId, ()>,
    order: &[UnitId],
    nodes: &HashMap<UnitId, NodeIndex>,
) -> Vec<Vec<UnitId>> {
    let mut level: HashMap<UnitId, usize> = HashMap::new();
    let mut waves: Vec<Vec<UnitId>> = vec![];

    for id in order {
        let wave = graph
            .neighbors_directed(nodes[id], Direction::Incoming)
            .map(|dependency| level[&graph[dependency]] + 1)
            .max()
            .unwrap_or(0);

        level.insert(*id, wave);
        if waves.len() <= wave {
            waves.resize_with(wave + 1, Vec::new);
        }
        waves[wave].push(*id);
    }

    waves
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum GraphError {
    #[error("dependency cycle between {}", display_paths(.paths))]
    Cycle { paths: Vec<PathBuf> },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
