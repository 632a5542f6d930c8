//! Run-loop pool
//!
//! Owns a fixed number of run loops and pins each selection to one of them.
//!
//! # Assignment
//!
//! 1. A selection already mapped to a live loop gets the same loop back
//!    (its duplication counter is bumped)
//! 2. Otherwise dead loops are swept: their mappings are dropped and fresh
//!    loops take their slots, so the pool always holds N loops
//! 3. The least-loaded live loop is chosen (ties go to the lowest index),
//!    accepts the selection's weight, and the mapping is recorded

use crate::config::RuntimeConfig;
use crate::run_loop::RunLoop;
use parking_lot::Mutex;
use std::collections::HashMap;
use tether_core::{Selection, SelectionId, TetherError, TetherResult, WeightedSelection};

/// Load snapshot of one pool slot, input to [`select_least_loaded`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopLoad {
    /// Accumulated selection weight
    pub weight: u32,
    /// Whether the loop accepts work
    pub alive: bool,
}

/// Index of the live loop with the smallest weight
///
/// Ties resolve to the lowest index. Returns `None` when no loop is alive.
pub fn select_least_loaded(loads: &[LoopLoad]) -> Option<usize> {
    loads
        .iter()
        .enumerate()
        .filter(|(_, load)| load.alive)
        .min_by_key(|(index, load)| (load.weight, *index))
        .map(|(index, _)| index)
}

#[derive(Debug)]
struct Assignment {
    run_loop: RunLoop,
    weight: u32,
    count: u32,
}

struct PoolState {
    loops: Vec<RunLoop>,
    assignments: HashMap<SelectionId, Assignment>,
    open: bool,
}

/// Fixed-size pool of run loops with sticky selection assignment
pub struct RunLoopPool {
    config: RuntimeConfig,
    state: Mutex<PoolState>,
}

impl RunLoopPool {
    /// Create the pool and start `config.pool_size` loops
    pub fn new(config: RuntimeConfig) -> TetherResult<Self> {
        if config.pool_size == 0 {
            return Err(TetherError::InvalidArgument("pool size must be > 0"));
        }
        let loops = Self::spawn_loops(&config)?;
        tracing::debug!(size = loops.len(), "run loop pool started");
        Ok(Self {
            config,
            state: Mutex::new(PoolState {
                loops,
                assignments: HashMap::new(),
                open: true,
            }),
        })
    }

    fn spawn_loops(config: &RuntimeConfig) -> TetherResult<Vec<RunLoop>> {
        let mut loops = Vec::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            match RunLoop::spawn(config) {
                Ok(run_loop) => loops.push(run_loop),
                Err(err) => {
                    for started in &loops {
                        started.close();
                    }
                    return Err(err);
                }
            }
        }
        Ok(loops)
    }

    /// Pin a selection to a loop
    pub fn assign(&self, selection: &dyn Selection) -> TetherResult<RunLoop> {
        let id = selection.id();
        if id.is_none() {
            return Err(TetherError::InvalidArgument("selection id is NONE"));
        }

        let mut state = self.state.lock();
        if !state.open {
            return Err(TetherError::Closed("run loop pool"));
        }

        if let Some(assignment) = state.assignments.get_mut(&id) {
            if assignment.run_loop.is_alive() {
                assignment.count += 1;
                return Ok(assignment.run_loop.clone());
            }
        }

        self.sweep(&mut state)?;

        let loads: Vec<LoopLoad> = state
            .loops
            .iter()
            .map(|l| LoopLoad {
                weight: l.weight(),
                alive: l.is_alive(),
            })
            .collect();
        let index = select_least_loaded(&loads)
            .ok_or(TetherError::InvalidState("no live run loop in pool"))?;

        let run_loop = state.loops[index].clone();
        run_loop.accept(selection);
        state.assignments.insert(
            id,
            Assignment {
                run_loop: run_loop.clone(),
                weight: selection.weight(),
                count: 1,
            },
        );

        tracing::trace!(selection = %id, loop_id = %run_loop.id(), weight = run_loop.weight(), "selection assigned");
        Ok(run_loop)
    }

    /// Replace dead loops and drop their mappings
    fn sweep(&self, state: &mut PoolState) -> TetherResult<()> {
        for slot in 0..state.loops.len() {
            if state.loops[slot].is_alive() {
                continue;
            }
            let dead = state.loops[slot].id();
            state
                .assignments
                .retain(|_, a| a.run_loop.id() != dead);
            state.loops[slot] = RunLoop::spawn(&self.config)?;
            tracing::debug!(slot, dead = %dead, replacement = %state.loops[slot].id(), "dead run loop replaced");
        }
        Ok(())
    }

    /// Release one assignment of a selection
    ///
    /// The mapping and its weight are removed when the last duplicate goes.
    pub fn reject(&self, selection: &dyn Selection) -> TetherResult<()> {
        let id = selection.id();
        if id.is_none() {
            return Err(TetherError::InvalidArgument("selection id is NONE"));
        }

        let mut state = self.state.lock();
        let Some(assignment) = state.assignments.get_mut(&id) else {
            return Err(TetherError::not_found(format!("selection {}", id)));
        };

        assignment.count -= 1;
        if assignment.count == 0 {
            if let Some(assignment) = state.assignments.remove(&id) {
                let weight = assignment.weight;
                assignment
                    .run_loop
                    .reject(&WeightedSelection::new(id, weight));
                tracing::trace!(selection = %id, loop_id = %assignment.run_loop.id(), "selection released");
            }
        }
        Ok(())
    }

    /// Loop currently pinned to a selection
    pub fn loop_for(&self, id: SelectionId) -> Option<RunLoop> {
        self.state
            .lock()
            .assignments
            .get(&id)
            .map(|a| a.run_loop.clone())
    }

    /// Number of outstanding assignments of a selection
    pub fn assignment_count(&self, id: SelectionId) -> u32 {
        self.state
            .lock()
            .assignments
            .get(&id)
            .map_or(0, |a| a.count)
    }

    /// Snapshot of the pool's loops
    pub fn loops(&self) -> Vec<RunLoop> {
        self.state.lock().loops.clone()
    }

    /// Number of loops
    pub fn size(&self) -> usize {
        self.state.lock().loops.len()
    }

    /// Whether the pool accepts assignments
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Close every loop (idempotent)
    pub fn close(&self) {
        let loops = {
            let mut state = self.state.lock();
            if !state.open {
                return;
            }
            state.open = false;
            state.loops.clone()
        };
        // Joined outside the lock; loop tasks may call back into the pool
        for run_loop in &loops {
            run_loop.close();
        }
        tracing::debug!(size = loops.len(), "run loop pool closed");
    }

    /// Recreate a fresh loop set and clear all mappings
    ///
    /// Closes the current loops first if the pool is still open.
    pub fn reopen(&self) -> TetherResult<()> {
        self.close();
        let loops = Self::spawn_loops(&self.config)?;

        let mut state = self.state.lock();
        state.loops = loops;
        state.assignments.clear();
        state.open = true;
        tracing::debug!(size = state.loops.len(), "run loop pool reopened");
        Ok(())
    }
}

impl Drop for RunLoopPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RunLoopPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RunLoopPool")
            .field("loops", &state.loops)
            .field("assignments", &state.assignments.len())
            .field("open", &state.open)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;
    use tether_core::ErrorKind;

    fn pool(size: usize) -> RunLoopPool {
        RunLoopPool::new(
            RuntimeConfig::new()
                .pool_size(size)
                .loop_max_wait(Duration::from_millis(20)),
        )
        .unwrap()
    }

    #[test]
    fn test_select_least_loaded() {
        let load = |weight, alive| LoopLoad { weight, alive };
        assert_eq!(select_least_loaded(&[]), None);
        assert_eq!(
            select_least_loaded(&[load(3, true), load(1, true), load(1, true)]),
            Some(1)
        );
        assert_eq!(
            select_least_loaded(&[load(0, false), load(7, true)]),
            Some(1)
        );
        assert_eq!(select_least_loaded(&[load(0, false)]), None);
    }

    #[test]
    fn test_assign_is_sticky() {
        let pool = pool(3);
        let sel = WeightedSelection::unique(2);

        let first = pool.assign(&sel).unwrap();
        let second = pool.assign(&sel).unwrap();
        assert_eq!(first, second);
        assert_eq!(pool.assignment_count(sel.id()), 2);
        // Duplicates do not add weight twice
        assert_eq!(first.weight(), 2);
        pool.close();
    }

    #[test]
    fn test_assign_balances_by_weight() {
        let pool = pool(3);
        let a = pool.assign(&WeightedSelection::unique(5)).unwrap();
        let b = pool.assign(&WeightedSelection::unique(1)).unwrap();
        let c = pool.assign(&WeightedSelection::unique(1)).unwrap();
        let d = pool.assign(&WeightedSelection::unique(1)).unwrap();

        let loops = pool.loops();
        assert_eq!(a, loops[0]);
        assert_eq!(b, loops[1]);
        assert_eq!(c, loops[2]);
        // Loop 1 and 2 both weigh 1: lowest index wins
        assert_eq!(d, loops[1]);
        pool.close();
    }

    #[test]
    fn test_reassign_after_loop_dies() {
        let pool = pool(2);
        let sel = WeightedSelection::unique(1);

        let first = pool.assign(&sel).unwrap();
        first.close();

        let second = pool.assign(&sel).unwrap();
        assert_ne!(first, second);
        assert!(second.is_alive());
        assert_eq!(pool.size(), 2);
        assert!(pool.loops().iter().all(|l| l.is_alive()));
        assert_eq!(pool.assignment_count(sel.id()), 1);
        pool.close();
    }

    #[test]
    fn test_reject_round_trip() {
        let pool = pool(2);
        let sel = WeightedSelection::unique(4);

        let run_loop = pool.assign(&sel).unwrap();
        pool.assign(&sel).unwrap();
        assert_eq!(run_loop.weight(), 4);

        pool.reject(&sel).unwrap();
        assert_eq!(run_loop.weight(), 4);
        assert!(pool.loop_for(sel.id()).is_some());

        pool.reject(&sel).unwrap();
        assert_eq!(run_loop.weight(), 0);
        assert!(pool.loop_for(sel.id()).is_none());

        let err = pool.reject(&sel).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        pool.close();
    }

    #[test]
    fn test_none_selection_rejected() {
        let pool = pool(1);
        let none = WeightedSelection::new(SelectionId::NONE, 1);
        assert_eq!(
            pool.assign(&none).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            pool.reject(&none).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        pool.close();
    }

    #[test]
    fn test_close_and_reopen() {
        let pool = pool(2);
        let sel = WeightedSelection::unique(1);
        let old = pool.assign(&sel).unwrap();

        pool.close();
        assert!(!pool.is_open());
        assert!(!old.is_alive());
        assert_eq!(pool.assign(&sel).unwrap_err().kind(), ErrorKind::Closed);

        pool.reopen().unwrap();
        assert!(pool.is_open());
        assert!(pool.loop_for(sel.id()).is_none());

        let fresh = pool.assign(&sel).unwrap();
        assert_ne!(fresh, old);
        assert!(fresh.is_alive());
        pool.close();
    }

    #[test]
    fn test_zero_size_rejected() {
        let err = RunLoopPool::new(RuntimeConfig::new().pool_size(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    proptest! {
        #[test]
        fn prop_selected_loop_is_minimal(
            loads in proptest::collection::vec((0u32..1000, any::<bool>()), 0..16)
        ) {
            let loads: Vec<LoopLoad> = loads
                .into_iter()
                .map(|(weight, alive)| LoopLoad { weight, alive })
                .collect();

            match select_least_loaded(&loads) {
                None => prop_assert!(loads.iter().all(|l| !l.alive)),
                Some(i) => {
                    prop_assert!(loads[i].alive);
                    for (j, other) in loads.iter().enumerate().filter(|(_, l)| l.alive) {
                        prop_assert!(loads[i].weight <= other.weight);
                        if other.weight == loads[i].weight {
                            prop_assert!(i <= j);
                        }
                    }
                }
            }
        }
    }
}
