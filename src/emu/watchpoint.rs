use thiserror::Error;

use crate::expr::{Evaluator, ExprError};

use super::registers::MachineState;

/// Number of watchpoints that can be active at once by default.
pub const DEFAULT_WATCH_CAPACITY: usize = 32;
/// Longest expression a watchpoint can hold.
pub const MAX_WATCH_EXPR_LEN: usize = 255;

pub type WatchId = u32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WatchError {
    #[error("all {0} watchpoints are in use")]
    CapacityExceeded(usize),
    #[error("watch expression is longer than {} bytes", MAX_WATCH_EXPR_LEN)]
    ExprTooLong,
    #[error("invalid watch expression: {0}")]
    Syntax(#[source] ExprError),
    #[error("watchpoint {id} ({expr}) can no longer be evaluated: {source}")]
    Eval {
        id: WatchId,
        expr: String,
        #[source]
        source: ExprError,
    },
}

#[derive(Debug, Clone)]
struct WatchEntry {
    id: WatchId,
    expr: String,
    value: i32,
    hits: u32,
}

/// A read-only view of an active watchpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchInfo {
    pub id: WatchId,
    pub expr: String,
    pub hits: u32,
    pub value: i32,
}

/// A watchpoint whose value changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchHit {
    pub id: WatchId,
    pub expr: String,
    pub old: i32,
    pub new: i32,
    pub hits: u32,
}

/// A fixed-capacity pool of watchpoints.
///
/// Entries live in `slots`; a slot index is either on the `free` list or in `active`,
/// never both. `active` keeps insertion order, which is also the order of checks.
pub struct WatchPool {
    slots: Vec<Option<WatchEntry>>,
    free: Vec<usize>,
    active: Vec<usize>,
    next_id: WatchId,
}

impl WatchPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            // reversed so the lowest slot is handed out first
            free: (0..capacity).rev().collect(),
            active: Vec::with_capacity(capacity),
            next_id: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Creates a watchpoint on `expr`, seeding its baseline with the current value.
    ///
    /// # Errors
    ///
    /// Fails when the pool is full, the expression is too long or it cannot be evaluated.
    /// On failure the pool is left as it was.
    pub fn set<M: MachineState + ?Sized>(
        &mut self,
        expr: &str,
        evaluator: &mut Evaluator,
        machine: &M,
    ) -> Result<WatchId, WatchError> {
        if expr.len() > MAX_WATCH_EXPR_LEN {
            return Err(WatchError::ExprTooLong);
        }
        let slot = self
            .free
            .pop()
            .ok_or(WatchError::CapacityExceeded(self.capacity()))?;
        let value = match evaluator.evaluate(expr, machine) {
            Ok(value) => value,
            Err(e) => {
                self.free.push(slot);
                return Err(WatchError::Syntax(e));
            }
        };
        let id = self.next_id;
        self.next_id += 1;
        self.slots[slot] = Some(WatchEntry {
            id,
            expr: expr.to_string(),
            value,
            hits: 0,
        });
        self.active.push(slot);
        log::info!("set watchpoint {}: {} = {}", id, expr, value);
        Ok(id)
    }

    /// Deletes the watchpoint `id`. Returns false if no active watchpoint has that id.
    pub fn delete(&mut self, id: WatchId) -> bool {
        let Some(pos) = self
            .active
            .iter()
            .position(|&slot| matches!(&self.slots[slot], Some(e) if e.id == id))
        else {
            return false;
        };
        let slot = self.active.remove(pos);
        self.slots[slot] = None;
        self.free.push(slot);
        log::info!("deleted watchpoint {}", id);
        true
    }

    /// The active watchpoints in check order.
    pub fn list(&self) -> Vec<WatchInfo> {
        self.entries()
            .map(|e| WatchInfo {
                id: e.id,
                expr: e.expr.clone(),
                hits: e.hits,
                value: e.value,
            })
            .collect()
    }

    fn entries(&self) -> impl Iterator<Item = &WatchEntry> {
        self.active
            .iter()
            .filter_map(move |&slot| self.slots[slot].as_ref())
    }

    /// Re-evaluates the active watchpoints in order and reports the first whose value
    /// differs from its baseline. That entry's hit count is bumped and its baseline moved to
    /// the new value; entries after it are not looked at until the next call.
    ///
    /// # Errors
    ///
    /// An expression that no longer evaluates is reported as [`WatchError::Eval`]. The
    /// watchpoint stays active.
    pub fn check<M: MachineState + ?Sized>(
        &mut self,
        evaluator: &mut Evaluator,
        machine: &M,
    ) -> Result<Option<WatchHit>, WatchError> {
        for &slot in &self.active {
            let Some(entry) = self.slots[slot].as_mut() else {
                continue;
            };
            let new = evaluator
                .evaluate(&entry.expr, machine)
                .map_err(|source| WatchError::Eval {
                    id: entry.id,
                    expr: entry.expr.clone(),
                    source,
                })?;
            if new != entry.value {
                let old = entry.value;
                entry.value = new;
                entry.hits += 1;
                log::debug!("watchpoint {} triggered: {} -> {}", entry.id, old, new);
                return Ok(Some(WatchHit {
                    id: entry.id,
                    expr: entry.expr.clone(),
                    old,
                    new,
                    hits: entry.hits,
                }));
            }
        }
        Ok(None)
    }
}

impl Default for WatchPool {
    fn default() -> Self {
        Self::new(DEFAULT_WATCH_CAPACITY)
    }
}
