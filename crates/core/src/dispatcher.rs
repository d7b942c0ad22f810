//! Synchronous broadcast of actions to registered handlers.
//!
//! Handlers may declare that other handlers must see an action first. The
//! dependency graph is resolved into a fixed call order whenever it changes,
//! so a cycle is rejected when it is declared instead of surfacing during a
//! dispatch.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use tracing::{debug, trace};

use crate::error::{DispatchError, Result};

pub type Handler<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// Identifies one registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatchToken(u64);

impl fmt::Display for DispatchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ID_{}", self.0)
    }
}

struct Registration<A> {
    token: DispatchToken,
    handler: Handler<A>,
    after: Vec<DispatchToken>,
}

struct Registry<A> {
    next_id: u64,
    entries: Vec<Registration<A>>,
    /// Indices into `entries` in call order.
    order: Vec<usize>,
}

impl<A> Registry<A> {
    fn position(&self, token: DispatchToken) -> Option<usize> {
        self.entries.iter().position(|e| e.token == token)
    }

    fn check_known(&self, tokens: &[DispatchToken]) -> Result<()> {
        match tokens.iter().find(|t| self.position(**t).is_none()) {
            Some(unknown) => Err(DispatchError::UnknownToken(*unknown)),
            None => Ok(()),
        }
    }

    /// Stable topological order: among the handlers whose dependencies have
    /// all been placed, the earliest registered goes next.
    fn resolve(&self) -> Result<Vec<usize>> {
        let index: HashMap<DispatchToken, usize> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.token, i))
            .collect();
        let mut placed = vec![false; self.entries.len()];
        let mut order = Vec::with_capacity(self.entries.len());

        while order.len() < self.entries.len() {
            let ready = self.entries.iter().enumerate().position(|(i, entry)| {
                !placed[i]
                    && entry
                        .after
                        .iter()
                        .all(|dep| index.get(dep).is_none_or(|&j| placed[j]))
            });
            match ready {
                Some(i) => {
                    placed[i] = true;
                    order.push(i);
                }
                None => {
                    let stuck = self
                        .entries
                        .iter()
                        .enumerate()
                        .find(|(i, _)| !placed[*i])
                        .map(|(_, e)| e.token);
                    return Err(DispatchError::Cycle(stuck.unwrap_or(DispatchToken(0))));
                }
            }
        }
        Ok(order)
    }

    fn handlers(&self) -> Vec<Handler<A>> {
        self.order
            .iter()
            .map(|&i| Arc::clone(&self.entries[i].handler))
            .collect()
    }
}

/// Broadcast channel for action records of type `A`.
///
/// Dispatches from different threads are serialised, so handlers never run
/// concurrently and every handler sees actions in dispatch order.
pub struct Dispatcher<A> {
    registry: Mutex<Registry<A>>,
    lane: Mutex<()>,
    dispatching: Mutex<Option<ThreadId>>,
}

impl<A> Default for Dispatcher<A> {
    fn default() -> Self {
        Self {
            registry: Mutex::new(Registry {
                next_id: 1,
                entries: Vec::new(),
                order: Vec::new(),
            }),
            lane: Mutex::new(()),
            dispatching: Mutex::new(None),
        }
    }
}

impl<A> Dispatcher<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler with no ordering constraints.
    pub fn register<F>(&self, handler: F) -> DispatchToken
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let mut registry = self.registry();
        let token = Self::insert(&mut registry, Arc::new(handler), Vec::new());
        // A fresh handler without dependencies always goes last.
        let idx = registry.entries.len() - 1;
        registry.order.push(idx);
        token
    }

    /// Register a handler that runs after every handler in `after`.
    pub fn register_after<F>(&self, after: &[DispatchToken], handler: F) -> Result<DispatchToken>
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let mut registry = self.registry();
        registry.check_known(after)?;
        let token = Self::insert(&mut registry, Arc::new(handler), dedup(after));
        registry.order = registry.resolve()?;
        debug!(%token, deps = after.len(), "registered dependent handler");
        Ok(token)
    }

    /// Declare that `token` must run after `deps`. Rejects cycles and leaves
    /// the previous ordering untouched when it does.
    pub fn wait_for(&self, token: DispatchToken, deps: &[DispatchToken]) -> Result<()> {
        let mut registry = self.registry();
        let pos = registry
            .position(token)
            .ok_or(DispatchError::UnknownToken(token))?;
        registry.check_known(deps)?;

        let previous = registry.entries[pos].after.clone();
        let mut after = previous.clone();
        after.extend_from_slice(deps);
        registry.entries[pos].after = dedup(&after);

        match registry.resolve() {
            Ok(order) => {
                registry.order = order;
                Ok(())
            }
            Err(err) => {
                registry.entries[pos].after = previous;
                Err(err)
            }
        }
    }

    /// Remove a handler. Dependencies on it are dropped from other handlers.
    pub fn unregister(&self, token: DispatchToken) -> Result<()> {
        let mut registry = self.registry();
        let pos = registry
            .position(token)
            .ok_or(DispatchError::UnknownToken(token))?;
        registry.entries.remove(pos);
        for entry in &mut registry.entries {
            entry.after.retain(|dep| *dep != token);
        }
        registry.order = registry.resolve()?;
        Ok(())
    }

    /// Deliver `action` to every handler, in order, on the calling thread.
    pub fn dispatch(&self, action: &A) -> Result<()> {
        let current = thread::current().id();
        if *self.dispatching() == Some(current) {
            return Err(DispatchError::NestedDispatch);
        }

        let _lane = self.lane.lock().unwrap_or_else(PoisonError::into_inner);
        let handlers = self.registry().handlers();
        let _guard = DispatchGuard::enter(&self.dispatching, current);
        trace!(handlers = handlers.len(), "dispatching action");
        for handler in &handlers {
            handler(action);
        }
        Ok(())
    }

    pub fn is_dispatching(&self) -> bool {
        self.dispatching().is_some()
    }

    pub fn handler_count(&self) -> usize {
        self.registry().entries.len()
    }

    fn insert(
        registry: &mut Registry<A>,
        handler: Handler<A>,
        after: Vec<DispatchToken>,
    ) -> DispatchToken {
        let token = DispatchToken(registry.next_id);
        registry.next_id += 1;
        registry.entries.push(Registration {
            token,
            handler,
            after,
        });
        token
    }

    fn registry(&self) -> MutexGuard<'_, Registry<A>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatching(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.dispatching
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn dedup(tokens: &[DispatchToken]) -> Vec<DispatchToken> {
    let mut seen = HashSet::new();
    tokens.iter().copied().filter(|t| seen.insert(*t)).collect()
}

/// Marks the current thread as dispatching; cleared on drop, including unwinds.
struct DispatchGuard<'a> {
    slot: &'a Mutex<Option<ThreadId>>,
}

impl<'a> DispatchGuard<'a> {
    fn enter(slot: &'a Mutex<Option<ThreadId>>, thread: ThreadId) -> Self {
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(thread);
        Self { slot }
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
