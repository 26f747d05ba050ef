//! Filters registered by live connections and the sweeps they leave behind.
//!
//! A filter here is one protocol line, a [`Selector`] that may join several
//! labels. Each filter carries a count of the connections holding it and a
//! generation. When the last holder disconnects the generation is bumped and
//! a [`PendingSweep`] is handed out. The sweep only runs if, once the grace
//! period has passed, nobody re-registered the filter and no later
//! disconnect superseded it. That gives every orphaned filter exactly one
//! sweep.

use std::collections::HashMap;
use std::time::Duration;

use dockyard::reaper::protocol::Selector;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct FilterEntry {
    holders: usize,
    generation: u64,
}

/// A filter whose last holder disconnected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSweep {
    /// The orphaned filter.
    pub filter: Selector,
    generation: u64,
}

/// Shared server state.
#[derive(Debug)]
pub struct FilterRegistry {
    filters: HashMap<Selector, FilterEntry>,
    connections: usize,
    pending: usize,
    sweeping: usize,
    ever_connected: bool,
    last_activity: Instant,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            filters: HashMap::new(),
            connections: 0,
            pending: 0,
            sweeping: 0,
            ever_connected: false,
            last_activity: Instant::now(),
        }
    }

    /// Record a new connection.
    pub fn connection_opened(&mut self) {
        self.connections += 1;
        self.ever_connected = true;
        self.touch();
    }

    /// Record a connection closing and release every filter it held.
    ///
    /// Returns the filters that no connection holds any more.
    pub fn connection_closed<'a>(
        &mut self,
        held: impl IntoIterator<Item = &'a Selector>,
    ) -> Vec<PendingSweep> {
        self.connections = self.connections.saturating_sub(1);
        self.touch();

        let mut orphaned = Vec::new();
        for filter in held {
            let Some(entry) = self.filters.get_mut(filter) else {
                continue;
            };
            entry.holders = entry.holders.saturating_sub(1);
            if entry.holders == 0 {
                entry.generation += 1;
                self.pending += 1;
                orphaned.push(PendingSweep {
                    filter: filter.clone(),
                    generation: entry.generation,
                });
            }
        }
        orphaned
    }

    /// A connection starts holding `filter`.
    pub fn acquire(&mut self, filter: &Selector) {
        self.filters.entry(filter.clone()).or_default().holders += 1;
        self.touch();
    }

    /// Decide a pending sweep once its grace period is over.
    ///
    /// Returns `true` exactly once per orphaned filter; the caller must then
    /// sweep and call [`sweep_finished`](Self::sweep_finished).
    pub fn claim(&mut self, pending: &PendingSweep) -> bool {
        self.pending = self.pending.saturating_sub(1);
        self.touch();

        let orphaned = self
            .filters
            .get(&pending.filter)
            .is_some_and(|e| e.holders == 0 && e.generation == pending.generation);
        if orphaned {
            self.filters.remove(&pending.filter);
            self.sweeping += 1;
        }
        orphaned
    }

    /// A claimed sweep completed.
    pub fn sweep_finished(&mut self) {
        self.sweeping = self.sweeping.saturating_sub(1);
        self.touch();
    }

    /// Number of open connections.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections
    }

    /// Filters currently held by at least one connection.
    #[must_use]
    pub fn held_filters(&self) -> Vec<Selector> {
        let mut held: Vec<_> = self
            .filters
            .iter()
            .filter(|(_, e)| e.holders > 0)
            .map(|(f, _)| f.clone())
            .collect();
        held.sort();
        held
    }

    /// Sweeps waiting out their grace period or in progress.
    #[must_use]
    pub fn outstanding_sweeps(&self) -> usize {
        self.pending + self.sweeping
    }

    /// Whether any client has connected since the server started.
    #[must_use]
    pub fn ever_connected(&self) -> bool {
        self.ever_connected
    }

    /// Whether the server has had nothing to do for `timeout`.
    #[must_use]
    pub fn idle_for(&self, timeout: Duration) -> bool {
        self.connections == 0
            && self.outstanding_sweeps() == 0
            && self.last_activity.elapsed() >= timeout
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}
