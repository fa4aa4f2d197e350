//! Timer service.
//!
//! A table of timers addressed by handle. Arming a timer spawns a sleep
//! task that fires a [`Event::Timer`] back into the engine channel; the
//! engine validates the generation at the drain, so a stop or modify
//! simply bumps the generation and any in-flight fire goes stale. This
//! keeps timer callbacks out of arbitrary contexts: effects run only in
//! the engine loop.

use std::time::Duration;

use hashbrown::HashMap;
use tracing::trace;

use hwmgr_core::ids::TimerId;

use crate::event::{Event, EventTx};

/// Whether the service actually spawns sleep tasks. Tests run `Manual`
/// and fire timers by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    Runtime,
    Manual,
}

#[derive(Debug)]
struct Entry {
    period_ms: u64,
    repeat: bool,
    running: bool,
    generation: u64,
}

/// The timer table.
pub struct TimerService {
    entries: HashMap<TimerId, Entry>,
    next: u64,
    tx: EventTx,
    mode: TimerMode,
}

impl TimerService {
    #[must_use]
    pub fn new(tx: EventTx, mode: TimerMode) -> Self {
        Self { entries: HashMap::new(), next: 0, tx, mode }
    }

    /// Register a timer. It does not run until started.
    pub fn create(&mut self, period_ms: u64, repeat: bool) -> TimerId {
        self.next += 1;
        let id = TimerId(self.next);
        self.entries
            .insert(id, Entry { period_ms, repeat, running: false, generation: 0 });
        id
    }

    pub fn start(&mut self, id: TimerId) {
        let Some(e) = self.entries.get_mut(&id) else { return };
        e.generation += 1;
        e.running = true;
        let (generation, period) = (e.generation, e.period_ms);
        trace!(?id, period, "timer started");
        self.schedule(id, generation, period);
    }

    pub fn stop(&mut self, id: TimerId) {
        if let Some(e) = self.entries.get_mut(&id) {
            e.generation += 1;
            e.running = false;
            trace!(?id, "timer stopped");
        }
    }

    /// Change the period. A running timer rearms immediately with the new
    /// period; a stopped one just remembers it.
    pub fn modify(&mut self, id: TimerId, period_ms: u64) {
        let Some(e) = self.entries.get_mut(&id) else { return };
        e.period_ms = period_ms;
        if e.running {
            e.generation += 1;
            let generation = e.generation;
            self.schedule(id, generation, period_ms);
        }
    }

    pub fn delete(&mut self, id: TimerId) {
        self.entries.remove(&id);
    }

    /// Validate a fire at the engine drain. Returns `true` when current;
    /// repeating timers rearm here.
    pub fn on_fire(&mut self, id: TimerId, generation: u64) -> bool {
        let Some(e) = self.entries.get_mut(&id) else { return false };
        if !e.running || e.generation != generation {
            trace!(?id, generation, "stale timer fire discarded");
            return false;
        }
        if e.repeat {
            e.generation += 1;
            let (generation, period) = (e.generation, e.period_ms);
            self.schedule(id, generation, period);
        } else {
            e.running = false;
        }
        true
    }

    /// Current generation, for tests that synthesize fire events.
    #[must_use]
    pub fn generation(&self, id: TimerId) -> Option<u64> {
        self.entries.get(&id).map(|e| e.generation)
    }

    #[must_use]
    pub fn is_running(&self, id: TimerId) -> bool {
        self.entries.get(&id).is_some_and(|e| e.running)
    }

    #[must_use]
    pub fn period_ms(&self, id: TimerId) -> Option<u64> {
        self.entries.get(&id).map(|e| e.period_ms)
    }

    fn schedule(&self, id: TimerId, generation: u64, period_ms: u64) {
        if self.mode == TimerMode::Manual {
            return;
        }
        let tx = self.tx.clone();
        compio::runtime::spawn(async move {
            compio::time::sleep(Duration::from_millis(period_ms)).await;
            let _ = tx.send(Event::Timer { id, generation });
        })
        .detach();
    }
}
