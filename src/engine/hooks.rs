// src/engine/hooks.rs

//! Manager lifecycle callbacks.
//!
//! Subscribing to `new` or `started` events through the manager replays the
//! callback synchronously for every slave already in that state before the
//! subscription returns, so late subscribers see the current state and not
//! only future deltas. `finished` and `removed` are pure future events.

use std::fmt;

use crate::exec::Slave;

pub type SlaveCallback = Box<dyn FnMut(&Slave)>;

#[derive(Default)]
pub struct Hooks {
    new: Vec<SlaveCallback>,
    started: Vec<SlaveCallback>,
    finished: Vec<SlaveCallback>,
    removed: Vec<SlaveCallback>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("new", &self.new.len())
            .field("started", &self.started.len())
            .field("finished", &self.finished.len())
            .field("removed", &self.removed.len())
            .finish()
    }
}

fn fire(callbacks: &mut [SlaveCallback], slave: &Slave) {
    for cb in callbacks.iter_mut() {
        cb(slave);
    }
}

impl Hooks {
    pub fn add_new(&mut self, cb: SlaveCallback) {
        self.new.push(cb);
    }

    pub fn add_started(&mut self, cb: SlaveCallback) {
        self.started.push(cb);
    }

    pub fn add_finished(&mut self, cb: SlaveCallback) {
        self.finished.push(cb);
    }

    pub fn add_removed(&mut self, cb: SlaveCallback) {
        self.removed.push(cb);
    }

    pub fn slave_new(&mut self, slave: &Slave) {
        fire(&mut self.new, slave);
    }

    pub fn slave_started(&mut self, slave: &Slave) {
        fire(&mut self.started, slave);
    }

    pub fn slave_finished(&mut self, slave: &Slave) {
        fire(&mut self.finished, slave);
    }

    pub fn slave_removed(&mut self, slave: &Slave) {
        fire(&mut self.removed, slave);
    }
}
