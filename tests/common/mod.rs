//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use relayq::clock::ManualClock;
use relayq::liveness::ProcessLiveness;
use relayq::store::MemoryStore;
use relayq::Client;

/// Liveness probe answering from a script instead of the OS.
///
/// Unknown pids are alive. A pid given a countdown stays alive for that many
/// probes and is dead afterwards.
#[derive(Default)]
pub struct ScriptedLiveness {
    dead: Mutex<HashSet<u32>>,
    countdown: Mutex<HashMap<u32, usize>>,
    probes: Mutex<Vec<u32>>,
}

impl ScriptedLiveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kill(&self, pid: u32) {
        self.dead.lock().unwrap().insert(pid);
    }

    pub fn dies_after(&self, pid: u32, probes: usize) {
        self.countdown.lock().unwrap().insert(pid, probes);
    }

    pub fn probes_of(&self, pid: u32) -> usize {
        self.probes.lock().unwrap().iter().filter(|p| **p == pid).count()
    }
}

impl ProcessLiveness for ScriptedLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        self.probes.lock().unwrap().push(pid);

        if self.dead.lock().unwrap().contains(&pid) {
            return false;
        }

        let mut countdown = self.countdown.lock().unwrap();
        match countdown.get_mut(&pid) {
            Some(0) => false,
            Some(remaining) => {
                *remaining -= 1;
                true
            }
            None => true,
        }
    }
}

/// A client over a fresh in-memory store with a frozen clock.
pub fn client_at(secs: i64) -> (Client, Arc<ManualClock>, Arc<ScriptedLiveness>) {
    let clock = Arc::new(ManualClock::at_secs(secs));
    let liveness = Arc::new(ScriptedLiveness::new());
    let client = Client::new(Arc::new(MemoryStore::new()))
        .with_clock(clock.clone())
        .with_liveness(liveness.clone());
    (client, clock, liveness)
}
