use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::Transport;
use crate::error::{Error, Result};

/// In-memory register map per unit, with call accounting for concurrency tests.
#[derive(Default, Clone)]
pub struct FakeTransport {
    pub registers: BTreeMap<(u8, u16), u16>,
    pub failing_starts: HashSet<u16>,
    pub delay: Duration,
    pub unit: u8,
    pub reads: Arc<Mutex<Vec<(u8, u16, u16)>>>,
    pub in_flight: Arc<AtomicUsize>,
    pub max_in_flight: Arc<AtomicUsize>,
}

impl FakeTransport {
    pub fn with_register(mut self, unit: u8, register: u16, value: u16) -> Self {
        self.registers.insert((unit, register), value);
        self
    }
}

impl Transport for FakeTransport {
    fn select_unit(&mut self, unit: u8) {
        self.unit = unit;
    }

    fn read_holding_registers(&mut self, start: u16, count: u16) -> Result<Vec<u8>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        thread::sleep(self.delay);
        self.reads.lock().unwrap().push((self.unit, start, count));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing_starts.contains(&start) {
            return Err(Error::Transport(std::io::ErrorKind::TimedOut.into()));
        }
        Ok((start..start + count)
            .flat_map(|register| {
                self.registers
                    .get(&(self.unit, register))
                    .copied()
                    .unwrap_or_default()
                    .to_be_bytes()
            })
            .collect())
    }
}
