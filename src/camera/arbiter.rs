// Copyright 2025 The videohal Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Exclusive-access arbitration between concurrently-open capture devices.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

/// A running capture instance that the arbiter may forcibly stop.
pub trait Preemptible: Send + Sync {
    fn preempt(&self);
}

/// Per-provider table of physical device slots and their running instances.
///
/// `acquire` is a single lock-protected stop-then-record operation, so two
/// devices can never both believe they hold access to the same slot.
/// Callers must not hold their own device lock while acquiring: the arbiter
/// stops preempted devices from inside the lock, and those stops take the
/// preempted device's lock. Lock order is always arbiter, then device.
pub struct CaptureArbiter {
    slots: Mutex<Vec<Option<Weak<dyn Preemptible>>>>,
}

impl CaptureArbiter {
    pub fn new(num_slots: usize) -> Self {
        let mut slots = Vec::with_capacity(num_slots);
        slots.resize_with(num_slots, || None);
        Self { slots: Mutex::new(slots) }
    }

    /// Acquires capture access for `claimant` on `slot`.
    ///
    /// In shared mode only another running instance of the same slot is
    /// stopped. In exclusive mode every other running device is stopped and
    /// its record dropped; used when the hardware refuses to drive two
    /// devices at once.
    pub fn acquire(&self, slot: usize, claimant: Weak<dyn Preemptible>, exclusive: bool) -> bool {
        let mut slots = self.slots.lock().unwrap();
        if slot >= slots.len() {
            return false;
        }

        if exclusive {
            for (index, entry) in slots.iter_mut().enumerate() {
                if let Some(running) = entry.as_ref().and_then(Weak::upgrade) {
                    if !same_instance(&running, &claimant) {
                        running.preempt();
                    }
                }
                if index != slot {
                    *entry = None;
                }
            }
        }

        if let Some(running) = slots[slot].as_ref().and_then(Weak::upgrade) {
            if !same_instance(&running, &claimant) {
                running.preempt();
            }
        }
        slots[slot] = Some(claimant);
        true
    }

    pub fn num_slots(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

fn same_instance(running: &Arc<dyn Preemptible>, claimant: &Weak<dyn Preemptible>) -> bool {
    match claimant.upgrade() {
        Some(claimant) => Arc::ptr_eq(running, &claimant),
        None => false,
    }
}
