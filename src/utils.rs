// Copyright 2025 The videohal Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Small helpers shared by the rest of the crate.

use std::sync::OnceLock;
use std::time::Instant;

/// Rounds `v` up to the next multiple of `to`, which must be a power of two.
pub fn align_up(v: usize, to: usize) -> usize {
    ((v + to - 1) / to) * to
}

/// Returns true if the environment variable `name` is set to anything other
/// than an empty string or `"0"`.
pub fn env_is_set(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) => !value.is_empty() && value != "0",
        Err(_) => false,
    }
}

/// Microseconds elapsed on a process-wide monotonic clock.
///
/// Frame timestamps produced by the software backends come from this clock,
/// so consecutive frames of one capture session are strictly ordered.
pub fn monotonic_timestamp_us() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_powers_of_two() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(127, 128), 128);
        assert_eq!(align_up(129, 128), 256);
    }

    #[test]
    fn monotonic_timestamps_increase() {
        let a = monotonic_timestamp_us();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = monotonic_timestamp_us();
        assert!(b > a);
    }
}
