//! Busy-wait helper.

use abyss::warning;

/// Iterations after which a wait is reported as suspiciously long.
pub const LONG_WAIT_SPINS: u64 = 1 << 28;

/// Spin until `done` returns true.
///
/// There is no timeout: the waits are for hardware completions or peer
/// processors that have no other way to signal failure. A single warning
/// naming `what` is printed once the wait has lasted [`LONG_WAIT_SPINS`]
/// iterations.
pub fn spin_until(what: &str, mut done: impl FnMut() -> bool) {
    let mut spins: u64 = 0;
    while !done() {
        spins += 1;
        if spins == LONG_WAIT_SPINS {
            warning!("Still waiting for {}", what);
        }
        core::hint::spin_loop();
    }
}
