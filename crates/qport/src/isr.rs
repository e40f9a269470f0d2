//! State shared between interrupt handlers and the main loop.
//!
//! Interrupt handlers are the only producers and the main loop is the only
//! consumer. Every access runs inside a [`critical_section`], so a reset
//! never loses a concurrent increment.

use core::cell::Cell;

use critical_section::Mutex;

/// A counter incremented from an interrupt handler.
#[derive(Debug)]
pub struct IsrCounter(Mutex<Cell<u32>>);

impl Default for IsrCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl IsrCounter {
    /// Creates an [`IsrCounter`] starting from zero.
    #[must_use]
    pub const fn new() -> Self {
        Self(Mutex::new(Cell::new(0)))
    }

    /// Increments the counter, wrapping on overflow.
    pub fn increment(&self) {
        critical_section::with(|cs| {
            let count = self.0.borrow(cs);
            count.set(count.get().wrapping_add(1));
        });
    }

    /// Returns the current count.
    #[must_use]
    pub fn get(&self) -> u32 {
        critical_section::with(|cs| self.0.borrow(cs).get())
    }

    /// Returns the current count and resets it to zero.
    pub fn take(&self) -> u32 {
        critical_section::with(|cs| self.0.borrow(cs).replace(0))
    }
}
