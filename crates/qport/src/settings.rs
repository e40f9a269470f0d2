/// Default tick interval in milliseconds.
pub const DEFAULT_TICK_INTERVAL_MS: u32 = 20;

/// Default maximum depth of expression propagation.
pub const DEFAULT_MAX_PROPAGATION_DEPTH: u8 = 16;

/// Default delay before changed persisted values are saved.
pub const DEFAULT_SAVE_DELAY_MS: u32 = 5000;

/// Runtime tunables of a [`Device`](crate::Device).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub(crate) tick_interval_ms: u32,
    pub(crate) max_propagation_depth: u8,
    pub(crate) save_delay_ms: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

impl Settings {
    /// Creates [`Settings`] with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            max_propagation_depth: DEFAULT_MAX_PROPAGATION_DEPTH,
            save_delay_ms: DEFAULT_SAVE_DELAY_MS,
        }
    }

    /// Sets the interval (in milliseconds) at which the device expects to
    /// be ticked.
    ///
    /// Heartbeats shorter than this interval run once per tick.
    #[must_use]
    pub const fn tick_interval(mut self, interval_ms: u32) -> Self {
        self.tick_interval_ms = interval_ms;
        self
    }

    /// Sets how many expression levels a single change can traverse.
    #[must_use]
    pub const fn max_propagation_depth(mut self, depth: u8) -> Self {
        self.max_propagation_depth = depth;
        self
    }

    /// Sets the delay (in milliseconds) before a changed persisted value is
    /// written to the configuration store.
    #[must_use]
    pub const fn save_delay(mut self, delay_ms: u32) -> Self {
        self.save_delay_ms = delay_ms;
        self
    }

    /// Returns the tick interval in milliseconds.
    #[must_use]
    pub const fn tick_interval_ms(&self) -> u32 {
        self.tick_interval_ms
    }
}
