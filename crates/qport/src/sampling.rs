use core::fmt::Debug;

/// Clock jitter accepted before a cached sample is considered stale.
pub const SAMPLING_TOLERANCE_MS: u64 = 10;

/// The last good reading of a slow hardware resource.
///
/// A new transaction is only performed once the cached reading is older
/// than the sampling interval. When a transaction fails, the stale reading
/// stays valid for up to twice the sampling interval since the last
/// success.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleCache<T: Copy> {
    value: Option<T>,
    last_success: u64,
}

impl<T: Copy> Default for SampleCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy> SampleCache<T> {
    /// Creates an empty [`SampleCache`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            value: None,
            last_success: 0,
        }
    }

    /// Returns the cached reading, refreshing it through `fetch` when it is
    /// older than `interval_ms`.
    ///
    /// Returns `None` when no reading is available within the grace window.
    pub fn get<E: Debug>(
        &mut self,
        now_ms: u64,
        interval_ms: u32,
        fetch: impl FnOnce() -> Result<T, E>,
    ) -> Option<T> {
        let interval = u64::from(interval_ms);
        let age = now_ms.saturating_sub(self.last_success);

        if let Some(value) = self.value {
            if age + SAMPLING_TOLERANCE_MS < interval {
                return Some(value);
            }
        }

        match fetch() {
            Ok(value) => {
                self.value = Some(value);
                self.last_success = now_ms;
                Some(value)
            }
            Err(e) => {
                log::debug!("Sample failed: {e:?}");
                if age >= 2 * interval {
                    self.value = None;
                }
                self.value
            }
        }
    }

    /// Returns the cached reading without refreshing it.
    #[must_use]
    pub const fn peek(&self) -> Option<T> {
        self.value
    }

    /// Drops the cached reading.
    pub fn invalidate(&mut self) {
        self.value = None;
    }
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;

    use super::SampleCache;

    #[test]
    fn test_cached_between_samples() {
        let fetches = Cell::new(0);
        let fetch = || {
            fetches.set(fetches.get() + 1);
            Ok::<_, ()>(fetches.get())
        };

        let mut cache = SampleCache::new();
        assert_eq!(cache.get(0, 1000, fetch), Some(1));
        assert_eq!(cache.get(500, 1000, fetch), Some(1));
        assert_eq!(cache.get(989, 1000, fetch), Some(1));
        // Within the tolerance of the interval.
        assert_eq!(cache.get(990, 1000, fetch), Some(2));
        assert_eq!(fetches.get(), 2);
    }

    #[test]
    fn test_grace_window() {
        let mut cache = SampleCache::new();
        assert_eq!(cache.get(0, 1000, || Ok::<_, ()>(5.)), Some(5.));

        assert_eq!(cache.get(1500, 1000, || Err(())), Some(5.));
        assert_eq!(cache.get(1999, 1000, || Err(())), Some(5.));
        assert_eq!(cache.get(2000, 1000, || Err(())), None);
        assert_eq!(cache.peek(), None);

        assert_eq!(cache.get(2100, 1000, || Ok::<_, ()>(7.)), Some(7.));
    }

    #[test]
    fn test_never_read() {
        let mut cache = SampleCache::<u16>::new();
        assert_eq!(cache.get(10, 1000, || Err("timeout")), None);
    }
}
