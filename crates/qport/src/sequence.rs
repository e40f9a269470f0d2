use alloc::vec::Vec;

use crate::error::{Error, ErrorKind, Result};

/// Maximum number of steps of a sequence.
pub const MAX_STEPS: usize = 256;

/// The outcome of polling a [`Sequence`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SequenceEvent {
    /// A step is due: the port must take the value.
    Fire(f64),
    /// The last step elapsed and no repetition is left.
    Finished,
}

/// A running output sequence.
///
/// Each step sets a value and holds it for its delay. After the delay of
/// the last step the whole list runs again while repetitions are left.
#[derive(Debug, Clone, PartialEq)]
pub struct Sequence {
    values: Vec<f64>,
    delays: Vec<u32>,
    pos: usize,
    repeat: u32,
    next_fire: u64,
}

impl Sequence {
    /// Creates a [`Sequence`] whose first step is due at `now_ms`.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::InvalidSequence`] if the lists are empty,
    /// have different lengths, exceed [`MAX_STEPS`], or never advance the
    /// clock while repeating.
    pub fn new(values: Vec<f64>, delays: Vec<u32>, repeat: u32, now_ms: u64) -> Result<Self> {
        if values.is_empty() || values.len() != delays.len() {
            return Err(Error::new(
                ErrorKind::InvalidSequence,
                alloc::format!(
                    "{} values and {} delays, expected the same non-zero count",
                    values.len(),
                    delays.len()
                ),
            ));
        }

        if values.len() > MAX_STEPS {
            return Err(Error::new(
                ErrorKind::InvalidSequence,
                alloc::format!("more than {MAX_STEPS} steps"),
            ));
        }

        if repeat > 0 && delays.iter().all(|delay| *delay == 0) {
            return Err(Error::new(
                ErrorKind::InvalidSequence,
                "a repeating sequence needs a non-zero delay",
            ));
        }

        Ok(Self {
            values,
            delays,
            pos: 0,
            repeat,
            next_fire: now_ms,
        })
    }

    /// Returns the time at which the sequence next needs to be polled.
    #[must_use]
    pub const fn next_fire(&self) -> u64 {
        self.next_fire
    }

    /// Returns the number of repetitions left.
    #[must_use]
    pub const fn repeat(&self) -> u32 {
        self.repeat
    }

    /// Advances the sequence.
    ///
    /// Returns `None` while the current step is being held. Steps are
    /// scheduled from the previous due time rather than from `now_ms`, so
    /// a late poll does not shift the following steps.
    pub fn poll(&mut self, now_ms: u64) -> Option<SequenceEvent> {
        if now_ms < self.next_fire {
            return None;
        }

        if self.pos == self.values.len() {
            if self.repeat == 0 {
                return Some(SequenceEvent::Finished);
            }
            self.repeat -= 1;
            self.pos = 0;
        }

        let value = self.values[self.pos];
        self.next_fire += u64::from(self.delays[self.pos]);
        self.pos += 1;

        Some(SequenceEvent::Fire(value))
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;

    use crate::error::ErrorKind;

    use super::{Sequence, SequenceEvent};

    // Polls every millisecond and records the fired values with their time.
    fn run(mut sequence: Sequence, until: u64) -> (Vec<(u64, f64)>, Option<u64>) {
        let mut fired = Vec::new();
        for now in 0..=until {
            while let Some(event) = sequence.poll(now) {
                match event {
                    SequenceEvent::Fire(value) => fired.push((now, value)),
                    SequenceEvent::Finished => return (fired, Some(now)),
                }
            }
        }
        (fired, None)
    }

    #[test]
    fn test_repeat_once() {
        let sequence = Sequence::new(vec![1., 2., 3.], vec![100, 200, 300], 1, 0).unwrap();
        let (fired, finished) = run(sequence, 2000);

        assert_eq!(
            fired,
            vec![
                (0, 1.),
                (100, 2.),
                (300, 3.),
                (600, 1.),
                (700, 2.),
                (900, 3.),
            ]
        );
        assert_eq!(finished, Some(1200));
    }

    #[test]
    fn test_run_once() {
        let sequence = Sequence::new(vec![5.], vec![50], 0, 10).unwrap();
        let (fired, finished) = run(sequence, 100);

        assert_eq!(fired, vec![(10, 5.)]);
        assert_eq!(finished, Some(60));
    }

    #[test]
    fn test_late_poll_keeps_schedule() {
        let mut sequence = Sequence::new(vec![1., 0.], vec![100, 100], 0, 0).unwrap();
        assert_eq!(sequence.poll(0), Some(SequenceEvent::Fire(1.)));
        // Polled late: the missed step fires at once and the schedule holds.
        assert_eq!(sequence.poll(150), Some(SequenceEvent::Fire(0.)));
        assert_eq!(sequence.next_fire(), 200);
        assert_eq!(sequence.poll(199), None);
        assert_eq!(sequence.poll(200), Some(SequenceEvent::Finished));
    }

    #[test]
    fn test_invalid() {
        for (values, delays, repeat) in [
            (vec![], vec![], 0),
            (vec![1., 2.], vec![100], 0),
            (vec![1., 2.], vec![0, 0], 3),
        ] {
            let err = Sequence::new(values, delays, repeat, 0).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidSequence);
        }
    }
}
