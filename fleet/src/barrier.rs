//! Distributed control barrier.
//!
//! A single monotonically increasing arrival counter lives in remote memory.
//! Each participant keeps the counter value at which its current phase
//! releases; arriving adds one to the counter and polls until the counter
//! reaches that value. Phases never share a release point, so the counter is
//! never reset.
//!
//! Every participant must arrive exactly once per phase with the same target.
//! An extra arrival releases the next phase early; the arrival that finds the
//! counter already past its release point reports [`Error::BarrierOverrun`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

const SPIN_LIMIT: u32 = 128;

/// Named barrier phases of an experiment, in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Every thread is connected.
    Connected,
    /// Every region is allocated and published in the root table.
    Allocated,
    /// The workload has finished on every thread.
    Ran,
    /// Every thread has written its metrics report.
    Reported,
    /// Barriers past the fourth, numbered from zero.
    Extra(u32),
}

impl Phase {
    pub fn from_index(index: u32) -> Self {
        match index {
            0 => Phase::Connected,
            1 => Phase::Allocated,
            2 => Phase::Ran,
            3 => Phase::Reported,
            n => Phase::Extra(n),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Connected => write!(f, "phase 1 (post-connect)"),
            Phase::Allocated => write!(f, "phase 2 (post-allocation)"),
            Phase::Ran => write!(f, "phase 3 (post-run)"),
            Phase::Reported => write!(f, "phase 4 (post-report)"),
            Phase::Extra(n) => write!(f, "phase {}", n + 1),
        }
    }
}

/// What to do when a participant never arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BarrierWait {
    /// Block until released, however long that takes.
    #[default]
    Forever,
    /// Give up with [`Error::BarrierTimeout`] after the given duration.
    Timeout(Duration),
}

/// A shared counter that every participant can increment and observe.
pub trait BarrierCounter {
    /// Add `delta` and return the previous value.
    fn fetch_add(&self, delta: u64) -> Result<u64>;
    fn load(&self) -> Result<u64>;
}

impl BarrierCounter for AtomicU64 {
    #[inline]
    fn fetch_add(&self, delta: u64) -> Result<u64> {
        Ok(AtomicU64::fetch_add(self, delta, Ordering::AcqRel))
    }

    #[inline]
    fn load(&self) -> Result<u64> {
        Ok(AtomicU64::load(self, Ordering::Acquire))
    }
}

impl<C: BarrierCounter + ?Sized> BarrierCounter for Arc<C> {
    #[inline]
    fn fetch_add(&self, delta: u64) -> Result<u64> {
        (**self).fetch_add(delta)
    }

    #[inline]
    fn load(&self) -> Result<u64> {
        (**self).load()
    }
}

/// One participant's view of the control barrier.
pub struct ControlBarrier<C> {
    counter: C,
    released_at: u64,
    phase: u32,
    wait: BarrierWait,
}

impl<C: BarrierCounter> ControlBarrier<C> {
    pub fn new(counter: C, wait: BarrierWait) -> Self {
        Self {
            counter,
            released_at: 0,
            phase: 0,
            wait,
        }
    }

    /// Phase the next arrival belongs to.
    #[inline]
    pub fn phase(&self) -> Phase {
        Phase::from_index(self.phase)
    }

    /// Arrive and block until `total_expected` arrivals for this phase are observed.
    ///
    /// Returns the phase that was released.
    pub fn arrive(&mut self, total_expected: u64) -> Result<Phase> {
        let phase = self.phase();
        let start = self.released_at;
        let release = start + total_expected;

        let prev = self.counter.fetch_add(1)?;
        if prev >= release {
            return Err(Error::BarrierOverrun {
                phase,
                observed: prev + 1,
                released_at: release,
            });
        }

        let begin = Instant::now();
        let mut spins = 0u32;
        loop {
            let seen = self.counter.load()?;
            if seen >= release {
                break;
            }
            if let BarrierWait::Timeout(limit) = self.wait {
                let waited = begin.elapsed();
                if waited >= limit {
                    return Err(Error::BarrierTimeout {
                        phase,
                        arrived: seen - start,
                        expected: total_expected,
                        waited,
                    });
                }
            }
            if spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }

        self.released_at = release;
        self.phase += 1;
        Ok(phase)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use super::*;

    #[test]
    fn test_all_participants_released_together() {
        let n = 6usize;
        let phases = 4u32;
        let counter = Arc::new(AtomicU64::new(0));
        let arrived: Arc<Vec<AtomicUsize>> =
            Arc::new((0..phases).map(|_| AtomicUsize::new(0)).collect());

        let handles: Vec<_> = (0..n)
            .map(|_| {
                let counter = counter.clone();
                let arrived = arrived.clone();
                thread::spawn(move || {
                    let mut barrier = ControlBarrier::new(counter, BarrierWait::Forever);
                    for p in 0..phases {
                        arrived[p as usize].fetch_add(1, Ordering::SeqCst);
                        let released = barrier.arrive(n as u64).unwrap();
                        assert_eq!(released, Phase::from_index(p));
                        // Nobody leaves before everyone arrived.
                        assert_eq!(arrived[p as usize].load(Ordering::SeqCst), n);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(
            AtomicU64::load(&counter, Ordering::SeqCst),
            n as u64 * phases as u64
        );
    }

    #[test]
    fn test_single_participant() {
        let mut barrier = ControlBarrier::new(AtomicU64::new(0), BarrierWait::Forever);
        assert_eq!(barrier.arrive(1).unwrap(), Phase::Connected);
        assert_eq!(barrier.arrive(1).unwrap(), Phase::Allocated);
        assert_eq!(barrier.phase(), Phase::Ran);
    }

    #[test]
    fn test_timeout_reports_missing_arrivals() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut barrier = ControlBarrier::new(
            counter,
            BarrierWait::Timeout(Duration::from_millis(20)),
        );
        match barrier.arrive(3) {
            Err(Error::BarrierTimeout {
                phase,
                arrived,
                expected,
                waited,
            }) => {
                assert_eq!(phase, Phase::Connected);
                assert_eq!(arrived, 1);
                assert_eq!(expected, 3);
                assert!(waited >= Duration::from_millis(20));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_extra_arrival_is_overrun() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut a = ControlBarrier::new(counter.clone(), BarrierWait::Forever);
        a.arrive(1).unwrap();

        // A second participant arriving at an already released phase.
        let mut late = ControlBarrier::new(counter, BarrierWait::Forever);
        match late.arrive(1) {
            Err(Error::BarrierOverrun {
                phase,
                observed,
                released_at,
            }) => {
                assert_eq!(phase, Phase::Connected);
                assert_eq!(observed, 2);
                assert_eq!(released_at, 1);
            }
            other => panic!("expected overrun, got {other:?}"),
        }
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::from_index(3), Phase::Reported);
        assert_eq!(Phase::from_index(5).to_string(), "phase 6");
        assert_eq!(Phase::Allocated.to_string(), "phase 2 (post-allocation)");
    }
}
