//! Latency metrics and their reduction.
//!
//! One [`Metrics`] per worker thread. Merging is associative and
//! commutative, so per-machine and global totals do not depend on the
//! order in which threads or machines finish.

use std::fmt;
use std::ops::AddAssign;
use std::time::Duration;

/// Number of log2 latency buckets.
pub const BUCKETS: usize = 64;

const HEADER_WORDS: usize = 5;

/// Words one encoded [`Metrics`] occupies in remote memory.
pub const METRICS_WORDS: u64 = (HEADER_WORDS + BUCKETS) as u64;

/// Latency accumulator.
///
/// Bucket `k` counts latencies in `[2^(k-1), 2^k)` ns; bucket 0 counts zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metrics {
    pub count: u64,
    pub sum_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    /// Longest wall time of any merged run.
    pub elapsed_ns: u64,
    pub buckets: [u64; BUCKETS],
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            count: 0,
            sum_ns: 0,
            min_ns: u64::MAX,
            max_ns: 0,
            elapsed_ns: 0,
            buckets: [0; BUCKETS],
        }
    }
}

#[inline]
fn bucket_of(ns: u64) -> usize {
    ((u64::BITS - ns.leading_zeros()) as usize).min(BUCKETS - 1)
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record(&mut self, latency: Duration) {
        self.record_ns(latency.as_nanos().min(u64::MAX as u128) as u64);
    }

    #[inline]
    pub fn record_ns(&mut self, ns: u64) {
        self.count += 1;
        self.sum_ns = self.sum_ns.wrapping_add(ns);
        self.min_ns = self.min_ns.min(ns);
        self.max_ns = self.max_ns.max(ns);
        self.buckets[bucket_of(ns)] += 1;
    }

    pub fn set_elapsed(&mut self, elapsed: Duration) {
        self.elapsed_ns = elapsed.as_nanos().min(u64::MAX as u128) as u64;
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Upper bound of the bucket holding the `q` quantile, capped at the observed max.
    pub fn percentile_ns(&self, q: f64) -> u64 {
        if self.count == 0 {
            return 0;
        }
        let rank = ((q.clamp(0.0, 1.0) * self.count as f64).ceil() as u64).max(1);
        let mut seen = 0u64;
        for (k, &n) in self.buckets.iter().enumerate() {
            seen += n;
            if seen >= rank {
                let upper = if k == 0 { 0 } else { (1u64 << k) - 1 };
                return upper.min(self.max_ns).max(self.min_ns);
            }
        }
        self.max_ns
    }

    pub fn to_words(&self) -> [u64; METRICS_WORDS as usize] {
        let mut words = [0u64; METRICS_WORDS as usize];
        words[..HEADER_WORDS].copy_from_slice(&[
            self.count,
            self.sum_ns,
            self.min_ns,
            self.max_ns,
            self.elapsed_ns,
        ]);
        words[HEADER_WORDS..].copy_from_slice(&self.buckets);
        words
    }

    /// Decode a report written by [`Metrics::to_words`].
    pub fn from_words(words: &[u64; METRICS_WORDS as usize]) -> Self {
        let mut buckets = [0u64; BUCKETS];
        buckets.copy_from_slice(&words[HEADER_WORDS..]);
        Self {
            count: words[0],
            sum_ns: words[1],
            min_ns: words[2],
            max_ns: words[3],
            elapsed_ns: words[4],
            buckets,
        }
    }
}

impl AddAssign<&Metrics> for Metrics {
    fn add_assign(&mut self, rhs: &Metrics) {
        self.count += rhs.count;
        self.sum_ns = self.sum_ns.wrapping_add(rhs.sum_ns);
        self.min_ns = self.min_ns.min(rhs.min_ns);
        self.max_ns = self.max_ns.max(rhs.max_ns);
        self.elapsed_ns = self.elapsed_ns.max(rhs.elapsed_ns);
        for (a, b) in self.buckets.iter_mut().zip(rhs.buckets.iter()) {
            *a += b;
        }
    }
}

impl AddAssign for Metrics {
    fn add_assign(&mut self, rhs: Metrics) {
        *self += &rhs;
    }
}

impl<'a> std::iter::Sum<&'a Metrics> for Metrics {
    fn sum<I: Iterator<Item = &'a Metrics>>(iter: I) -> Self {
        iter.fold(Metrics::default(), |mut acc, m| {
            acc += m;
            acc
        })
    }
}

/// Per-machine collection of worker metrics, indexed by local thread id.
///
/// Pre-sized; each worker fills only its own slot.
#[derive(Debug, Clone, Default)]
pub struct MachineMetrics {
    slots: Vec<Option<Metrics>>,
}

impl MachineMetrics {
    pub fn new(threads: usize) -> Self {
        Self {
            slots: vec![None; threads],
        }
    }

    pub fn slots_mut(&mut self) -> std::slice::IterMut<'_, Option<Metrics>> {
        self.slots.iter_mut()
    }

    pub fn get(&self, local_index: usize) -> Option<&Metrics> {
        self.slots.get(local_index)?.as_ref()
    }

    /// Number of workers that stored metrics.
    pub fn filled(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn total(&self) -> Metrics {
        self.slots.iter().flatten().sum()
    }
}

/// Summary derived from a merged [`Metrics`].
#[derive(Debug, Clone, PartialEq)]
pub struct Results {
    pub ops: u64,
    pub mean_ns: f64,
    pub min_ns: u64,
    pub p50_ns: u64,
    pub p90_ns: u64,
    pub p99_ns: u64,
    pub p999_ns: u64,
    pub max_ns: u64,
    pub elapsed_ns: u64,
    /// Operations per second over the longest run.
    pub throughput: f64,
}

impl Results {
    pub fn calc(m: &Metrics) -> Self {
        let mean_ns = if m.count > 0 {
            m.sum_ns as f64 / m.count as f64
        } else {
            0.0
        };
        let throughput = if m.elapsed_ns > 0 {
            m.count as f64 / (m.elapsed_ns as f64 / 1_000_000_000.0)
        } else {
            0.0
        };
        Self {
            ops: m.count,
            mean_ns,
            min_ns: if m.count > 0 { m.min_ns } else { 0 },
            p50_ns: m.percentile_ns(0.50),
            p90_ns: m.percentile_ns(0.90),
            p99_ns: m.percentile_ns(0.99),
            p999_ns: m.percentile_ns(0.999),
            max_ns: m.max_ns,
            elapsed_ns: m.elapsed_ns,
            throughput,
        }
    }
}

impl fmt::Display for Results {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  ops:        {}", self.ops)?;
        writeln!(f, "  throughput: {:.0} ops/s", self.throughput)?;
        writeln!(f, "  mean:       {:.1} ns", self.mean_ns)?;
        writeln!(f, "  min:        {} ns", self.min_ns)?;
        writeln!(f, "  p50:        <= {} ns", self.p50_ns)?;
        writeln!(f, "  p90:        <= {} ns", self.p90_ns)?;
        writeln!(f, "  p99:        <= {} ns", self.p99_ns)?;
        writeln!(f, "  p99.9:      <= {} ns", self.p999_ns)?;
        write!(f, "  max:        {} ns", self.max_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seed: u64, n: u64) -> Metrics {
        let mut m = Metrics::new();
        for i in 0..n {
            m.record_ns((seed * 7919 + i * 104_729) % 50_000);
        }
        m.set_elapsed(Duration::from_micros(seed * 10 + 1));
        m
    }

    #[test]
    fn test_bucket_boundaries() {
        assert_eq!(bucket_of(0), 0);
        assert_eq!(bucket_of(1), 1);
        assert_eq!(bucket_of(2), 2);
        assert_eq!(bucket_of(3), 2);
        assert_eq!(bucket_of(4), 3);
        assert_eq!(bucket_of(u64::MAX), BUCKETS - 1);
    }

    #[test]
    fn test_merge_associative_and_commutative() {
        let (a, b, c) = (sample(1, 100), sample(2, 37), sample(3, 250));

        let mut ab_c = a.clone();
        ab_c += &b;
        ab_c += &c;

        let mut bc = b.clone();
        bc += &c;
        let mut a_bc = a.clone();
        a_bc += &bc;

        let mut c_b_a = c.clone();
        c_b_a += &b;
        c_b_a += &a;

        assert_eq!(ab_c, a_bc);
        assert_eq!(ab_c, c_b_a);
        assert_eq!(ab_c.count, 387);
    }

    #[test]
    fn test_merge_with_empty_is_identity() {
        let a = sample(5, 10);
        let mut merged = Metrics::default();
        merged += &a;
        assert_eq!(merged, a);
    }

    #[test]
    fn test_machine_metrics_total() {
        let mut table = MachineMetrics::new(3);
        for (i, slot) in table.slots_mut().enumerate() {
            if i != 1 {
                *slot = Some(sample(i as u64, 10));
            }
        }
        assert_eq!(table.filled(), 2);
        assert!(table.get(1).is_none());
        assert_eq!(table.total().count, 20);
    }

    #[test]
    fn test_results() {
        let mut m = Metrics::new();
        for ns in [100, 200, 300, 400] {
            m.record_ns(ns);
        }
        m.set_elapsed(Duration::from_secs(2));
        let r = Results::calc(&m);
        assert_eq!(r.ops, 4);
        assert_eq!(r.mean_ns, 250.0);
        assert_eq!(r.min_ns, 100);
        assert_eq!(r.max_ns, 400);
        assert_eq!(r.throughput, 2.0);
        assert!(r.p50_ns >= 200 && r.p50_ns <= 255);
        assert_eq!(r.p999_ns, 400);
    }

    #[test]
    fn test_results_empty() {
        let r = Results::calc(&Metrics::default());
        assert_eq!(r.ops, 0);
        assert_eq!(r.min_ns, 0);
        assert_eq!(r.throughput, 0.0);
    }

    #[test]
    fn test_report_encoding() {
        let m = sample(9, 64);
        assert_eq!(Metrics::from_words(&m.to_words()), m);
    }
}
