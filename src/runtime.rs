// runtime.rs — Kernel-runtime capability: command queues and dispatch stats.
//
// The stitching core submits named kernels over a 2D index space and later
// waits for them with `finish()`. This reference runtime executes each
// kernel body inline on the submitting thread, so `finish()` has nothing to
// wait for, but it keeps the same contract:
//
//   - one `CommandQueue` per worker thread, never shared;
//   - kernels run in submission order on their queue;
//   - an empty index space is a malformed launch and is fatal.
//
// Every launch is counted by kernel name. Callers use the counts to observe
// which code path ran (for example, whether temporal regularization was
// dispatched for a frame).

use std::collections::BTreeMap;

use tracing::trace;

/// Per-kernel dispatch counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    launches: BTreeMap<&'static str, u64>,
    finishes: u64,
}

impl DispatchStats {
    /// Number of launches of `kernel`.
    pub fn count(&self, kernel: &str) -> u64 {
        self.launches.get(kernel).copied().unwrap_or(0)
    }

    /// Total launches across all kernels.
    pub fn total_launches(&self) -> u64 {
        self.launches.values().sum()
    }

    /// Number of `finish()` calls.
    pub fn finishes(&self) -> u64 {
        self.finishes
    }

    pub fn is_empty(&self) -> bool {
        self.launches.is_empty() && self.finishes == 0
    }

    /// Iterate `(kernel, count)` in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.launches.iter().map(|(&k, &v)| (k, v))
    }

    /// Add another set of counts into this one.
    pub fn merge(&mut self, other: &DispatchStats) {
        for (k, v) in other.iter() {
            *self.launches.entry(k).or_insert(0) += v;
        }
        self.finishes += other.finishes;
    }
}

/// An in-order queue of kernel launches, owned by one thread.
#[derive(Debug, Default)]
pub struct CommandQueue {
    stats: DispatchStats,
    in_flight: u64,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch `kernel` over a `global_size[0] × global_size[1]` index space.
    ///
    /// # Panics
    /// Panics if either dimension of the index space is zero. Launch
    /// failures are not recoverable.
    pub fn launch<R>(
        &mut self,
        kernel: &'static str,
        global_size: [usize; 2],
        body: impl FnOnce() -> R,
    ) -> R {
        assert!(
            global_size[0] > 0 && global_size[1] > 0,
            "kernel `{kernel}` launched over an empty index space {global_size:?}",
        );
        trace!(kernel, width = global_size[0], height = global_size[1], "launch");
        *self.stats.launches.entry(kernel).or_insert(0) += 1;
        self.in_flight += 1;
        body()
    }

    /// Block until every launched kernel has completed.
    pub fn finish(&mut self) {
        trace!(in_flight = self.in_flight, "finish");
        self.in_flight = 0;
        self.stats.finishes += 1;
    }

    /// Kernels submitted since the last `finish()`.
    pub fn in_flight(&self) -> u64 {
        self.in_flight
    }

    /// Counts accumulated so far, without resetting them.
    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Take the accumulated counts, leaving the queue's counters at zero.
    pub fn take_stats(&mut self) -> DispatchStats {
        std::mem::take(&mut self.stats)
    }
}
