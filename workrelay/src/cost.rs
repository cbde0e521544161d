//! Simulated per-worker workload.
//!
//! Every worker asks its [`Cost`] how much memory to hold and how long to wait
//! before answering. The default [`LinearCost`] scales both with the worker's
//! slot index so that higher slots are heavier and slower.

use std::time::Duration;

use crate::{Pid, MIB};

/// Resources a single task costs a worker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Workload {
    /// Bytes held while the response is being built.
    pub allocation: usize,
    /// Time spent before the response is emitted.
    pub delay: Duration,
}

pub trait Cost: Send + Sync {
    fn cost(&self, pid: Pid) -> Workload;
}

impl<F> Cost for F
where
    F: Fn(Pid) -> Workload + Send + Sync,
{
    fn cost(&self, pid: Pid) -> Workload {
        self(pid)
    }
}

/// Workload growing linearly with the worker index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearCost {
    pub bytes_per_index: usize,
    pub delay_per_index: Duration,
}

impl Default for LinearCost {
    fn default() -> Self {
        Self {
            bytes_per_index: MIB,
            delay_per_index: Duration::from_millis(100),
        }
    }
}

impl Cost for LinearCost {
    fn cost(&self, pid: Pid) -> Workload {
        let factor = u32::try_from(pid).unwrap_or(u32::MAX);

        Workload {
            allocation: self.bytes_per_index.saturating_mul(pid),
            delay: self.delay_per_index.saturating_mul(factor),
        }
    }
}

/// Free workload, every task completes immediately without allocating.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ZeroCost;

impl Cost for ZeroCost {
    fn cost(&self, _pid: Pid) -> Workload {
        Workload::default()
    }
}
