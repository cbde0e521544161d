//! Fixed-size worker pool that relays text payloads to workers in round-robin
//! order and fans every worker response back into a single observer.
//!
//! ```no_run
//! use workrelay::{LogObserver, PoolConfig, WorkerPool};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut pool = WorkerPool::new(PoolConfig::default().with_env("foo", "bar"));
//! let collector = pool.on_response(LogObserver)?;
//!
//! pool.dispatch("hello")?;
//!
//! pool.shutdown().await?;
//! collector.join().await;
//! # Ok(())
//! # }
//! ```

pub mod collector;
pub mod cost;
pub mod message;
pub mod pool;
pub mod selector;
mod worker;

pub use crate::{
    collector::{Collector, LogObserver, Observer},
    cost::{Cost, LinearCost, Workload, ZeroCost},
    message::{Message, ResponseRecord, WorkerFault, WorkerMessage},
    pool::{
        error::{DispatchError, PoolError},
        PoolConfig, WorkerPool, DEFAULT_POOL_SIZE,
    },
    selector::RoundRobin,
};

// NOTE(jdb): Workers are addressed by their slot in the pool. This follows
// Erlang's message format where every message carries the sender's Pid.
pub type Pid = usize;

/// Environment snapshot handed to every worker at creation time.
pub type Env = std::collections::BTreeMap<String, String>;

/// Number of bytes in a mebibyte, the unit memory metrics are reported in.
pub const MIB: usize = 1 << 20;
