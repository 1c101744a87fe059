//! Runtime configuration and the service/target option model.
//!
//! [`RuntimeConfig`] tunes the worker fleet (thread count, io driver,
//! cpu affinity). [`ServiceOptions`] and [`TargetOptions`] describe a routed
//! service and its upstream endpoints; they travel over the admin socket,
//! through deployment commands, and into the state snapshot, so everything
//! here is serde-encodable.
use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

mod options;
pub use options::{
    host_matches_pattern, HealthCheckConfig, ServiceOptions, TargetOptions, ROOT_PATH_PREFIX,
};

// Default iouring/epoll entries: 32k
const DEFAULT_ENTRIES: u32 = 32768;

pub const FALLBACK_PARALLELISM: NonZeroUsize = unsafe { NonZeroUsize::new_unchecked(1) };

/// Configuration options for the worker runtime environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of worker threads, each running its own io driver and a full
    /// copy of the traffic plane.
    #[serde(default = "default_workers")]
    pub worker_threads: usize,

    /// Number of I/O entries for event handling for io_uring.
    #[serde(default = "default_entries")]
    pub entries: u32,

    /// The type of io driver to use.
    #[serde(default)]
    pub runtime_type: RuntimeType,

    /// Whether to bind worker threads to cpu cores.
    #[serde(default = "default_cpu_affinity")]
    pub cpu_affinity: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: default_workers(),
            entries: default_entries(),
            runtime_type: Default::default(),
            cpu_affinity: default_cpu_affinity(),
        }
    }
}

/// Io driver selection: io_uring on Linux, epoll/kqueue elsewhere.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    #[cfg(target_os = "linux")]
    IoUring,
    Legacy,
}

impl Default for RuntimeType {
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        Self::IoUring
    }
    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        Self::Legacy
    }
}

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .unwrap_or(FALLBACK_PARALLELISM)
        .into()
}

define_const!(default_entries, DEFAULT_ENTRIES, u32);
define_const!(default_cpu_affinity, false, bool);
