use std::future::Future;

#[cfg(target_os = "linux")]
use monoio::IoUringDriver;
use monoio::{time::TimeDriver, LegacyDriver, Runtime, RuntimeBuilder};

use crate::config::{RuntimeConfig, RuntimeType};

/// One worker's runtime, constructed on the worker thread itself. The timer
/// is always enabled: pause expiry, drain deadlines and health intervals all
/// live on it.
pub enum RuntimeWrapper {
    #[cfg(target_os = "linux")]
    IoUring(Runtime<TimeDriver<IoUringDriver>>),
    Legacy(Runtime<TimeDriver<LegacyDriver>>),
}

impl From<&RuntimeConfig> for RuntimeWrapper {
    fn from(config: &RuntimeConfig) -> Self {
        match config.runtime_type {
            #[cfg(target_os = "linux")]
            RuntimeType::IoUring => {
                let runtime = RuntimeBuilder::<IoUringDriver>::new()
                    .enable_timer()
                    .with_entries(config.entries)
                    .build()
                    .expect("build io_uring runtime");
                RuntimeWrapper::IoUring(runtime)
            }
            RuntimeType::Legacy => {
                let runtime = RuntimeBuilder::<LegacyDriver>::new()
                    .enable_timer()
                    .with_entries(config.entries)
                    .build()
                    .expect("build legacy runtime");
                RuntimeWrapper::Legacy(runtime)
            }
        }
    }
}

impl RuntimeWrapper {
    pub fn block_on<F: Future>(&mut self, future: F) -> F::Output {
        match self {
            #[cfg(target_os = "linux")]
            RuntimeWrapper::IoUring(rt) => rt.block_on(future),
            RuntimeWrapper::Legacy(rt) => rt.block_on(future),
        }
    }
}
