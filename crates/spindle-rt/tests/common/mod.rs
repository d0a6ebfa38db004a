// SPDX-License-Identifier: (MIT OR Apache-2.0)
#![allow(dead_code)]

use std::sync::Once;

use spindle_rt::{run, ContextMode, Result, RuntimeConfig, Task};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Route runtime logs to the test harness. Filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn config() -> RuntimeConfig {
    RuntimeConfig::new().with_threads(4)
}

/// Run `task` on a fresh runtime in both context modes.
pub fn run_both<T, F>(make: F) -> Vec<Result<T>>
where
    T: Send + 'static,
    F: Fn() -> Task<T>,
{
    init_tracing();
    [ContextMode::Shared, ContextMode::Pinned]
        .into_iter()
        .map(|mode| run(make(), config().with_context(mode)))
        .collect()
}

pub fn run_task<T: Send + 'static>(task: Task<T>) -> Result<T> {
    init_tracing();
    run(task, config())
}
