// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative coroutine runtime.
//!
//! Tasks run on a pool of worker threads and suspend on [`Event`]s:
//! completion flags that the reactor, timers, other tasks or the blocking
//! pool set. On top of that sit structured spawn/join ([`spawn`], [`map`]),
//! blocking offload ([`spawn_blocking`]), deadlines ([`time::timeout`]),
//! readiness-driven sockets ([`net`]) and coordination primitives
//! ([`sync`]).
//!
//! Cancellation is cooperative: it is injected into a suspended task and
//! surfaces as `Err(Cancelled)` from its next suspension point.
//!
//! ```no_run
//! use spindle_rt::{run, spawn, RuntimeConfig, Task};
//!
//! let sum = run(
//!     Task::new(|cx| async move {
//!         let tasks = (0..4u32).map(|i| Task::new(move |_cx| async move { Ok(i * i) }));
//!         let squares = spawn(&cx, tasks).values(&cx).await?;
//!         Ok(squares.into_iter().sum::<u32>())
//!     }),
//!     RuntimeConfig::default(),
//! )
//! .unwrap();
//! assert_eq!(sum, 14);
//! ```

pub mod blocking;
pub mod cancel;
pub mod config;
pub mod context;
pub mod coroutine;
pub mod error;
pub mod event;
pub(crate) mod green;
pub mod net;
pub mod runtime;
pub mod spawn;
pub mod sync;
pub mod time;

pub use blocking::spawn_blocking;
pub use config::RuntimeConfig;
pub use context::{ContextMode, Cx};
pub use coroutine::{Generator, Resume, Step, Suspend, Task};
pub use error::{Cancelled, Error, GroupFailure, Result};
pub use event::{Event, Waiter};
pub use runtime::{run, Handle, Runtime, TaskRef};
pub use spawn::{map, map_blocking, spawn, yield_now, Join, JoinResult};
pub use time::{sleep, timeout};
