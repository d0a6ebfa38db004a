// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-task runtime context.
//!
//! Every computation receives a `Cx`: the runtime handle it runs on, the
//! abort cell its suspension points consult, and (in pinned mode) the
//! worker it is bound to. There is no ambient lookup; operations that
//! need the runtime take the context explicitly.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::cancel::AbortCell;
use crate::error::Cancelled;
use crate::runtime::Handle;

/// How tasks are placed on worker threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextMode {
    /// Any worker may run any task; idle workers steal.
    #[default]
    Shared,
    /// Each root task is assigned a home worker and its children stay there.
    Pinned,
}

impl FromStr for ContextMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shared" => Ok(ContextMode::Shared),
            "pinned" => Ok(ContextMode::Pinned),
            other => Err(format!("expected `shared` or `pinned`, got `{}`", other)),
        }
    }
}

impl fmt::Display for ContextMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextMode::Shared => f.write_str("shared"),
            ContextMode::Pinned => f.write_str("pinned"),
        }
    }
}

#[derive(Clone)]
pub struct Cx {
    handle: Handle,
    abort: Arc<AbortCell>,
    home: Option<usize>,
}

impl Cx {
    pub(crate) fn new(handle: Handle, abort: Arc<AbortCell>, home: Option<usize>) -> Self {
        Self {
            handle,
            abort,
            home,
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Worker this task is pinned to, if any.
    pub fn home(&self) -> Option<usize> {
        self.home
    }

    /// Microseconds on the runtime clock.
    pub fn now(&self) -> u64 {
        self.handle.clock().now()
    }

    /// Consume a pending abort, if one was delivered.
    pub(crate) fn take_abort(&self) -> bool {
        self.abort.take()
    }

    /// Suspension-point check: `Err(Cancelled)` if an abort is pending.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.abort.take() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    pub(crate) fn abort_cell(&self) -> &Arc<AbortCell> {
        &self.abort
    }
}

impl fmt::Debug for Cx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cx")
            .field("home", &self.home)
            .field("abort_pending", &self.abort.is_pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_modes() {
        assert_eq!("shared".parse::<ContextMode>(), Ok(ContextMode::Shared));
        assert_eq!(" Pinned ".parse::<ContextMode>(), Ok(ContextMode::Pinned));
        assert!("threaded".parse::<ContextMode>().is_err());
        assert_eq!(ContextMode::Pinned.to_string(), "pinned");
    }
}
