// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime error types.

use std::any::Any;
use std::fmt;
use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Result alias used throughout the runtime.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Returned by a suspension point when cancellation was injected into
/// the suspended computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Every failure collected by a group join, in spawn order.
#[derive(Debug)]
pub struct GroupFailure {
    pub errors: Vec<Error>,
}

impl fmt::Display for GroupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task(s) failed", self.errors.len())?;
        for err in &self.errors {
            write!(f, "; {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for GroupFailure {}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error("task group failed: {0}")]
    Group(GroupFailure),

    /// A callable run on the blocking pool panicked.
    #[error("blocking task failed: {0}")]
    BlockingTask(String),

    #[error("task panicked: {0}")]
    Panicked(String),

    /// A non-waiting acquire found nothing available.
    #[error("operation would block")]
    WouldBlock,

    #[error("channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

/// Render a panic payload the way `std` prints it.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
