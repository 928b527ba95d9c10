//! # cancellable_loops
//!
//! A small utility crate for cooperative cancellation of long-running loops.
//!
//! Cancellation is always cooperative: a [`CancellationToken`] can be cancelled from any
//! thread (or from inside the loop body), but the loop only observes it between items.
//! An item that has started is always run to completion.
//!
//! ## Example
//!
//! ```
//! use cancellable_loops::{try_for_each_cancellable, CancellationToken, LoopExit};
//! use std::ops::ControlFlow;
//!
//! let token = CancellationToken::new();
//! let mut visited = Vec::new();
//!
//! let exit = try_for_each_cancellable(0..100, &token, |i| {
//!     visited.push(i);
//!     if i == 4 {
//!         token.cancel();
//!     }
//!     Ok::<_, ()>(ControlFlow::<()>::Continue(()))
//! })
//! .unwrap();
//!
//! assert_eq!(exit, LoopExit::Cancelled { completed: 5 });
//! assert_eq!(visited, vec![0, 1, 2, 3, 4]);
//! ```

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A cloneable, thread-safe cancellation flag.
///
/// All clones share the same flag, so a clone handed to another thread (or captured by a
/// callback) can stop a loop owned by someone else.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token in the "not cancelled" state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Loops observe the request at their next item boundary.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Returns `true` if cancellation has been requested and not yet reset.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Clears a pending cancellation and reports whether one was pending.
    pub fn reset(&self) -> bool {
        self.flag.swap(false, Ordering::Relaxed)
    }
}

/// Why a cancellable loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit<B = ()> {
    /// Every item was processed.
    Completed { completed: usize },
    /// The token was cancelled; `completed` items had finished.
    Cancelled { completed: usize },
    /// The loop body asked to stop after `completed` items.
    Stopped { completed: usize, reason: B },
}

impl<B> LoopExit<B> {
    /// Number of loop bodies that ran to completion.
    pub fn completed(&self) -> usize {
        match self {
            LoopExit::Completed { completed }
            | LoopExit::Cancelled { completed }
            | LoopExit::Stopped { completed, .. } => *completed,
        }
    }
}

/// Executes a fallible sequential loop that honours a [`CancellationToken`].
///
/// The token is checked before every item. The body may stop the loop itself by returning
/// `ControlFlow::Break(reason)`, or fail it by returning an error, which is propagated
/// unchanged. The token is never reset here; that is left to the owner of the loop.
pub fn try_for_each_cancellable<I, T, B, E, F>(
    iter: I,
    token: &CancellationToken,
    mut func: F,
) -> Result<LoopExit<B>, E>
where
    I: IntoIterator<Item = T>,
    F: FnMut(T) -> Result<ControlFlow<B>, E>,
{
    let mut completed = 0;
    for item in iter {
        if token.is_cancelled() {
            return Ok(LoopExit::Cancelled { completed });
        }
        let flow = func(item)?;
        completed += 1;
        if let ControlFlow::Break(reason) = flow {
            return Ok(LoopExit::Stopped { completed, reason });
        }
    }
    Ok(LoopExit::Completed { completed })
}
