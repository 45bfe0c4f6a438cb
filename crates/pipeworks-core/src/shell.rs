//! The boundary to an external shell executor.
//!
//! The simulation never blocks on the shell. Every asynchronous operation
//! returns a [`Pending`] handle backed by a `std::sync::mpsc` channel, which
//! the command bridge polls once per frame with `try_recv`.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::task::Poll;

/// Errors raised by a shell executor or session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShellError {
    #[error("no shell executor is installed")]
    Unavailable,
    #[error("failed to start a shell in {cwd}: {reason}")]
    Spawn { cwd: String, reason: String },
    #[error("write to shell failed: {0}")]
    Write(String),
    #[error("read from shell failed: {0}")]
    Read(String),
    #[error("shell session closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Pending results
// ---------------------------------------------------------------------------

/// The receiving half of a one-shot asynchronous result.
pub struct Pending<T> {
    rx: Receiver<Result<T, ShellError>>,
}

/// The sending half of a [`Pending`]. Dropping it unresolved makes the
/// pending side report [`ShellError::Closed`].
pub struct Resolver<T> {
    tx: Sender<Result<T, ShellError>>,
}

impl<T> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Pending(..)")
    }
}

impl<T> std::fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Resolver(..)")
    }
}

impl<T> Pending<T> {
    /// A connected resolver/pending pair.
    pub fn channel() -> (Resolver<T>, Pending<T>) {
        let (tx, rx) = mpsc::channel();
        (Resolver { tx }, Pending { rx })
    }

    /// A pending handle that is already resolved.
    pub fn ready(result: Result<T, ShellError>) -> Self {
        let (resolver, pending) = Self::channel();
        resolver.resolve(result);
        pending
    }

    /// Check for the result without blocking.
    pub fn poll(&mut self) -> Poll<Result<T, ShellError>> {
        match self.rx.try_recv() {
            Ok(result) => Poll::Ready(result),
            Err(TryRecvError::Empty) => Poll::Pending,
            Err(TryRecvError::Disconnected) => Poll::Ready(Err(ShellError::Closed)),
        }
    }
}

impl<T> Resolver<T> {
    /// Deliver the result. Returns false if nobody is waiting any more.
    pub fn resolve(self, result: Result<T, ShellError>) -> bool {
        self.tx.send(result).is_ok()
    }
}

/// A pending chunk of output text.
pub type PendingRead = Pending<String>;

/// A session that is still starting.
pub type PendingSession = Pending<Box<dyn ShellSession>>;

// ---------------------------------------------------------------------------
// Executor traits
// ---------------------------------------------------------------------------

/// A live shell bound to a working directory.
pub trait ShellSession: Send {
    /// Queue `input` for the shell's stdin. Must not block.
    fn write(&mut self, input: &str) -> Result<(), ShellError>;

    /// The next non-empty chunk of stdout. Resolves with
    /// [`ShellError::Closed`] once stdout has ended.
    fn read_stdout(&mut self) -> PendingRead;

    /// The next non-empty chunk of stderr.
    fn read_stderr(&mut self) -> PendingRead;

    /// Terminate the shell. Outstanding reads resolve with an error or are
    /// never resolved; callers drop them either way.
    fn stop(&mut self);
}

/// Creates shell sessions.
pub trait ShellExecutor {
    fn open(&mut self, cwd: &str) -> PendingSession;
}
