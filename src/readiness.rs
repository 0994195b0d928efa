//! Readiness signal protocol
//!
//! Loaded content may publish a well-known global (`__flyerReady` by default)
//! telling the host it is visually settled: fonts loaded, images decoded,
//! layout done. When that value is awaitable the host waits for it; otherwise
//! the host sleeps for a fixed grace interval.
//!
//! The grace interval is a best-effort settle window, not a guarantee. Content
//! that does not publish a signal and takes longer than the grace interval to
//! settle will be captured half-rendered. Templates should publish a signal.

use crate::Result;
use futures::future::BoxFuture;
use log::debug;
use std::future::Future;
use std::time::Duration;

/// Default global name the content publishes its readiness value under.
pub const DEFAULT_SIGNAL_NAME: &str = "__flyerReady";

/// Grace delay used when the content publishes no awaitable signal.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(300);

/// Capability of a readiness value the host can wait on.
///
/// Backends perform the structural check ("does it have a `then`?") when they
/// read the signal and only hand out an `Awaitable` when it passes.
pub trait Awaitable: Send {
    /// Wait until the content settles. `Err` carries the rejection reason.
    fn settle(self: Box<Self>) -> BoxFuture<'static, std::result::Result<(), String>>;
}

impl<F> Awaitable for F
where
    F: Future<Output = std::result::Result<(), String>> + Send + 'static,
{
    fn settle(self: Box<Self>) -> BoxFuture<'static, std::result::Result<(), String>> {
        Box::pin(*self)
    }
}

/// Readiness value as observed by the host.
///
/// The host only reads this value; the content owns its lifecycle.
pub enum ReadinessToken {
    /// The content published something awaitable.
    Awaitable(Box<dyn Awaitable>),
    /// Nothing usable was published; fall back to the grace delay.
    Absent,
}

impl ReadinessToken {
    /// Wrap a future as an awaitable token.
    pub fn from_future<F>(fut: F) -> Self
    where
        F: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        ReadinessToken::Awaitable(Box::new(fut))
    }

    pub fn is_awaitable(&self) -> bool {
        matches!(self, ReadinessToken::Awaitable(_))
    }
}

impl std::fmt::Debug for ReadinessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadinessToken::Awaitable(_) => f.write_str("ReadinessToken::Awaitable"),
            ReadinessToken::Absent => f.write_str("ReadinessToken::Absent"),
        }
    }
}

/// How the readiness wait ended. Never an error: readiness failures are
/// best-effort and must not abort an otherwise loaded render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    /// The awaitable resolved.
    Signaled,
    /// The awaitable rejected; the reason is kept for logging.
    Rejected(String),
    /// No awaitable was published and the grace delay elapsed.
    GraceElapsed,
    /// Reading the signal failed outright; proceeded without waiting.
    Unreadable(String),
}

/// Settle a readiness value read from the content.
///
/// `signal` is the outcome of reading the global: `Err` means the read itself
/// failed (e.g. the content window went away), which is swallowed the same way
/// as an asynchronous rejection.
pub async fn settle(signal: Result<ReadinessToken>, grace: Duration) -> Settled {
    match signal {
        Ok(ReadinessToken::Awaitable(awaitable)) => match awaitable.settle().await {
            Ok(()) => Settled::Signaled,
            Err(reason) => {
                debug!("readiness signal rejected, continuing: {}", reason);
                Settled::Rejected(reason)
            }
        },
        Ok(ReadinessToken::Absent) => {
            debug!("no readiness signal, waiting {:?} grace", grace);
            tokio::time::sleep(grace).await;
            Settled::GraceElapsed
        }
        Err(e) => {
            debug!("readiness signal unreadable, continuing: {}", e);
            Settled::Unreadable(e.to_string())
        }
    }
}
