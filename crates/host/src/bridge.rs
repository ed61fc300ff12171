use std::cell::Cell;
use std::future::Future;
use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use tokio::runtime::{Handle, Runtime, RuntimeFlavor};

thread_local! {
    static DEADLINE: Cell<Option<Instant>> = const { Cell::new(None) };
}

/// Bound every [`Bridge::run`] made by `f` on this thread to `deadline`.
///
/// Host calls block the worker thread where the isolate's watchdog cannot
/// interrupt them.
pub fn with_deadline<R>(deadline: Option<Instant>, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<Instant>);
    impl Drop for Restore {
        fn drop(&mut self) {
            DEADLINE.with(|cell| cell.set(self.0));
        }
    }
    let _restore = Restore(DEADLINE.with(|cell| cell.replace(deadline)));
    f()
}

/// Time left before the current thread's deadline, if one is set.
pub fn remaining() -> Option<Duration> {
    DEADLINE
        .with(Cell::get)
        .map(|deadline| deadline.saturating_duration_since(Instant::now()))
}

/// Runs async backend work (outbound HTTP, redis) for synchronous host calls.
///
/// Guest workers block their own thread while the V8 isolate runs, so async
/// work is spawned onto a shared multi-thread runtime and the caller waits on
/// a plain channel. This is safe to call from inside another runtime's
/// `block_on`, unlike `Handle::block_on`.
#[derive(Clone)]
pub struct Bridge {
    handle: Handle,
    _owned: Option<Arc<OwnedRuntime>>,
}

/// Dedicated runtime; shut down in the background so dropping it from async
/// code does not panic.
struct OwnedRuntime(Option<Runtime>);

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("host runtime is shutting down")]
    Closed,
    #[error("execution timeout")]
    DeadlineExceeded,
}

impl Bridge {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            _owned: None,
        }
    }

    /// Use the ambient runtime when it is multi-threaded, otherwise start a
    /// small dedicated one. A current-thread runtime cannot make progress
    /// while its only thread waits in [`Bridge::run`].
    pub fn current_or_owned() -> std::io::Result<Self> {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                Ok(Self::new(handle))
            }
            _ => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .thread_name("fn-host")
                    .enable_all()
                    .build()?;
                Ok(Self {
                    handle: runtime.handle().clone(),
                    _owned: Some(Arc::new(OwnedRuntime(Some(runtime)))),
                })
            }
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Drive `fut` to completion on the shared runtime and wait for it, but
    /// no longer than the thread's deadline. An abandoned future is aborted.
    pub fn run<F>(&self, fut: F) -> Result<F::Output, BridgeError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let remaining = remaining();
        if remaining.is_some_and(|left| left.is_zero()) {
            return Err(BridgeError::DeadlineExceeded);
        }
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        let task = self.handle.spawn(async move {
            let _ = tx.send(fut.await);
        });
        let Some(remaining) = remaining else {
            return rx.recv().map_err(|_| BridgeError::Closed);
        };
        match rx.recv_timeout(remaining) {
            Ok(output) => Ok(output),
            Err(RecvTimeoutError::Timeout) => {
                task.abort();
                Err(BridgeError::DeadlineExceeded)
            }
            Err(RecvTimeoutError::Disconnected) => Err(BridgeError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_futures_without_ambient_runtime() {
        let bridge = Bridge::current_or_owned().expect("bridge");
        let value = bridge
            .run(async {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                21 * 2
            })
            .expect("run");
        assert_eq!(value, 42);
    }

    #[test]
    fn deadline_cuts_waits_short() {
        let bridge = Bridge::current_or_owned().expect("bridge");
        let started = Instant::now();
        let result = with_deadline(Some(started + Duration::from_millis(100)), || {
            bridge.run(tokio::time::sleep(Duration::from_secs(10)))
        });
        assert_eq!(result, Err(BridgeError::DeadlineExceeded));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(remaining(), None);

        let expired = with_deadline(Some(Instant::now()), || bridge.run(async { 1 }));
        assert_eq!(expired, Err(BridgeError::DeadlineExceeded));
    }
}
