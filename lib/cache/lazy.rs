//! Single-flight, cancellation-aware memoized fetch.
//!
//! A [`LazyValue`] wraps an async fetch function. The first caller of [`LazyValue::get`] starts
//! the fetch on a background task; everybody who arrives while it is running waits on the same
//! flight, and the outcome (including an error) is memoized until [`LazyValue::invalidate`].
//!
//! Each caller passes its own [`CancellationToken`]. Cancelling it only ends that caller's wait.
//! When the last waiter of a flight leaves, the fetch's own token fires and the value returns to
//! idle, so the next caller starts over instead of inheriting an abandoned request.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::FutureExt as _;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::Error;

type FetchFn<T> = dyn Fn(CancellationToken) -> BoxFuture<'static, Result<T, Error>> + Send + Sync;

type Outcome<T> = Result<T, Error>;

/// One running fetch and everybody waiting on it.
struct Flight<T> {
    id: u64,
    waiters: usize,
    abort: CancellationToken,
    tx: watch::Sender<Option<Outcome<T>>>,
}

enum State<T> {
    Idle,
    Fetching(Flight<T>),
    Ready(Outcome<T>),
    Shutdown,
}

struct Inner<T> {
    fetch: Box<FetchFn<T>>,
    state: Mutex<State<T>>,
    shutdown: CancellationToken,
    next_flight: AtomicU64,
}

impl<T> Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the fetch task. Must be called with the state lock held.
    fn start_flight(self: &Arc<Self>) -> Flight<T> {
        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let abort = self.shutdown.child_token();
        let (tx, _) = watch::channel(None);

        let fut = (self.fetch)(abort.clone());
        let task_abort = abort.clone();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                () = task_abort.cancelled() => return,
                res = AssertUnwindSafe(fut).catch_unwind() => res,
            };
            if let Some(inner) = Weak::upgrade(&weak) {
                inner.complete(id, outcome.ok());
            }
        });

        debug!(flight = id, "fetch started");
        Flight {
            id,
            waiters: 0,
            abort,
            tx,
        }
    }

    /// Publish the outcome of flight `id`, unless that flight was abandoned meanwhile.
    ///
    /// `None` means the fetch panicked. Its waiters get an error, but nothing is memoized.
    fn complete(&self, id: u64, outcome: Option<Outcome<T>>) {
        let mut state = self.lock();
        if !matches!(&*state, State::Fetching(flight) if flight.id == id) {
            return;
        }
        let State::Fetching(flight) = std::mem::replace(&mut *state, State::Idle) else {
            return;
        };

        match outcome {
            Some(res) => {
                debug!(flight = id, ok = res.is_ok(), "fetch completed");
                flight.tx.send_replace(Some(res.clone()));
                *state = State::Ready(res);
            }
            None => {
                error!(flight = id, "fetch panicked, resetting to idle");
                flight.tx.send_replace(Some(Err(Error::transport(std::io::Error::other(
                    "fetch panicked",
                )))));
            }
        }
    }
}

/// Decrements the flight's waiter count when a `get` leaves, however it leaves.
struct WaiterGuard<'a, T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: &'a Inner<T>,
    id: u64,
}

impl<T> Drop for WaiterGuard<'_, T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        let State::Fetching(flight) = &mut *state else {
            return;
        };
        if flight.id != self.id {
            return;
        }

        flight.waiters -= 1;
        if flight.waiters == 0 {
            debug!(flight = self.id, "last waiter left, abandoning fetch");
            flight.abort.cancel();
            *state = State::Idle;
        }
    }
}

/// A memoized, single-flight async value.
///
/// Shared by reference (usually behind an [`Arc`]). Dropping the `LazyValue` shuts it down.
pub struct LazyValue<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<T>>,
}

impl<T> LazyValue<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an idle value. Nothing is fetched until the first [`get`](Self::get).
    ///
    /// The token handed to `fetch` fires when every waiter has gone away or the value is shut
    /// down. Well-behaved fetch functions forward it to the remote call.
    pub fn new<F, Fut>(fetch: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        Self::with_state(fetch, State::Idle)
    }

    /// Create a value that already holds `value`. `fetch` runs only after an invalidation.
    pub fn ready<F, Fut>(value: T, fetch: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        Self::with_state(fetch, State::Ready(Ok(value)))
    }

    fn with_state<F, Fut>(fetch: F, state: State<T>) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                fetch: Box::new(move |cancel| fetch(cancel).boxed()),
                state: Mutex::new(state),
                shutdown: CancellationToken::new(),
                next_flight: AtomicU64::new(0),
            }),
        }
    }

    /// Wait for the value, starting a fetch if none is cached or running.
    ///
    /// Returns [`Error::Cancelled`] if `cancel` fires first and [`Error::Shutdown`] if the value
    /// is shut down. Otherwise returns the flight's outcome, which may itself be an error.
    pub async fn get(&self, cancel: &CancellationToken) -> Result<T, Error> {
        let (id, mut rx) = {
            let mut state = self.inner.lock();
            if matches!(&*state, State::Idle) {
                *state = State::Fetching(self.inner.start_flight());
            }
            match &mut *state {
                State::Ready(res) => return res.clone(),
                State::Shutdown => return Err(Error::Shutdown),
                State::Fetching(flight) => {
                    flight.waiters += 1;
                    (flight.id, flight.tx.subscribe())
                }
                State::Idle => unreachable!("LazyValue idle right after starting a flight"),
            }
        };

        let _guard = WaiterGuard {
            inner: &self.inner,
            id,
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            () = self.inner.shutdown.cancelled() => Err(Error::Shutdown),
            outcome = wait_outcome(&mut rx) => outcome.unwrap_or(Err(Error::Shutdown)),
        }
    }

    /// Return the memoized value without fetching, if one is ready and successful.
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        match &*self.inner.lock() {
            State::Ready(Ok(v)) => Some(v.clone()),
            State::Ready(Err(_)) | State::Idle | State::Fetching(_) | State::Shutdown => None,
        }
    }

    /// Replace the memoized value with a newer snapshot obtained elsewhere.
    ///
    /// A running fetch is abandoned and its waiters receive `value` instead.
    pub fn seed(&self, value: T) {
        let mut state = self.inner.lock();
        if matches!(&*state, State::Shutdown) {
            return;
        }
        if let State::Fetching(flight) =
            std::mem::replace(&mut *state, State::Ready(Ok(value.clone())))
        {
            flight.abort.cancel();
            flight.tx.send_replace(Some(Ok(value)));
        }
    }

    /// Forget a memoized outcome so the next [`get`](Self::get) fetches again.
    ///
    /// A fetch that is already running is left alone; its result is still delivered and
    /// memoized.
    pub fn invalidate(&self) {
        let mut state = self.inner.lock();
        if matches!(&*state, State::Ready(_)) {
            *state = State::Idle;
        }
    }

    /// Permanently disable the value, aborting any running fetch.
    ///
    /// Current and future callers of [`get`](Self::get) receive [`Error::Shutdown`].
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let prev = std::mem::replace(&mut *self.inner.lock(), State::Shutdown);
        if let State::Fetching(flight) = prev {
            debug!(flight = flight.id, "shutdown while fetching");
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

impl<T> Drop for LazyValue<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Resolves once the flight publishes. `None` if the flight was torn down without an outcome.
async fn wait_outcome<T: Clone>(
    rx: &mut watch::Receiver<Option<Outcome<T>>>,
) -> Option<Outcome<T>> {
    rx.wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|outcome| (*outcome).clone())
}
