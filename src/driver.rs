//! Async driver that runs a [`Host`] on a tokio task.
//!
//! The host itself is synchronous. The driver owns it, serializes all calls
//! from other tasks through a channel, fires timers at their deadlines, and
//! forwards host events.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::att::Error;
use crate::host::{Event, Host, Transport};
use crate::Result;

type Call<T> = Box<dyn FnOnce(&mut Host<T>) + Send>;

/// Host event loop.
pub struct Driver<T: Transport> {
    h: Host<T>,
    rx: mpsc::UnboundedReceiver<Call<T>>,
    ev: mpsc::UnboundedSender<Event>,
    /// Signaled when a request slot may be available.
    freed: Arc<Notify>,
}

impl<T: Transport> Driver<T> {
    /// Creates a driver for the specified host. Returns the driver, a
    /// handle for calling into the host, and the host event receiver.
    #[must_use]
    pub fn new(h: Host<T>) -> (Self, DriverHandle<T>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ev, ev_rx) = mpsc::unbounded_channel();
        let freed = Arc::new(Notify::new());
        let d = Self {
            h,
            rx,
            ev,
            freed: Arc::clone(&freed),
        };
        (d, DriverHandle { tx, freed }, ev_rx)
    }

    /// Spawns the event loop on the current runtime.
    #[inline]
    pub fn spawn(self) -> JoinHandle<Host<T>> {
        tokio::spawn(self.run())
    }

    /// Runs the event loop until all handles are dropped. Returns the host.
    pub async fn run(mut self) -> Host<T> {
        debug!("Driver started");
        loop {
            let deadline = self.h.next_deadline();
            tokio::select! {
                call = self.rx.recv() => match call {
                    Some(f) => f(&mut self.h),
                    None => break,
                },
                () = sleep_until(deadline) => {
                    trace!("Timer expired");
                    self.h.poll_timers(Instant::now());
                }
            }
            while let Some(e) = self.h.next_event() {
                // Receiver may be gone if the application ignores events
                let _ = self.ev.send(e);
            }
            if self.h.can_request() {
                self.freed.notify_waiters();
            }
        }
        debug!("Driver stopped");
        self.h
    }
}

impl<T: Transport + Debug> Debug for Driver<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver").field("h", &self.h).finish_non_exhaustive()
    }
}

/// Handle for calling into a host owned by a [`Driver`].
pub struct DriverHandle<T: Transport> {
    tx: mpsc::UnboundedSender<Call<T>>,
    freed: Arc<Notify>,
}

impl<T: Transport> DriverHandle<T> {
    /// Runs `f` in the host context and returns its result. Fails with
    /// [`Error::NotConnected`] if the driver stopped.
    pub async fn call<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut Host<T>) -> R + Send + 'static,
    ) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        let call: Call<T> = Box::new(move |h| {
            let _ = tx.send(f(h));
        });
        self.tx.send(call).map_err(|_| Error::NotConnected)?;
        rx.await.map_err(|_| Error::NotConnected)
    }

    /// Runs `f` in the host context, retrying it while it fails with
    /// [`Error::NoResources`] until a request slot is released or `timeout`
    /// expires.
    pub async fn submit<R: Send + 'static>(
        &self,
        timeout: Duration,
        f: impl Fn(&mut Host<T>) -> Result<R> + Send + Sync + 'static,
    ) -> Result<R> {
        let deadline = Instant::now() + timeout;
        let f = Arc::new(f);
        loop {
            // Registered before the attempt so that a release in between is
            // not missed
            let freed = self.freed.notified();
            let g = Arc::clone(&f);
            match self.call(move |h| g(h)).await? {
                Err(Error::NoResources) => {}
                r => return r,
            }
            trace!("Waiting for a request slot");
            if tokio::time::timeout_at(deadline, freed).await.is_err() {
                return Err(Error::NoResources);
            }
        }
    }
}

impl<T: Transport> Clone for DriverHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            freed: Arc::clone(&self.freed),
        }
    }
}

impl<T: Transport> Debug for DriverHandle<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverHandle").finish_non_exhaustive()
    }
}

/// Sleeps until the deadline or forever if there is none.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(t) => tokio::time::sleep_until(t).await,
        None => std::future::pending().await,
    }
}
