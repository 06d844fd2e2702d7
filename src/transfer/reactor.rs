use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::util::lock_unpoisoned;

/// The dedicated I/O thread driving the transfer engine and its timers. A
/// current-thread runtime lives on it for the reactor's whole lifetime; the
/// last handle dropped shuts it down.
pub(crate) struct Reactor {
    runtime: tokio::runtime::Handle,
    thread_id: ThreadId,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    pub(crate) fn spawn(thread_name: &str) -> io::Result<Arc<Self>> {
        let (handle_sender, handle_receiver) = std::sync::mpsc::channel();
        let (shutdown_sender, shutdown_receiver) = oneshot::channel::<()>();

        let join = thread::Builder::new()
            .name(thread_name.to_owned())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(error) => {
                        let _ = handle_sender.send(Err(error));
                        return;
                    }
                };
                let _ = handle_sender.send(Ok((
                    runtime.handle().clone(),
                    thread::current().id(),
                )));
                runtime.block_on(async {
                    let _ = shutdown_receiver.await;
                });
                debug!(target: "reqflow::reactor", "reactor thread stopping");
            })?;

        let (runtime, thread_id) = handle_receiver
            .recv()
            .map_err(|_| io::Error::other("reactor thread exited during startup"))??;

        Ok(Arc::new(Self {
            runtime,
            thread_id,
            shutdown: Mutex::new(Some(shutdown_sender)),
            join: Mutex::new(Some(join)),
        }))
    }

    pub(crate) fn spawn_task<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        drop(self.runtime.spawn(future));
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if let Some(sender) = lock_unpoisoned(&self.shutdown).take() {
            let _ = sender.send(());
        }
        // Joining from the reactor thread itself would deadlock; the thread
        // exits on its own once the shutdown future resolves.
        if thread::current().id() != self.thread_id
            && let Some(join) = lock_unpoisoned(&self.join).take()
        {
            let _ = join.join();
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TimerError {
    Cancelled,
    ReactorGone,
}

/// Schedules single-shot timers on the reactor thread.
#[derive(Clone)]
pub(crate) struct TimerHandle {
    reactor: Arc<Reactor>,
}

impl TimerHandle {
    pub(crate) fn new(reactor: Arc<Reactor>) -> Self {
        Self { reactor }
    }

    /// Fires `handler` once after `delay` on the reactor thread. The handler
    /// observes `Err(Cancelled)` when the returned guard is cancelled first,
    /// and `Err(ReactorGone)` when the reactor shut down before the timer
    /// could run; it is called exactly once in every case.
    pub(crate) fn singleshot<F>(&self, delay: Duration, handler: F) -> TimerGuard
    where
        F: FnOnce(Result<(), TimerError>) + Send + 'static,
    {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let mut armed = ArmedTimer {
            handler: Some(Box::new(handler)),
        };

        self.reactor.spawn_task(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => armed.fire(Ok(())),
                _ = task_token.cancelled() => armed.fire(Err(TimerError::Cancelled)),
            }
        });

        TimerGuard { token }
    }
}

/// Cancels the pending timer when asked; dropping the guard leaves the
/// timer running.
pub(crate) struct TimerGuard {
    token: CancellationToken,
}

impl TimerGuard {
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }
}

type TimerCallback = Box<dyn FnOnce(Result<(), TimerError>) + Send + 'static>;

struct ArmedTimer {
    handler: Option<TimerCallback>,
}

impl ArmedTimer {
    fn fire(&mut self, result: Result<(), TimerError>) {
        if let Some(handler) = self.handler.take() {
            handler(result);
        }
    }
}

impl Drop for ArmedTimer {
    fn drop(&mut self) {
        // The timer task was dropped unpolled: report the scheduling failure
        // from a detached thread so the callback never runs inline with the
        // drop site.
        if let Some(handler) = self.handler.take() {
            thread::spawn(move || handler(Err(TimerError::ReactorGone)));
        }
    }
}
