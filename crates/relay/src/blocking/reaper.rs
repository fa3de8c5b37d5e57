use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Sender, bounded};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::blocking::exchange::BlockingExchange;

/// Every exchange an engine has started and not yet seen finish.
#[derive(Default)]
pub(crate) struct LiveExchanges(Mutex<Vec<Weak<BlockingExchange>>>);

impl LiveExchanges {
    pub(crate) fn register(&self, exchange: &Arc<BlockingExchange>) {
        self.0.lock().push(Arc::downgrade(exchange));
    }

    /// Closes exchanges idle for longer than `idle_timeout` and forgets the
    /// ones already closed. Returns how many were closed.
    pub(crate) fn reap(&self, idle_timeout: Duration) -> usize {
        let mut idle = Vec::new();
        self.0.lock().retain(|weak| {
            let Some(exchange) = weak.upgrade() else {
                return false;
            };
            if exchange.is_closed() {
                return false;
            }
            if exchange.idle_for() > idle_timeout {
                idle.push(exchange);
                return false;
            }
            true
        });

        // closing takes the exchange's own locks; do it outside ours
        for exchange in &idle {
            info!(id = exchange.id(), "closing idle exchange");
            exchange.close();
        }
        idle.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.0.lock().len()
    }
}

/// Background thread that closes idle exchanges.
///
/// Dropping the reaper stops the thread and waits for it.
#[derive(Debug)]
pub struct IdleReaper {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl IdleReaper {
    pub(crate) fn spawn(live: Arc<LiveExchanges>, interval: Duration, idle_timeout: Duration) -> io::Result<Self> {
        let (stop, stopped) = bounded::<()>(1);
        let thread = thread::Builder::new().name("relay-reaper".into()).spawn(move || {
            debug!(?interval, ?idle_timeout, "idle reaper started");
            // a message or a disconnect both end the loop
            while let Err(crossbeam_channel::RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                let closed = live.reap(idle_timeout);
                if closed > 0 {
                    debug!(closed, remaining = live.len(), "reaped idle exchanges");
                }
            }
            debug!("idle reaper stopped");
        })?;

        Ok(Self { stop: Some(stop), thread: Some(thread) })
    }

    /// Stops the reaper and waits for its thread.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            info!("idle reaper panicked");
        }
    }
}

impl Drop for IdleReaper {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

impl std::fmt::Debug for LiveExchanges {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveExchanges").field("len", &self.len()).finish()
    }
}
