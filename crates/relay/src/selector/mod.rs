//! Readiness-driven scheduling on a fixed pool of mio event loops
//!
//! Each worker thread owns one [`mio::Poll`]. A client channel is handed to a
//! worker round-robin by [`EventLoopPool::dispatch`] and stays there; the
//! upstreams its exchange opens are registered on the same worker, so an
//! exchange is only ever touched by one thread.
//!
//! Registration is edge-triggered. Channels are always interested in
//! reads and gain write interest only while bytes are queued for them.

mod channel;
mod exchange;
mod worker;

use std::io;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, unbounded};
use mio::{Poll, Waker};
use tracing::{debug, error, info, trace};

use crate::config::SelectorConfig;
use crate::director::Director;
use worker::{Command, WAKER, Worker};

struct WorkerHandle {
    commands: Sender<Command>,
    waker: Waker,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    fn send(&self, command: Command) -> io::Result<()> {
        self.commands
            .send(command)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, format!("event loop has stopped: {e}")))?;
        self.waker.wake()
    }
}

/// The event-loop workers of the non-blocking discipline.
///
/// Dropping the pool stops every worker and closes their exchanges.
pub struct EventLoopPool {
    workers: Vec<WorkerHandle>,
    next: AtomicUsize,
}

impl EventLoopPool {
    /// Starts `config.workers()` event loops.
    ///
    /// # Errors
    ///
    /// Returns an error if a poll instance cannot be created or a thread
    /// cannot be spawned; workers already started are stopped.
    pub fn start<D: Director>(director: D, config: SelectorConfig) -> io::Result<Self> {
        let director: Arc<dyn Director> = Arc::new(director);
        let mut pool = Self { workers: Vec::with_capacity(config.workers()), next: AtomicUsize::new(0) };

        for index in 0..config.workers() {
            let poll = Poll::new()?;
            let waker = Waker::new(poll.registry(), WAKER)?;
            let (commands, receiver) = unbounded();
            let worker = Worker::new(index, poll, config.events_capacity(), receiver, Arc::clone(&director));
            let thread = thread::Builder::new().name(format!("relay-worker-{index}")).spawn(move || worker.run())?;
            pool.workers.push(WorkerHandle { commands, waker, thread: Some(thread) });
        }

        info!(workers = pool.workers.len(), "event loops started");
        Ok(pool)
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Hands an accepted plain-text client to the next worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be made non-blocking or the
    /// worker has stopped.
    pub fn dispatch(&self, stream: TcpStream) -> io::Result<()> {
        self.dispatch_with(stream, None)
    }

    /// Hands an accepted client to the next worker, terminating TLS with
    /// `session`.
    ///
    /// # Errors
    ///
    /// As for [`Self::dispatch`].
    pub fn dispatch_tls(&self, stream: TcpStream, session: rustls::ServerConnection) -> io::Result<()> {
        self.dispatch_with(stream, Some(session))
    }

    fn dispatch_with(&self, stream: TcpStream, tls: Option<rustls::ServerConnection>) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        if let Err(e) = stream.set_nodelay(true) {
            trace!(cause = %e, "set nodelay");
        }
        let stream = mio::net::TcpStream::from_std(stream);
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index].send(Command::Accept { stream, tls })
    }

    /// Stops every worker and waits for them.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        for worker in &self.workers {
            if let Err(e) = worker.send(Command::Shutdown) {
                debug!(cause = %e, "worker already stopped");
            }
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take()
                && thread.join().is_err()
            {
                error!("event loop panicked");
            }
        }
    }
}

impl Drop for EventLoopPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for EventLoopPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopPool").field("workers", &self.workers.len()).finish_non_exhaustive()
    }
}
