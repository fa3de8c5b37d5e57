use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::blocking::exchange::BlockingExchange;
use crate::blocking::reaper::{IdleReaper, LiveExchanges};
use crate::blocking::transport::BlockingTransport;
use crate::config::BlockingConfig;
use crate::director::Director;

/// Runs exchanges with two threads each: one reading the client, one
/// reading the current upstream.
///
/// ```no_run
/// use std::net::TcpListener;
/// use micro_relay::blocking::BlockingEngine;
/// use micro_relay::config::BlockingConfig;
/// use micro_relay::director::{ConnectionTarget, Director};
/// use micro_relay::protocol::HttpMessage;
///
/// struct Backend;
///
/// impl Director for Backend {
///     fn resolve_upstream(&self, _request: &mut HttpMessage) -> Option<ConnectionTarget> {
///         Some(ConnectionTarget::plain("127.0.0.1", 8080))
///     }
/// }
///
/// let engine = BlockingEngine::new(Backend, BlockingConfig::default());
/// let _reaper = engine.spawn_reaper()?;
/// let listener = TcpListener::bind("127.0.0.1:3000")?;
/// for stream in listener.incoming() {
///     engine.serve(stream?)?;
/// }
/// # Ok::<(), std::io::Error>(())
/// ```
pub struct BlockingEngine {
    director: Arc<dyn Director>,
    config: BlockingConfig,
    live: Arc<LiveExchanges>,
    next_id: AtomicU64,
}

impl BlockingEngine {
    pub fn new<D: Director>(director: D, config: BlockingConfig) -> Self {
        Self::with_shared(Arc::new(director), config)
    }

    pub fn with_shared(director: Arc<dyn Director>, config: BlockingConfig) -> Self {
        Self { director, config, live: Arc::new(LiveExchanges::default()), next_id: AtomicU64::new(1) }
    }

    pub fn config(&self) -> &BlockingConfig {
        &self.config
    }

    /// Starts an exchange for an accepted client connection.
    ///
    /// # Errors
    ///
    /// Returns an error if either thread cannot be spawned; the exchange is
    /// closed in that case.
    pub fn serve<T: BlockingTransport>(&self, client: T) -> io::Result<ExchangeHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let exchange = Arc::new(BlockingExchange::new(
            id,
            Arc::clone(&self.director),
            self.config.clone(),
            Arc::new(client),
        ));
        self.live.register(&exchange);
        debug!(id, "exchange started");

        let request = Self::spawn(&exchange, "request", BlockingExchange::run_request).inspect_err(|_| exchange.close())?;
        let response =
            Self::spawn(&exchange, "response", BlockingExchange::run_response).inspect_err(|_| exchange.close())?;

        Ok(ExchangeHandle { exchange, request: Some(request), response: Some(response) })
    }

    fn spawn(exchange: &Arc<BlockingExchange>, side: &str, run: fn(&BlockingExchange)) -> io::Result<JoinHandle<()>> {
        let name = format!("relay-{}-{side}", exchange.id());
        let exchange = Arc::clone(exchange);
        thread::Builder::new().name(name).spawn(move || run(&exchange)).inspect_err(|e| {
            error!(side, cause = %e, "failed to spawn exchange thread");
        })
    }

    /// Starts the thread that closes exchanges idle past
    /// [`BlockingConfig::idle_timeout`].
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn_reaper(&self) -> io::Result<IdleReaper> {
        IdleReaper::spawn(Arc::clone(&self.live), self.config.reap_interval(), self.config.idle_timeout())
    }

    /// Runs one reaper pass now; returns how many exchanges were closed.
    pub fn reap_idle(&self) -> usize {
        self.live.reap(self.config.idle_timeout())
    }
}

impl fmt::Debug for BlockingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingEngine")
            .field("config", &self.config)
            .field("live", &self.live)
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

/// A running exchange.
///
/// Dropping the handle detaches the threads; the exchange keeps running until
/// either side closes.
#[derive(Debug)]
pub struct ExchangeHandle {
    exchange: Arc<BlockingExchange>,
    request: Option<JoinHandle<()>>,
    response: Option<JoinHandle<()>>,
}

impl ExchangeHandle {
    pub fn id(&self) -> u64 {
        self.exchange.id()
    }

    pub fn is_closed(&self) -> bool {
        self.exchange.is_closed()
    }

    /// Closes the exchange from outside. Both threads end soon after.
    pub fn close(&self) {
        self.exchange.close();
    }

    /// Waits for both threads to finish.
    pub fn join(mut self) {
        for (side, thread) in [("request", self.request.take()), ("response", self.response.take())] {
            if let Some(thread) = thread
                && thread.join().is_err()
            {
                error!(id = self.exchange.id(), side, "exchange thread panicked");
                self.exchange.close();
            }
        }
    }
}
