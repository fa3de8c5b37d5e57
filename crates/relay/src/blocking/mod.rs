//! Thread-per-direction scheduling
//!
//! Every exchange gets a request thread and a response thread. Reads and
//! writes block; the threads meet on a single monitor to hand over the
//! upstream and to keep request and response cycles in lockstep.
//!
//! [`BlockingEngine`] starts exchanges, [`IdleReaper`] closes the ones that
//! stop moving.

mod engine;
mod exchange;
mod reaper;
mod transport;

pub use engine::{BlockingEngine, ExchangeHandle};
pub use reaper::IdleReaper;
pub use transport::{BlockingTransport, TlsTransport};
