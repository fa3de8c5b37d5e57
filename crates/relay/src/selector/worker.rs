use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use crossbeam_channel::{Receiver, TryRecvError};
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Poll, Registry, Token};
use tracing::{debug, error, trace, warn};

use crate::director::Director;
use crate::pool::ConnectionKey;
use crate::selector::channel::Channel;
use crate::selector::exchange::SelectorExchange;

pub(crate) const WAKER: Token = Token(usize::MAX);

/// Work handed to a worker from outside its thread.
pub(crate) enum Command {
    Accept { stream: TcpStream, tls: Option<rustls::ServerConnection> },
    Shutdown,
}

/// Which side of its exchange a registered channel is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Upstream(ConnectionKey),
}

#[derive(Debug, Clone)]
pub(crate) struct Registration {
    pub(crate) exchange: usize,
    pub(crate) role: Role,
}

/// Token allocation and the token → owner map for one worker.
#[derive(Debug, Default)]
pub(crate) struct Tokens {
    next: usize,
    map: HashMap<Token, Registration>,
}

impl Tokens {
    fn next_token(&mut self) -> Token {
        let token = Token(self.next);
        self.next += 1;
        if self.next == WAKER.0 {
            self.next = 0;
        }
        token
    }

    /// A client token doubles as its exchange id.
    pub(crate) fn allocate_client(&mut self) -> Token {
        let token = self.next_token();
        self.map.insert(token, Registration { exchange: token.0, role: Role::Client });
        token
    }

    pub(crate) fn allocate(&mut self, exchange: usize, role: Role) -> Token {
        let token = self.next_token();
        self.map.insert(token, Registration { exchange, role });
        token
    }

    pub(crate) fn get(&self, token: Token) -> Option<&Registration> {
        self.map.get(&token)
    }

    pub(crate) fn remove(&mut self, token: Token) {
        self.map.remove(&token);
    }

    pub(crate) fn release_exchange(&mut self, exchange: usize) {
        self.map.retain(|_, registration| registration.exchange != exchange);
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}

/// What an exchange may touch on its worker while handling an event.
pub(crate) struct Context<'a> {
    pub(crate) registry: &'a Registry,
    pub(crate) tokens: &'a mut Tokens,
}

/// Readiness of one token, copied out of `Events`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Readiness {
    pub(crate) token: Token,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable() || event.is_write_closed(),
        }
    }
}

/// One event loop: a `Poll`, the exchanges it owns, and their tokens.
pub(crate) struct Worker {
    index: usize,
    poll: Poll,
    events: Events,
    commands: Receiver<Command>,
    director: Arc<dyn Director>,
    tokens: Tokens,
    exchanges: HashMap<usize, SelectorExchange>,
}

impl Worker {
    pub(crate) fn new(
        index: usize,
        poll: Poll,
        events_capacity: usize,
        commands: Receiver<Command>,
        director: Arc<dyn Director>,
    ) -> Self {
        Self {
            index,
            poll,
            events: Events::with_capacity(events_capacity),
            commands,
            director,
            tokens: Tokens::default(),
            exchanges: HashMap::new(),
        }
    }

    pub(crate) fn run(mut self) {
        debug!(worker = self.index, "event loop started");
        loop {
            if let Err(e) = self.poll.poll(&mut self.events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(worker = self.index, cause = %e, "poll failed");
                break;
            }

            let ready: Vec<Readiness> = self.events.iter().map(Readiness::from).collect();
            for readiness in ready {
                if readiness.token == WAKER {
                    if !self.drain_commands() {
                        self.shutdown();
                        return;
                    }
                    continue;
                }
                self.dispatch(readiness);
            }
        }
        self.shutdown();
    }

    /// Returns `false` once the worker should stop.
    fn drain_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Accept { stream, tls }) => self.accept(stream, tls),
                Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => return false,
                Err(TryRecvError::Empty) => return true,
            }
        }
    }

    fn accept(&mut self, stream: TcpStream, tls: Option<rustls::ServerConnection>) {
        let token = self.tokens.allocate_client();
        let client = match Channel::accepted(stream, token, tls, self.poll.registry()) {
            Ok(client) => client,
            Err(e) => {
                warn!(worker = self.index, cause = %e, "failed to register client");
                self.tokens.remove(token);
                return;
            }
        };

        let id = token.0;
        trace!(worker = self.index, id, "client registered");
        let mut exchange = SelectorExchange::new(id, Arc::clone(&self.director), client);
        let mut cx = Context { registry: self.poll.registry(), tokens: &mut self.tokens };
        exchange.start(&mut cx);
        self.settle(id, exchange);
    }

    fn dispatch(&mut self, readiness: Readiness) {
        let Some(registration) = self.tokens.get(readiness.token).cloned() else {
            trace!(worker = self.index, token = ?readiness.token, "event for released token");
            return;
        };
        let Some(mut exchange) = self.exchanges.remove(&registration.exchange) else {
            self.tokens.remove(readiness.token);
            return;
        };

        let mut cx = Context { registry: self.poll.registry(), tokens: &mut self.tokens };
        exchange.on_event(&mut cx, &registration.role, readiness);
        self.settle(registration.exchange, exchange);
    }

    /// Keeps a live exchange, or releases the tokens of a closed one.
    fn settle(&mut self, id: usize, exchange: SelectorExchange) {
        if exchange.is_closed() {
            self.tokens.release_exchange(id);
            trace!(worker = self.index, id, tokens = self.tokens.len(), "exchange released");
        } else {
            self.exchanges.insert(id, exchange);
        }
    }

    fn shutdown(&mut self) {
        debug!(worker = self.index, exchanges = self.exchanges.len(), "event loop stopping");
        let mut cx = Context { registry: self.poll.registry(), tokens: &mut self.tokens };
        for (_, mut exchange) in self.exchanges.drain() {
            exchange.close(&mut cx);
        }
    }
}
