//! Forwards every request on 127.0.0.1:8080 to 127.0.0.1:3000.
//!
//! Pass `blocking` as the first argument to use two threads per client
//! instead of the event loops.

use std::net::TcpListener;

use micro_relay::blocking::BlockingEngine;
use micro_relay::config::{BlockingConfig, SelectorConfig};
use micro_relay::director::{ConnectionTarget, Director};
use micro_relay::protocol::{HttpMessage, MessageContext};
use micro_relay::selector::EventLoopPool;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

struct Backend;

impl Director for Backend {
    fn sift_request_header(&self, name: &str, _value: &str, _cx: &MessageContext<'_>) -> Option<String> {
        name.eq_ignore_ascii_case("host").then(|| "127.0.0.1:3000".to_owned())
    }

    fn resolve_upstream(&self, request: &mut HttpMessage) -> Option<ConnectionTarget> {
        (!request.path().starts_with("/private")).then(|| ConnectionTarget::plain("127.0.0.1", 3000))
    }
}

enum Engine {
    Blocking(BlockingEngine),
    Selector(EventLoopPool),
}

fn main() -> std::io::Result<()> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let engine = match std::env::args().nth(1).as_deref() {
        Some("blocking") => Engine::Blocking(BlockingEngine::new(Backend, BlockingConfig::default())),
        _ => Engine::Selector(EventLoopPool::start(Backend, SelectorConfig::default())?),
    };
    let _reaper = match &engine {
        Engine::Blocking(engine) => Some(engine.spawn_reaper()?),
        Engine::Selector(_) => None,
    };

    info!(port = 8080, "start listening");
    let listener = match TcpListener::bind("127.0.0.1:8080") {
        Ok(listener) => listener,
        Err(e) => {
            error!(cause = %e, "bind server error");
            return Err(e);
        }
    };

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(cause = %e, "failed to accept");
                continue;
            }
        };

        let served = match &engine {
            Engine::Blocking(engine) => engine.serve(stream).map(drop),
            Engine::Selector(pool) => pool.dispatch(stream),
        };
        if let Err(e) = served {
            warn!(cause = %e, "failed to hand off client");
        }
    }
    Ok(())
}
