mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use common::{Proxy, Recording, Script, TIMEOUT, scenarios, upstream};
use micro_relay::config::BlockingConfig;

#[test]
fn forwards_response_and_reports_completion_once() {
    scenarios::forwards_response_and_reports_completion_once(Proxy::blocking);
}

#[test]
fn keeps_connection_alive_across_requests() {
    scenarios::keeps_connection_alive_across_requests(Proxy::blocking);
}

#[test]
fn holds_second_request_until_first_response() {
    scenarios::holds_second_request_until_first_response(Proxy::blocking);
}

#[test]
fn streams_chunked_response_unchanged() {
    scenarios::streams_chunked_response_unchanged(Proxy::blocking);
}

#[test]
fn unknown_route_ends_with_not_found() {
    scenarios::unknown_route_ends_with_not_found(Proxy::blocking);
}

#[test]
fn unreachable_upstream_ends_with_bad_gateway() {
    scenarios::unreachable_upstream_ends_with_bad_gateway(Proxy::blocking);
}

#[test]
fn client_closing_mid_body_is_premature() {
    scenarios::client_closing_mid_body_is_premature(Proxy::blocking);
}

#[test]
fn upstream_closing_mid_body_is_premature() {
    scenarios::upstream_closing_mid_body_is_premature(Proxy::blocking);
}

#[test]
fn malformed_header_is_a_request_protocol_error() {
    scenarios::malformed_header_is_a_request_protocol_error(Proxy::blocking);
}

#[test]
fn tls_on_both_sides() {
    scenarios::tls_on_both_sides(Proxy::blocking);
}

#[test]
fn reconnects_after_idle_upstream_closes() {
    scenarios::reconnects_after_idle_upstream_closes(Proxy::blocking);
}

#[test]
fn interim_response_is_forwarded_once() {
    scenarios::interim_response_is_forwarded_once(Proxy::blocking);
}

#[test]
fn slow_client_receives_large_response_intact() {
    scenarios::slow_client_receives_large_response_intact(Proxy::blocking);
}

#[test]
fn malformed_response_is_a_response_protocol_error() {
    scenarios::malformed_response_is_a_response_protocol_error(Proxy::blocking);
}

#[test]
fn reaper_closes_idle_exchanges_quietly() {
    let upstream = upstream(Script::Hello);
    let (director, log) = Recording::new(upstream.addr);
    let config =
        BlockingConfig::default().with_idle_timeout(Duration::from_millis(50)).with_reap_interval(Duration::from_millis(10));
    let proxy = Proxy::blocking_with(director, config);
    let Proxy::Blocking(engine) = &proxy else { unreachable!() };
    let reaper = engine.spawn_reaper().unwrap();

    let mut client = proxy.connect();
    assert!(client.read_to_end().is_empty());
    assert!(client.handle.as_ref().is_some_and(micro_relay::blocking::ExchangeHandle::is_closed));

    reaper.shutdown();
    client.hang_up();
    assert!(log.snapshot().is_empty());
}

#[test]
fn explicit_close_is_idempotent() {
    let upstream = upstream(Script::Silent);
    let (director, log) = Recording::new(upstream.addr);
    let proxy = Proxy::blocking(director);

    let mut client = proxy.connect();
    client.send(b"GET /slow HTTP/1.1\r\n\r\n");
    upstream.heads.recv_timeout(TIMEOUT).unwrap();

    let handle = client.handle.take().unwrap();
    handle.close();
    handle.close();
    assert!(handle.is_closed());
    handle.join();

    assert!(client.read_to_end().is_empty());
    assert!(log.snapshot().is_empty());
}

#[test]
fn close_during_header_sift_is_final() {
    let upstream = upstream(Script::Hello);
    let (mut director, log) = Recording::new(upstream.addr);
    director.sift_delay = Duration::from_millis(300);
    let resolved = Arc::clone(&director.resolved);
    let proxy = Proxy::blocking(director);

    let mut client = proxy.connect();
    client.send(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    // the request thread is still inside the sift
    thread::sleep(Duration::from_millis(100));

    let handle = client.handle.take().unwrap();
    handle.close();
    assert!(handle.is_closed());

    let (done_tx, done) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        // past the end of the sift, the exchange must still be closed
        thread::sleep(Duration::from_millis(400));
        let closed = handle.is_closed();
        handle.join();
        let _ = done_tx.send(closed);
    });
    assert_eq!(done.recv_timeout(TIMEOUT), Ok(true));

    assert_eq!(resolved.load(Ordering::SeqCst), 0);
    assert!(upstream.heads.recv_timeout(Duration::from_millis(500)).is_err());
    assert!(client.read_to_end().is_empty());
    assert!(log.snapshot().is_empty());
}
