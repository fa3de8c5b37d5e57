//! Behaviour both disciplines must share. Each test binary runs these
//! against its own [`Proxy`] constructor.

use std::thread;
use std::time::Duration;

use indoc::indoc;

use super::{
    CONTINUE, Event, HELLO, LARGE_BODY, Proxy, Recording, Script, TIMEOUT, chunked_response, closed_port, complete,
    large_body, tls_configs, upstream, upstream_with,
};

type MakeProxy = fn(Recording) -> Proxy;

const NOT_FOUND: &[u8] = b"HTTP/1.1 404 Not Found\r\nConnection: close\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\n\r\n";

pub fn forwards_response_and_reports_completion_once(make: MakeProxy) {
    let upstream = upstream(Script::Hello);
    let (director, log) = Recording::new(upstream.addr);
    let proxy = make(director);

    let mut client = proxy.connect();
    client.send(b"GET /hello HTTP/1.1\r\nHost: client\r\n\r\n");
    assert_eq!(client.read_exact(HELLO.len()), HELLO);

    let head = upstream.heads.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(head, "GET /hello HTTP/1.1\r\nHost: upstream\r\n\r\n");
    assert_eq!(log.wait_for(|events| !events.is_empty()), vec![complete("/hello", 200)]);

    // closing between messages is not an error
    client.hang_up();
    assert_eq!(log.snapshot(), vec![complete("/hello", 200)]);
}

pub fn keeps_connection_alive_across_requests(make: MakeProxy) {
    let upstream = upstream(Script::Hello);
    let (director, log) = Recording::new(upstream.addr);
    let proxy = make(director);

    let mut client = proxy.connect();
    client.send(b"GET /one HTTP/1.1\r\n\r\n");
    assert_eq!(client.read_exact(HELLO.len()), HELLO);
    client.send(b"GET /two HTTP/1.1\r\n\r\n");
    assert_eq!(client.read_exact(HELLO.len()), HELLO);

    let events = log.wait_for(|events| events.len() == 2);
    assert_eq!(events, vec![complete("/one", 200), complete("/two", 200)]);
    client.hang_up();
}

pub fn reconnects_after_idle_upstream_closes(make: MakeProxy) {
    let upstream = upstream(Script::Once);
    let (director, log) = Recording::new(upstream.addr);
    let proxy = make(director);

    let mut client = proxy.connect();
    client.send(b"GET /one HTTP/1.1\r\n\r\n");
    assert_eq!(client.read_exact(HELLO.len()), HELLO);
    assert_eq!(upstream.heads.recv_timeout(TIMEOUT).unwrap(), "GET /one HTTP/1.1\r\n\r\n");

    // the upstream hangs up while the pooled connection sits idle
    thread::sleep(Duration::from_millis(200));

    client.send(b"GET /two HTTP/1.1\r\n\r\n");
    assert_eq!(client.read_exact(HELLO.len()), HELLO);
    assert_eq!(upstream.heads.recv_timeout(TIMEOUT).unwrap(), "GET /two HTTP/1.1\r\n\r\n");

    let events = log.wait_for(|events| events.len() == 2);
    assert_eq!(events, vec![complete("/one", 200), complete("/two", 200)]);
    client.hang_up();
}

pub fn holds_second_request_until_first_response(make: MakeProxy) {
    let upstream = upstream(Script::Hello);
    let (director, log) = Recording::new(upstream.addr);
    let proxy = make(director);

    let mut client = proxy.connect();
    client.send(b"GET /first HTTP/1.1\r\n\r\nGET /second HTTP/1.1\r\n\r\n");
    assert_eq!(client.read_exact(2 * HELLO.len()), [HELLO, HELLO].concat());

    assert_eq!(upstream.heads.recv_timeout(TIMEOUT).unwrap(), "GET /first HTTP/1.1\r\n\r\n");
    assert_eq!(upstream.heads.recv_timeout(TIMEOUT).unwrap(), "GET /second HTTP/1.1\r\n\r\n");
    assert_eq!(log.wait_for(|events| events.len() == 2), vec![complete("/first", 200), complete("/second", 200)]);
}

pub fn streams_chunked_response_unchanged(make: MakeProxy) {
    let upstream = upstream(Script::Chunked);
    let (director, log) = Recording::new(upstream.addr);
    let proxy = make(director);

    let expected = chunked_response();
    let mut client = proxy.connect();
    client.send(b"GET /stream HTTP/1.1\r\n\r\n");
    assert_eq!(client.read_exact(expected.len()), expected);
    assert_eq!(log.wait_for(|events| !events.is_empty()), vec![complete("/stream", 200)]);
}

pub fn interim_response_is_forwarded_once(make: MakeProxy) {
    let upstream = upstream(Script::Interim);
    let (director, log) = Recording::new(upstream.addr);
    let proxy = make(director);

    let mut client = proxy.connect();
    client.send(b"GET /interim HTTP/1.1\r\n\r\n");
    assert_eq!(client.read_exact(CONTINUE.len() + HELLO.len()), [CONTINUE, HELLO].concat());
    assert_eq!(log.wait_for(|events| !events.is_empty()), vec![complete("/interim", 200)]);

    client.hang_up();
    assert_eq!(log.snapshot(), vec![complete("/interim", 200)]);
}

pub fn slow_client_receives_large_response_intact(make: MakeProxy) {
    let upstream = upstream(Script::Large);
    let (director, log) = Recording::new(upstream.addr);
    let proxy = make(director);

    let mut client = proxy.connect();
    client.send(b"GET /large HTTP/1.1\r\n\r\n");
    // let the upstream run far ahead of a client that is not reading
    thread::sleep(Duration::from_millis(300));

    let mut expected = format!("HTTP/1.1 200 OK\r\nContent-Length: {LARGE_BODY}\r\n\r\n").into_bytes();
    expected.extend_from_slice(&large_body());
    let received = client.read_exact(expected.len());
    assert!(received == expected, "large response arrived altered");
    assert_eq!(log.wait_for(|events| !events.is_empty()), vec![complete("/large", 200)]);
}

pub fn unknown_route_ends_with_not_found(make: MakeProxy) {
    let upstream = upstream(Script::Hello);
    let (director, log) = Recording::new(upstream.addr);
    let proxy = make(director);

    let mut client = proxy.connect();
    client.send(b"GET /missing HTTP/1.1\r\n\r\n");
    assert_eq!(client.read_to_end(), NOT_FOUND);
    assert!(upstream.heads.is_empty());
    assert!(log.snapshot().is_empty());
}

pub fn unreachable_upstream_ends_with_bad_gateway(make: MakeProxy) {
    let (director, log) = Recording::new(closed_port());
    let proxy = make(director);

    let mut client = proxy.connect();
    client.send(b"GET /down HTTP/1.1\r\n\r\n");
    assert_eq!(client.read_to_end(), BAD_GATEWAY);
    assert!(log.snapshot().is_empty());
}

pub fn client_closing_mid_body_is_premature(make: MakeProxy) {
    let upstream = upstream(Script::Silent);
    let (director, log) = Recording::new(upstream.addr);
    let proxy = make(director);

    let mut client = proxy.connect();
    client.send(indoc! {b"
        POST /upload HTTP/1.1\r
        Content-Length: 10\r
        \r
        abc"});
    upstream.heads.recv_timeout(TIMEOUT).unwrap();
    client.hang_up();

    let events = log.wait_for(|events| !events.is_empty());
    assert_eq!(events, vec![Event::PrematureRequest { path: "/upload".to_owned() }]);
}

pub fn upstream_closing_mid_body_is_premature(make: MakeProxy) {
    let upstream = upstream(Script::Truncated);
    let (director, log) = Recording::new(upstream.addr);
    let proxy = make(director);

    let mut client = proxy.connect();
    client.send(b"GET /partial HTTP/1.1\r\n\r\n");
    let received = client.read_to_end();
    assert_eq!(received, b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc");

    let events = log.wait_for(|events| !events.is_empty());
    assert_eq!(events, vec![Event::PrematureResponse { status: 200 }]);
}

pub fn malformed_header_is_a_request_protocol_error(make: MakeProxy) {
    let upstream = upstream(Script::Hello);
    let (director, log) = Recording::new(upstream.addr);
    let proxy = make(director);

    let mut client = proxy.connect();
    client.send(b"GET / HTTP/1.1\r\nno separator here\r\n\r\n");
    assert!(client.read_to_end().is_empty());
    assert_eq!(log.wait_for(|events| !events.is_empty()), vec![Event::RequestProtocolError]);
}

pub fn malformed_response_is_a_response_protocol_error(make: MakeProxy) {
    let upstream = upstream(Script::BadLength);
    let (director, log) = Recording::new(upstream.addr);
    let proxy = make(director);

    let mut client = proxy.connect();
    client.send(b"GET /bad HTTP/1.1\r\n\r\n");
    assert!(!client.read_to_end().ends_with(b"hello"));
    assert_eq!(log.wait_for(|events| !events.is_empty()), vec![Event::ResponseProtocolError]);
}

pub fn tls_on_both_sides(make: MakeProxy) {
    let (server, client_config) = tls_configs();
    let upstream = upstream_with(Script::Hello, Some(std::sync::Arc::clone(&server)));
    let (director, log) = Recording::tls(upstream.addr, std::sync::Arc::clone(&client_config));
    let proxy = make(director);

    let mut client = proxy.connect_tls(server, client_config);
    client.send(b"GET /secure HTTP/1.1\r\nHost: client\r\n\r\n");
    assert_eq!(client.read_exact(HELLO.len()), HELLO);

    assert_eq!(upstream.heads.recv_timeout(TIMEOUT).unwrap(), "GET /secure HTTP/1.1\r\nHost: upstream\r\n\r\n");
    assert_eq!(log.wait_for(|events| !events.is_empty()), vec![complete("/secure", 200)]);
}
