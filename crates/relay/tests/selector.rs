mod common;

use common::{Proxy, scenarios};

#[test]
fn forwards_response_and_reports_completion_once() {
    scenarios::forwards_response_and_reports_completion_once(Proxy::selector);
}

#[test]
fn keeps_connection_alive_across_requests() {
    scenarios::keeps_connection_alive_across_requests(Proxy::selector);
}

#[test]
fn holds_second_request_until_first_response() {
    scenarios::holds_second_request_until_first_response(Proxy::selector);
}

#[test]
fn streams_chunked_response_unchanged() {
    scenarios::streams_chunked_response_unchanged(Proxy::selector);
}

#[test]
fn unknown_route_ends_with_not_found() {
    scenarios::unknown_route_ends_with_not_found(Proxy::selector);
}

#[test]
fn unreachable_upstream_ends_with_bad_gateway() {
    scenarios::unreachable_upstream_ends_with_bad_gateway(Proxy::selector);
}

#[test]
fn client_closing_mid_body_is_premature() {
    scenarios::client_closing_mid_body_is_premature(Proxy::selector);
}

#[test]
fn upstream_closing_mid_body_is_premature() {
    scenarios::upstream_closing_mid_body_is_premature(Proxy::selector);
}

#[test]
fn malformed_header_is_a_request_protocol_error() {
    scenarios::malformed_header_is_a_request_protocol_error(Proxy::selector);
}

#[test]
fn tls_on_both_sides() {
    scenarios::tls_on_both_sides(Proxy::selector);
}

#[test]
fn reconnects_after_idle_upstream_closes() {
    scenarios::reconnects_after_idle_upstream_closes(Proxy::selector);
}

#[test]
fn interim_response_is_forwarded_once() {
    scenarios::interim_response_is_forwarded_once(Proxy::selector);
}

#[test]
fn slow_client_receives_large_response_intact() {
    scenarios::slow_client_receives_large_response_intact(Proxy::selector);
}

#[test]
fn malformed_response_is_a_response_protocol_error() {
    scenarios::malformed_response_is_a_response_protocol_error(Proxy::selector);
}
