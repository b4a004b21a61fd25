//! Connection pooling observed through real calls.

mod support;

use std::sync::Arc;
use std::time::Duration;

use courier::{Client, Request};
use support::{MockResponse, MockWebServer, SocketPolicy};

fn get(url: &str) -> Request {
    Request::get(url).unwrap()
}

#[test]
fn idle_connections_expire_after_keep_alive() {
    let server = MockWebServer::start();
    server.enqueue(MockResponse::new().body("one"));

    let client = Client::builder()
        .connection_pool(5, Duration::from_millis(100))
        .build()
        .unwrap();
    let mut response = client.new_call(get(&server.url("/"))).execute().unwrap();
    response.body_mut().string().unwrap();
    assert_eq!(client.idle_connection_count(), 1);

    // The cleanup task runs at the keep-alive boundary.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while client.connection_count() > 0 {
        assert!(std::time::Instant::now() < deadline, "connection not evicted");
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn server_close_is_not_pooled() {
    let server = MockWebServer::start();
    server.enqueue(
        MockResponse::new()
            .header("Connection", "close")
            .body("closing")
            .socket_policy(SocketPolicy::DisconnectAfterResponse),
    );
    server.enqueue(MockResponse::new().body("fresh"));

    let client = Client::new();
    let mut first = client.new_call(get(&server.url("/"))).execute().unwrap();
    assert_eq!(first.body_mut().string().unwrap(), "closing");
    assert_eq!(client.idle_connection_count(), 0);

    let mut second = client.new_call(get(&server.url("/"))).execute().unwrap();
    assert_eq!(second.body_mut().string().unwrap(), "fresh");

    let a = server.take_request();
    let b = server.take_request();
    assert_ne!(a.connection_index, b.connection_index);
}

#[test]
fn concurrent_calls_use_separate_connections() {
    let server = MockWebServer::start();
    server.enqueue(MockResponse::new().body("slow").socket_policy(SocketPolicy::KeepOpen));
    server.enqueue(MockResponse::new().body("slow").socket_policy(SocketPolicy::KeepOpen));

    let client = Arc::new(Client::new());
    let mut handles = Vec::new();
    for _ in 0..2 {
        let client = client.clone();
        let url = server.url("/");
        handles.push(std::thread::spawn(move || {
            let mut response = client.new_call(get(&url)).execute().unwrap();
            response.body_mut().string().unwrap()
        }));
    }
    for handle in handles {
        assert_eq!(handle.join().unwrap(), "slow");
    }
    // Both requests were served; connection counts depend on timing, but
    // nothing leaked past the idle cap.
    assert!(client.connection_count() <= 2);
}

#[test]
fn evict_all_closes_idle_connections() {
    let server = MockWebServer::start();
    server.enqueue(MockResponse::new().body("pooled"));

    let client = Client::new();
    let mut response = client.new_call(get(&server.url("/"))).execute().unwrap();
    response.body_mut().string().unwrap();
    assert_eq!(client.idle_connection_count(), 1);

    client.evict_all();
    assert_eq!(client.connection_count(), 0);
}

#[test]
fn address_policy_prewarms_connections() {
    let server = MockWebServer::start();

    let client = Client::new();
    client
        .set_address_policy(
            server.url("/").as_str(),
            courier::AddressPolicy::new(1),
        )
        .unwrap();

    // The opener task dials in the background.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while client.connection_count() < 1 {
        assert!(
            std::time::Instant::now() < deadline,
            "policy connection never opened"
        );
        std::thread::sleep(Duration::from_millis(25));
    }

    // The warmed connection serves the first call with no new dial.
    server.enqueue(MockResponse::new().body("prewarmed"));
    let mut response = client.new_call(get(&server.url("/"))).execute().unwrap();
    assert_eq!(response.body_mut().string().unwrap(), "prewarmed");
    assert_eq!(client.connection_count(), 1);
}
