//! The on-disk cache observed through real calls.

mod support;

use std::time::Duration;

use courier::{Cache, CacheControl, Client, Request};
use support::{MockResponse, MockWebServer};

fn client_with_cache(cache: &Cache) -> Client {
    Client::builder().cache(cache.clone()).build().unwrap()
}

fn get(url: &str) -> Request {
    Request::get(url).unwrap()
}

#[test]
fn cache_miss_then_store_then_hit() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::new(dir.path(), 1 << 20).unwrap();
    let server = MockWebServer::start();
    server.enqueue(
        MockResponse::new()
            .header("Cache-Control", "max-age=60")
            .body("v1"),
    );

    let client = client_with_cache(&cache);

    // Miss: network round trip, stored on the way out.
    let mut first = client.new_call(get(&server.url("/doc"))).execute().unwrap();
    assert_eq!(first.body_mut().string().unwrap(), "v1");
    assert!(first.network_response().is_some());
    assert!(first.cache_response().is_none());
    let _ = server.take_request();

    // Hit: no network request reaches the server.
    let mut second = client.new_call(get(&server.url("/doc"))).execute().unwrap();
    assert_eq!(second.body_mut().string().unwrap(), "v1");
    assert!(second.cache_response().is_some());
    assert!(server.try_take_request().is_none());

    assert_eq!(cache.request_count(), 2);
    assert_eq!(cache.network_count(), 1);
    assert_eq!(cache.hit_count(), 1);
    assert_eq!(cache.urls().len(), 1);
}

#[test]
fn conditional_revalidation_serves_cached_body_on_304() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::new(dir.path(), 1 << 20).unwrap();
    let server = MockWebServer::start();
    // Expired immediately, with a validator.
    server.enqueue(
        MockResponse::new()
            .header("Cache-Control", "max-age=0")
            .header("ETag", "\"a\"")
            .body("v1"),
    );
    server.enqueue(
        MockResponse::new()
            .code(304, "Not Modified")
            .header("ETag", "\"a\"")
            .header("X-Fresh", "yes"),
    );

    let client = client_with_cache(&cache);

    let mut first = client.new_call(get(&server.url("/doc"))).execute().unwrap();
    assert_eq!(first.body_mut().string().unwrap(), "v1");
    let _ = server.take_request();

    let mut second = client.new_call(get(&server.url("/doc"))).execute().unwrap();
    assert_eq!(second.body_mut().string().unwrap(), "v1");
    // Merged headers carry the 304's updates.
    assert_eq!(second.header("X-Fresh"), Some("yes"));
    assert_eq!(second.code(), 200);
    assert!(second.cache_response().is_some());
    assert!(second.network_response().is_some());

    let revalidation = server.take_request();
    assert_eq!(revalidation.header("If-None-Match"), Some("\"a\""));

    // Exactly one entry exists for the URL.
    assert_eq!(cache.urls().len(), 1);
}

#[test]
fn full_response_on_revalidation_replaces_entry() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::new(dir.path(), 1 << 20).unwrap();
    let server = MockWebServer::start();
    server.enqueue(
        MockResponse::new()
            .header("Cache-Control", "max-age=0")
            .header("ETag", "\"a\"")
            .body("v1"),
    );
    server.enqueue(
        MockResponse::new()
            .header("Cache-Control", "max-age=60")
            .header("ETag", "\"b\"")
            .body("v2"),
    );

    let client = client_with_cache(&cache);
    let mut first = client.new_call(get(&server.url("/doc"))).execute().unwrap();
    assert_eq!(first.body_mut().string().unwrap(), "v1");
    let mut second = client.new_call(get(&server.url("/doc"))).execute().unwrap();
    assert_eq!(second.body_mut().string().unwrap(), "v2");

    // The replacement is served from cache while fresh.
    let mut third = client.new_call(get(&server.url("/doc"))).execute().unwrap();
    assert_eq!(third.body_mut().string().unwrap(), "v2");
    let _ = server.take_request();
    let _ = server.take_request();
    assert!(server.try_take_request().is_none());
}

#[test]
fn only_if_cached_miss_is_504() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::new(dir.path(), 1 << 20).unwrap();
    let server = MockWebServer::start();

    let client = client_with_cache(&cache);
    let request = Request::builder()
        .url(server.url("/missing"))
        .unwrap()
        .cache_control(CacheControl::force_cache())
        .build()
        .unwrap();
    let response = client.new_call(request).execute().unwrap();
    assert_eq!(response.code(), 504);
    assert!(server.try_take_request().is_none());
}

#[test]
fn no_store_responses_are_not_cached() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::new(dir.path(), 1 << 20).unwrap();
    let server = MockWebServer::start();
    server.enqueue(
        MockResponse::new()
            .header("Cache-Control", "no-store, max-age=60")
            .body("private"),
    );
    server.enqueue(MockResponse::new().body("fresh from network"));

    let client = client_with_cache(&cache);
    let mut first = client.new_call(get(&server.url("/doc"))).execute().unwrap();
    first.body_mut().string().unwrap();
    let mut second = client.new_call(get(&server.url("/doc"))).execute().unwrap();
    assert_eq!(second.body_mut().string().unwrap(), "fresh from network");
    assert_eq!(cache.urls().len(), 0);
}

#[test]
fn post_invalidates_cached_entry() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::new(dir.path(), 1 << 20).unwrap();
    let server = MockWebServer::start();
    server.enqueue(
        MockResponse::new()
            .header("Cache-Control", "max-age=60")
            .body("cached"),
    );
    server.enqueue(MockResponse::new().body("post result"));
    server.enqueue(MockResponse::new().body("after invalidation"));

    let client = client_with_cache(&cache);
    let url = server.url("/doc");
    let mut first = client.new_call(get(&url)).execute().unwrap();
    first.body_mut().string().unwrap();
    assert_eq!(cache.urls().len(), 1);

    let post = Request::builder()
        .url(url.as_str())
        .unwrap()
        .post(courier::text_body("update", None))
        .build()
        .unwrap();
    let mut posted = client.new_call(post).execute().unwrap();
    posted.body_mut().string().unwrap();
    assert_eq!(cache.urls().len(), 0);

    let mut third = client.new_call(get(&url)).execute().unwrap();
    assert_eq!(third.body_mut().string().unwrap(), "after invalidation");
}

#[test]
fn cache_size_and_directory_accessors() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::new(dir.path(), 4096).unwrap();
    assert_eq!(cache.max_size(), 4096);
    assert_eq!(cache.size(), 0);
    assert_eq!(cache.directory(), dir.path().to_path_buf());

    // A second cache on the same directory works only after the first lets
    // go; the journal being exclusive is the single-writer guarantee.
    drop(cache);
    let reopened = Cache::new(dir.path(), 4096).unwrap();
    assert_eq!(reopened.size(), 0);
}

#[test]
fn evict_all_clears_entries() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::new(dir.path(), 1 << 20).unwrap();
    let server = MockWebServer::start();
    server.enqueue(
        MockResponse::new()
            .header("Cache-Control", "max-age=60")
            .body("will be evicted"),
    );

    let client = client_with_cache(&cache);
    let mut response = client.new_call(get(&server.url("/doc"))).execute().unwrap();
    response.body_mut().string().unwrap();
    assert_eq!(cache.urls().len(), 1);

    cache.evict_all().unwrap();
    assert_eq!(cache.urls().len(), 0);
    assert_eq!(cache.size(), 0);

    // Wait a beat so the first request is consumed before the server drops.
    std::thread::sleep(Duration::from_millis(50));
}
