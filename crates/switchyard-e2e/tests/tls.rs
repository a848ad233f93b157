//! TLS certificate selection end-to-end tests
//!
//! Each certificate source is signed by its own CA; a client that trusts only
//! one CA completes the handshake only if that source was chosen.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use switchyard::discovery::Instance;
use switchyard::Route;
use switchyard_e2e::{
    https_client, init_test, tls_handshake, MockHttpService, TestCa, TestRouter, TestRouterOptions,
};

fn route_with_cert(service: &str, domain: &str, ca: &TestCa, expired: bool) -> Route {
    let leaf = ca.leaf(&[domain]);
    let expires_at = if expired {
        Some(Utc::now() - ChronoDuration::hours(1))
    } else {
        Some(Utc::now() + ChronoDuration::days(30))
    };
    let mut route = Route::http(service, domain);
    route.as_http_mut().unwrap().certificate = Some(leaf.route_certificate(expires_at));
    route
}

#[tokio::test]
async fn test_route_certificate_preferred_over_static() {
    init_test();

    let route_ca = TestCa::generate("Route CA");
    let static_ca = TestCa::generate("Static CA");
    let router = TestRouter::start_with(TestRouterOptions {
        static_cert: Some(static_ca.leaf(&["secure.example.com", "plain.example.com"])),
        ..Default::default()
    })
    .await;

    router
        .add_http_route(route_with_cert("web", "secure.example.com", &route_ca, false))
        .await;

    tls_handshake(router.https_addr, "secure.example.com", &route_ca.cert_pem)
        .await
        .expect("route certificate not served");
    assert!(
        tls_handshake(router.https_addr, "secure.example.com", &static_ca.cert_pem)
            .await
            .is_err(),
        "static certificate served despite a route certificate"
    );

    // A domain without a route certificate gets the static keypair
    tls_handshake(router.https_addr, "plain.example.com", &static_ca.cert_pem)
        .await
        .expect("static certificate not served");
}

#[tokio::test]
async fn test_wildcard_route_certificate() {
    init_test();

    let route_ca = TestCa::generate("Wildcard CA");
    let router = TestRouter::start().await;
    router
        .add_http_route(route_with_cert("apps", "*.apps.example.com", &route_ca, false))
        .await;

    tls_handshake(router.https_addr, "billing.apps.example.com", &route_ca.cert_pem)
        .await
        .expect("wildcard route certificate not served");
}

#[tokio::test]
async fn test_expired_route_certificate_falls_back() {
    init_test();

    let route_ca = TestCa::generate("Expired CA");
    let static_ca = TestCa::generate("Static CA");
    let router = TestRouter::start_with(TestRouterOptions {
        static_cert: Some(static_ca.leaf(&["stale.example.com"])),
        ..Default::default()
    })
    .await;
    router
        .add_http_route(route_with_cert("web", "stale.example.com", &route_ca, true))
        .await;

    tls_handshake(router.https_addr, "stale.example.com", &static_ca.cert_pem)
        .await
        .expect("expired route certificate was not skipped");
}

#[tokio::test]
async fn test_no_certificate_fails_only_that_handshake() {
    init_test();

    let route_ca = TestCa::generate("Route CA");
    let router = TestRouter::start().await;
    router
        .add_http_route(route_with_cert("web", "known.example.com", &route_ca, false))
        .await;

    assert!(tls_handshake(router.https_addr, "unknown.example.com", &route_ca.cert_pem)
        .await
        .is_err());

    // The listener still serves other names
    tls_handshake(router.https_addr, "known.example.com", &route_ca.cert_pem)
        .await
        .expect("listener stopped serving after a failed handshake");
}

#[tokio::test]
async fn test_automated_issuance_for_routed_domain() {
    init_test();

    let issuing_ca = Arc::new(TestCa::generate("Issuing CA"));
    let router = TestRouter::start_with(TestRouterOptions {
        issuing_ca: Some(issuing_ca.clone()),
        require_route: true,
        ..Default::default()
    })
    .await;
    router.add_http_route(Route::http("web", "auto.example.com")).await;

    // Concurrent handshakes share one issuance
    let handshakes = (0..8).map(|_| tls_handshake(router.https_addr, "auto.example.com", &issuing_ca.cert_pem));
    for result in futures_util::future::join_all(handshakes).await {
        result.expect("issued certificate not served");
    }

    assert!(
        tls_handshake(router.https_addr, "unrouted.example.com", &issuing_ca.cert_pem)
            .await
            .is_err(),
        "issued a certificate for a domain without a route"
    );
}

#[tokio::test]
async fn test_https_request_reaches_backend() {
    init_test();

    let route_ca = TestCa::generate("Route CA");
    let router = TestRouter::start().await;
    let backend = MockHttpService::start_named("secure").await;
    router.set_instances("secure", vec![Instance::new(backend.addr_string())]);
    router
        .add_http_route(route_with_cert("secure", "secure.example.com", &route_ca, false))
        .await;

    let client = https_client(&route_ca.cert_pem, "secure.example.com", router.https_addr);
    let resp = client
        .get(format!("https://secure.example.com:{}/account", router.https_addr.port()))
        .send()
        .await
        .expect("HTTPS request failed");

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "secure");

    let request = backend.last_request().unwrap();
    assert_eq!(request.uri, "/account");
    assert_eq!(request.header("x-forwarded-proto"), Some("https"));
}
