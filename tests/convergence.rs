//! Registry convergence scenarios against mock upstream storage servers.
//!
//! Covers hash promotion order, the published listing file, cross-check
//! discovery of unadvertised holders, and stale-serving when upstreams go
//! dark.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use common::{converger, proxy, router, HASH_A, HASH_B, UUID};
use http_body_util::BodyExt;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn promotes_reachable_hash_and_publishes_listing() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/registries"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(format!("/registry/{UUID}/{HASH_A}\n")),
        )
        .mount(&first)
        .await;
    Mock::given(method("GET"))
        .and(path("/registries"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(format!("/registry/{UUID}/{HASH_B}\n")),
        )
        .mount(&second)
        .await;

    // The first upstream advertises a snapshot it can no longer serve; the
    // second one's candidate materializes and wins the promotion.
    Mock::given(method("GET"))
        .and(path(format!("/registry/{UUID}/{HASH_A}")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&first)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/registry/{UUID}/{HASH_B}")))
        .respond_with(ResponseTemplate::new(200).set_body_string("snapshot b"))
        .mount(&second)
        .await;

    let fixture = proxy(&[&first.uri(), &second.uri()]);
    let convergence = converger(&fixture, &[UUID]);
    convergence.tick().await;

    let listing = std::fs::read_to_string(fixture.store.listing_path()).unwrap();
    assert_eq!(listing, format!("/registry/{UUID}/{HASH_B}\n"));
    assert_eq!(
        std::fs::read(fixture.store.cache_path(&format!("/registry/{UUID}/{HASH_B}"))).unwrap(),
        b"snapshot b"
    );
    assert_eq!(fixture.metrics.registry_promotions.get(), 1);

    // A second round converges on the same hash without republishing.
    fixture.engine.forget_failures();
    convergence.tick().await;
    assert_eq!(fixture.metrics.registry_promotions.get(), 1);

    // The listing is served through the front door.
    let app = router(&fixture, Arc::clone(&convergence));
    let response = app
        .oneshot(Request::builder().uri("/registries").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, listing.as_bytes());
}

#[tokio::test]
async fn cross_check_discovers_unadvertised_holders() {
    let advertiser = MockServer::start().await;
    let silent_holder = MockServer::start().await;
    let resource = format!("/registry/{UUID}/{HASH_A}");

    // The advertiser lists the hash but cannot actually serve it.
    Mock::given(method("GET"))
        .and(path("/registries"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(format!("/registry/{UUID}/{HASH_A}\n")),
        )
        .mount(&advertiser)
        .await;
    Mock::given(method("HEAD"))
        .and(path(resource.as_str()))
        .respond_with(ResponseTemplate::new(404))
        .mount(&advertiser)
        .await;
    Mock::given(method("GET"))
        .and(path(resource.as_str()))
        .respond_with(ResponseTemplate::new(404))
        .mount(&advertiser)
        .await;

    // The silent holder advertises nothing but answers the cross-check.
    Mock::given(method("GET"))
        .and(path("/registries"))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .mount(&silent_holder)
        .await;
    Mock::given(method("HEAD"))
        .and(path(resource.as_str()))
        .respond_with(ResponseTemplate::new(200))
        .mount(&silent_holder)
        .await;
    Mock::given(method("GET"))
        .and(path(resource.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_string("snapshot"))
        .mount(&silent_holder)
        .await;

    let fixture = proxy(&[&advertiser.uri(), &silent_holder.uri()]);
    let convergence = converger(&fixture, &[UUID]);
    convergence.tick().await;

    // The promotion can only succeed because the cross-check added the
    // silent holder to the hash's server set.
    let listing = std::fs::read_to_string(fixture.store.listing_path()).unwrap();
    assert_eq!(listing, format!("/registry/{UUID}/{HASH_A}\n"));
    assert_eq!(
        std::fs::read(fixture.store.cache_path(&resource)).unwrap(),
        b"snapshot"
    );

    let probed = silent_holder
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| {
            request.method.to_string() == "HEAD" && request.url.path() == resource
        })
        .count();
    assert!(probed >= 1, "silent holder must have been HEAD-probed");
}

#[tokio::test]
async fn keeps_promotion_when_upstreams_go_dark() {
    let upstream = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/registries"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(format!("/registry/{UUID}/{HASH_A}\n")),
        )
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/registry/{UUID}/{HASH_A}")))
        .respond_with(ResponseTemplate::new(200).set_body_string("snapshot"))
        .mount(&upstream)
        .await;

    let fixture = proxy(&[&upstream.uri()]);
    let convergence = converger(&fixture, &[UUID]);
    convergence.tick().await;

    let listing = std::fs::read_to_string(fixture.store.listing_path()).unwrap();
    assert_eq!(listing, format!("/registry/{UUID}/{HASH_A}\n"));

    // Every mock is dropped: the upstream now 404s its own listing.  The
    // next round finds no candidates and serves stale.
    upstream.reset().await;
    fixture.engine.forget_failures();
    convergence.tick().await;

    assert_eq!(
        std::fs::read_to_string(fixture.store.listing_path()).unwrap(),
        listing
    );
    assert_eq!(fixture.metrics.registry_promotions.get(), 1);
}

#[tokio::test]
async fn ignores_unknown_and_malformed_listing_lines() {
    let upstream = MockServer::start().await;
    let unknown_uuid = "ffffffff-ffff-4fff-8fff-ffffffffffff";

    Mock::given(method("GET"))
        .and(path("/registries"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "/registry/{unknown_uuid}/{HASH_B}\nnot a record\n\n/registry/{UUID}/{HASH_A}\n"
        )))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/registry/{UUID}/{HASH_A}")))
        .respond_with(ResponseTemplate::new(200).set_body_string("snapshot"))
        .mount(&upstream)
        .await;

    let fixture = proxy(&[&upstream.uri()]);
    let convergence = converger(&fixture, &[UUID]);
    convergence.tick().await;

    // Only the known registry is promoted; the unknown UUID is never
    // fetched.
    let listing = std::fs::read_to_string(fixture.store.listing_path()).unwrap();
    assert_eq!(listing, format!("/registry/{UUID}/{HASH_A}\n"));
    let unknown_fetches = upstream
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.url.path().contains(unknown_uuid))
        .count();
    assert_eq!(unknown_fetches, 0);
}
