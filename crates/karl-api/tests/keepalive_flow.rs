//! End-to-end keepalive flows: ingest, query, timeout, re-register, deregister,
//! reverse callback, snapshot.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{header, Request, StatusCode};
use axum::routing::get;
use axum::Router;
use tower::ServiceExt;

use karl_api::config::Config;
use karl_api::{Karl, KarlBuilder, SvgRenderer};
use karl_core::{Clock, MicroDuration, RegisteredState, ServiceKey};
use karl_test_utils::{MockClock, StatusFactory};

struct StubRenderer;

#[async_trait::async_trait]
impl SvgRenderer for StubRenderer {
    async fn render_svg(&self, dot: &str) -> karl_core::Result<String> {
        Ok(format!("<svg><!-- {} nodes --></svg>", dot.matches("->").count()))
    }
}

async fn start_karl() -> (Karl, MockClock) {
    let clock = MockClock::starting_at(1_000_000_000_000);
    let karl = KarlBuilder::new(Config {
        reconciler_poll_interval: Some(MicroDuration::from_micros(5_000)),
        ..Config::default()
    })
    .clock(Arc::new(clock.clone()))
    .renderer(Arc::new(StubRenderer))
    .build()
    .await
    .expect("karl builds");
    (karl, clock)
}

fn router_for_peer(karl: &Karl, ip: [u8; 4]) -> Router {
    karl.router()
        .layer(MockConnectInfo(SocketAddr::from((ip, 50_000))))
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("infallible router");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("read body");
    (status, String::from_utf8(bytes.to_vec()).expect("utf-8 body"))
}

async fn post_keepalive(router: &Router, uri: &str, body: String) -> (StatusCode, String) {
    send(
        router,
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::from(body))
            .expect("build request"),
    )
    .await
}

async fn get_json(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let (status, body) = send(
        router,
        Request::builder().uri(uri).body(Body::empty()).expect("build request"),
    )
    .await;
    let value = serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
    (status, value)
}

fn wait_for_reconciler() -> tokio::time::Sleep {
    tokio::time::sleep(Duration::from_millis(100))
}

#[tokio::test]
async fn basic_ingest_and_query() {
    let (karl, clock) = start_karl().await;
    let router = router_for_peer(&karl, [10, 0, 0, 1]);

    let body = StatusFactory::keepalive_body(&StatusFactory::status_at(
        "svcA",
        "S",
        7000,
        clock.now(),
    ));
    let (status, text) = post_keepalive(&router, "/?codename=svcA", body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text, "OK\n");

    clock.advance_seconds(1);
    let (status, value) = get_json(&router, "/?json&m=5").await;
    assert_eq!(status, StatusCode::OK);
    let service = &value["machines"]["10.0.0.1"]["services"]["svcA"];
    assert!(service["currently"].get("up").is_some(), "expected up: {value}");
    assert_eq!(
        service["currently"]["up"]["start_time_epoch_microseconds"],
        serde_json::json!(0)
    );
    assert_eq!(service["service"], "S");
    assert_eq!(service["location"]["port"], 7000);

    karl.shutdown().await;
}

#[tokio::test]
async fn silent_service_times_out() {
    let (karl, clock) = start_karl().await;
    let router = router_for_peer(&karl, [10, 0, 0, 1]);

    let body = StatusFactory::keepalive_body(&StatusFactory::status_at(
        "svcA",
        "S",
        7000,
        clock.now(),
    ));
    post_keepalive(&router, "/?codename=svcA", body).await;

    clock.advance_seconds(46);
    wait_for_reconciler().await;

    let (status, value) = get_json(&router, "/?json&m=5").await;
    assert_eq!(status, StatusCode::OK);
    let currently = &value["machines"]["10.0.0.1"]["services"]["svcA"]["currently"];
    assert!(currently.get("down").is_some(), "expected down: {value}");

    let state = karl
        .storage()
        .read_only(|tables| {
            tables
                .claires
                .get(&"svcA".to_string())
                .map(|claire| claire.registered_state)
        })
        .await;
    assert_eq!(state, Some(RegisteredState::DisconnectedByTimeout));

    karl.shutdown().await;
}

#[tokio::test]
async fn timed_out_service_re_registers_on_next_keepalive() {
    let (karl, clock) = start_karl().await;
    let router = router_for_peer(&karl, [10, 0, 0, 1]);

    let keepalive = || {
        StatusFactory::keepalive_body(&StatusFactory::status_at("svcA", "S", 7000, clock.now()))
    };
    post_keepalive(&router, "/?codename=svcA", keepalive()).await;
    clock.advance_seconds(46);
    wait_for_reconciler().await;

    let (status, text) = post_keepalive(&router, "/?codename=svcA", keepalive()).await;
    assert_eq!((status, text.as_str()), (StatusCode::OK, "OK\n"));

    let (state, launches) = karl
        .storage()
        .read_only(|tables| {
            (
                tables
                    .claires
                    .get(&"svcA".to_string())
                    .map(|claire| claire.registered_state),
                tables.karl.iter().filter(|record| record.up).count(),
            )
        })
        .await;
    assert_eq!(state, Some(RegisteredState::Active));
    // Re-registration does not produce a second launch record.
    assert_eq!(launches, 1);

    karl.shutdown().await;
}

#[tokio::test]
async fn deregistered_service_is_hidden_from_active_only() {
    let (karl, clock) = start_karl().await;
    let router = router_for_peer(&karl, [10, 0, 0, 1]);

    let body = StatusFactory::keepalive_body(&StatusFactory::status_at(
        "svcA",
        "S",
        7000,
        clock.now(),
    ));
    post_keepalive(&router, "/?codename=svcA", body).await;

    let (status, text) = send(
        &router,
        Request::builder()
            .method("DELETE")
            .uri("/?codename=svcA")
            .body(Body::empty())
            .expect("build request"),
    )
    .await;
    assert_eq!((status, text.as_str()), (StatusCode::OK, "OK\n"));

    clock.advance_seconds(1);
    let (_, filtered) = get_json(&router, "/?active_only&json&m=5").await;
    assert!(
        filtered["machines"]["10.0.0.1"]["services"].get("svcA").is_none(),
        "expected svcA hidden: {filtered}"
    );

    let (_, unfiltered) = get_json(&router, "/?json&m=5").await;
    assert!(
        unfiltered["machines"]["10.0.0.1"]["services"]["svcA"].is_object(),
        "expected svcA present: {unfiltered}"
    );
    let state = karl
        .storage()
        .read_only(|tables| {
            tables
                .claires
                .get(&"svcA".to_string())
                .map(|claire| claire.registered_state)
        })
        .await;
    assert_eq!(state, Some(RegisteredState::Deregistered));

    karl.shutdown().await;
}

#[tokio::test]
async fn delete_without_codename_is_a_nop() {
    let (karl, _clock) = start_karl().await;
    let router = router_for_peer(&karl, [10, 0, 0, 1]);

    let (status, text) = send(
        &router,
        Request::builder()
            .method("DELETE")
            .uri("/")
            .body(Body::empty())
            .expect("build request"),
    )
    .await;
    assert_eq!((status, text.as_str()), (StatusCode::OK, "NOP\n"));

    karl.shutdown().await;
}

#[tokio::test]
async fn confirmed_ingest_uses_the_reverse_callback() {
    let (karl, clock) = start_karl().await;
    let router = router_for_peer(&karl, [127, 0, 0, 1]);

    // Bind first so the claire can report the port the callback reaches it on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub");
    let port = listener.local_addr().expect("stub addr").port();
    let stub_body =
        StatusFactory::keepalive_body(&StatusFactory::status_at("svcA", "S", port, clock.now()));
    let app = Router::new().route(
        "/.current",
        get(move || {
            let body = stub_body.clone();
            async move { body }
        }),
    );
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    // The request body is ignored; the status comes from the callback.
    let uri = format!("/?codename=svcA&port={port}&confirm=1");
    let (status, text) = post_keepalive(&router, &uri, String::new()).await;
    assert_eq!((status, text.as_str()), (StatusCode::OK, "OK\n"));

    let location = karl
        .storage()
        .read_only(|tables| {
            tables
                .claires
                .get(&"svcA".to_string())
                .map(|claire| claire.location.clone())
        })
        .await;
    assert_eq!(location, Some(ServiceKey::new("127.0.0.1", port)));

    karl.shutdown().await;
}

#[tokio::test]
async fn callback_codename_mismatch_is_rejected() {
    let (karl, clock) = start_karl().await;
    let router = router_for_peer(&karl, [127, 0, 0, 1]);

    // The claire answers the callback as svcB while the URL claims svcA.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub");
    let port = listener.local_addr().expect("stub addr").port();
    let stub_body =
        StatusFactory::keepalive_body(&StatusFactory::status_at("svcB", "S", port, clock.now()));
    let app = Router::new().route(
        "/.current",
        get(move || {
            let body = stub_body.clone();
            async move { body }
        }),
    );
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let uri = format!("/?codename=svcA&port={port}&confirm=1");
    let (status, text) = post_keepalive(&router, &uri, String::new()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(text, "Inconsistent URL/body parameters.\n");

    karl.shutdown().await;
}

#[tokio::test]
async fn unreachable_callback_is_a_callback_error() {
    let (karl, _clock) = start_karl().await;
    let router = router_for_peer(&karl, [127, 0, 0, 1]);

    let (status, text) = post_keepalive(&router, "/?codename=svcA&port=1&confirm=1", String::new()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(text, "Callback error.\n");

    karl.shutdown().await;
}

#[tokio::test]
async fn malformed_body_is_a_parse_error() {
    let (karl, _clock) = start_karl().await;
    let router = router_for_peer(&karl, [10, 0, 0, 1]);

    let (status, text) = post_keepalive(&router, "/", "not json".to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(text, "JSON parse error.\n");

    karl.shutdown().await;
}

#[tokio::test]
async fn inconsistent_url_and_body_are_rejected() {
    let (karl, clock) = start_karl().await;
    let router = router_for_peer(&karl, [10, 0, 0, 1]);

    let body = StatusFactory::keepalive_body(&StatusFactory::status_at(
        "svcA",
        "S",
        7000,
        clock.now(),
    ));
    let (status, text) = post_keepalive(&router, "/?codename=svcB", body.clone()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(text, "Inconsistent URL/body parameters.\n");

    let (status, _) = post_keepalive(&router, "/?codename=svcA&port=7001", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    karl.shutdown().await;
}

#[tokio::test]
async fn snapshot_returns_the_latest_keepalive() {
    let (karl, clock) = start_karl().await;
    let router = router_for_peer(&karl, [10, 0, 0, 1]);

    let mut first = StatusFactory::status_at("svcA", "S", 7000, clock.now());
    first.uptime = "first".to_string();
    post_keepalive(&router, "/", StatusFactory::keepalive_body(&first)).await;

    clock.advance_seconds(10);
    let mut second = StatusFactory::status_at("svcA", "S", 7000, clock.now());
    second.uptime = "second".to_string();
    second.build = Some(StatusFactory::build("deadbeef"));
    post_keepalive(&router, "/", StatusFactory::keepalive_body(&second)).await;

    clock.advance_seconds(5);
    let (status, value) = get_json(&router, "/snapshot/svcA").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["keepalive"]["uptime"], "second");
    assert_eq!(value["age_us"], serde_json::json!(-5_000_000));
    assert!(value["keepalive"]["build"].is_object());

    let (status, value) = get_json(&router, "/snapshot/svcA?nobuild").await;
    assert_eq!(status, StatusCode::OK);
    assert!(value["keepalive"].get("build").is_none());

    let (status, value) = get_json(&router, "/snapshot/unknown").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        value["error"],
        "No keepalives from 'unknown' have been received."
    );

    karl.shutdown().await;
}

#[tokio::test]
async fn snapshot_cold_cache_scans_the_log() {
    let clock = MockClock::starting_at(1_000_000_000_000);
    let dir = tempfile::tempdir().expect("tempdir");
    let config = || Config {
        stream_file: Some(dir.path().join("keepalives.log")),
        storage_file: Some(dir.path().join("storage.log")),
        reconciler_poll_interval: Some(MicroDuration::from_micros(5_000)),
        ..Config::default()
    };

    let karl = KarlBuilder::new(config())
        .clock(Arc::new(clock.clone()))
        .build()
        .await
        .expect("karl builds");
    let router = router_for_peer(&karl, [10, 0, 0, 1]);
    let body = StatusFactory::keepalive_body(&StatusFactory::status_at(
        "svcA",
        "S",
        7000,
        clock.now(),
    ));
    post_keepalive(&router, "/", body).await;
    karl.shutdown().await;

    // A fresh launch has an empty index cache; the snapshot must fall back to a
    // full scan of the replayed log.
    let restarted = KarlBuilder::new(config())
        .clock(Arc::new(clock.clone()))
        .build()
        .await
        .expect("karl restarts");
    let router = router_for_peer(&restarted, [10, 0, 0, 1]);
    let (status, value) = get_json(&router, "/snapshot/svcA").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["keepalive"]["codename"], "svcA");

    restarted.shutdown().await;
}

#[tokio::test]
async fn build_endpoint_serves_stored_build_info() {
    let (karl, clock) = start_karl().await;
    let router = router_for_peer(&karl, [10, 0, 0, 1]);

    let mut status = StatusFactory::status_at("svcA", "S", 7000, clock.now());
    status.build = Some(StatusFactory::build("cafebabe"));
    post_keepalive(&router, "/", StatusFactory::keepalive_body(&status)).await;

    let (code, value) = get_json(&router, "/build/svcA").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(value["codename"], "svcA");
    assert_eq!(value["build"]["git_commit_hash"], "cafebabe");

    let (code, value) = get_json(&router, "/build/ghost").await;
    assert_eq!(code, StatusCode::NOT_FOUND);
    assert_eq!(value["error"], "Codename 'ghost' not found.");

    karl.shutdown().await;
}

#[tokio::test]
async fn dependencies_resolve_against_the_window() {
    let (karl, clock) = start_karl().await;
    let router_a = router_for_peer(&karl, [10, 0, 0, 1]);
    let router_b = router_for_peer(&karl, [10, 0, 0, 2]);

    let mut a = StatusFactory::status_at("svcA", "S", 7000, clock.now());
    a.dependencies = vec![
        StatusFactory::dependency("10.0.0.2", 7001),
        StatusFactory::dependency("10.9.9.9", 1234),
    ];
    post_keepalive(&router_a, "/", StatusFactory::keepalive_body(&a)).await;

    let b = StatusFactory::status_at("svcB", "S", 7001, clock.now());
    post_keepalive(&router_b, "/", StatusFactory::keepalive_body(&b)).await;

    clock.advance_seconds(1);
    let (_, value) = get_json(&router_a, "/?json&m=5").await;
    let service = &value["machines"]["10.0.0.1"]["services"]["svcA"];
    assert_eq!(service["dependencies"], serde_json::json!(["svcB"]));
    assert_eq!(
        service["unresolved_dependencies"],
        serde_json::json!(["http://10.9.9.9:1234/.current"])
    );

    karl.shutdown().await;
}

#[tokio::test]
async fn unknown_runtime_variant_falls_back_and_round_trips() {
    let (karl, clock) = start_karl().await;
    let router = router_for_peer(&karl, [10, 0, 0, 1]);

    let mut body: serde_json::Value = serde_json::from_str(&StatusFactory::keepalive_body(
        &StatusFactory::status_at("svcA", "S", 7000, clock.now()),
    ))
    .expect("body is json");
    body["runtime"] = serde_json::json!({"ExoticVariant": {"depth": 3}});

    let (status, text) = post_keepalive(&router, "/", body.to_string()).await;
    assert_eq!((status, text.as_str()), (StatusCode::OK, "OK\n"));

    // The snapshot serves the preserved raw body, unknown tag included.
    let (_, value) = get_json(&router, "/snapshot/svcA").await;
    assert_eq!(value["keepalive"]["runtime"]["ExoticVariant"]["depth"], 3);

    karl.shutdown().await;
}

#[tokio::test]
async fn method_not_allowed_outside_the_contract() {
    let (karl, _clock) = start_karl().await;
    let router = router_for_peer(&karl, [10, 0, 0, 1]);

    let (status, _) = send(
        &router,
        Request::builder()
            .method("PUT")
            .uri("/")
            .body(Body::empty())
            .expect("build request"),
    )
    .await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

    karl.shutdown().await;
}

#[tokio::test]
async fn html_view_embeds_the_rendered_svg() {
    let (karl, clock) = start_karl().await;
    let router = router_for_peer(&karl, [10, 0, 0, 1]);

    let body = StatusFactory::keepalive_body(&StatusFactory::status_at(
        "svcA",
        "S",
        7000,
        clock.now(),
    ));
    post_keepalive(&router, "/", body).await;
    clock.advance_seconds(1);

    let (status, text) = send(
        &router,
        Request::builder()
            .uri("/?m=5")
            .header(header::ACCEPT, "text/html; charset=utf-8")
            .body(Body::empty())
            .expect("build request"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.starts_with("<!doctype html>"));
    assert!(text.contains("<svg>"));

    karl.shutdown().await;
}

#[tokio::test]
async fn dot_view_lists_window_services() {
    let (karl, clock) = start_karl().await;
    let router = router_for_peer(&karl, [10, 0, 0, 1]);

    let body = StatusFactory::keepalive_body(&StatusFactory::status_at(
        "svcA",
        "S",
        7000,
        clock.now(),
    ));
    post_keepalive(&router, "/", body).await;
    clock.advance_seconds(1);

    let (status, text) = send(
        &router,
        Request::builder()
            .uri("/?dot&m=5")
            .body(Body::empty())
            .expect("build request"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.starts_with("digraph karl {"));
    assert!(text.contains("svcA"));

    karl.shutdown().await;
}

#[tokio::test]
async fn ingest_publishes_to_the_stream_before_the_directory() {
    let (karl, clock) = start_karl().await;
    let router = router_for_peer(&karl, [10, 0, 0, 1]);

    let body = StatusFactory::keepalive_body(&StatusFactory::status_at(
        "svcA",
        "S",
        7000,
        clock.now(),
    ));
    post_keepalive(&router, "/", body).await;

    // After a successful ingest both sides exist; the directory row can never
    // precede its stream entry.
    assert_eq!(karl.state().stream.size(), 1);
    let present = karl
        .storage()
        .read_only(|tables| tables.claires.get(&"svcA".to_string()).is_some())
        .await;
    assert!(present);

    let key = ServiceKey::new("10.0.0.1", 7000);
    let entries = karl.state().stream.iter_all();
    assert_eq!(entries[0].entry.location, key);

    karl.shutdown().await;
}

#[tokio::test]
async fn reported_ping_updates_server_time_skew() {
    let (karl, clock) = start_karl().await;
    let router = router_for_peer(&karl, [10, 0, 0, 1]);

    // The reporter's clock trails Karl's by 3 s; the ping estimate halves out.
    let mut status = StatusFactory::status_at("svcA", "S", 7000, clock.now());
    status.now = clock.now() - MicroDuration::from_seconds(3);
    status.last_successful_ping_epoch_microseconds = Some(MicroDuration::from_micros(200_000));
    post_keepalive(&router, "/", StatusFactory::keepalive_body(&status)).await;

    let skew = karl
        .storage()
        .read_only(|tables| {
            tables
                .servers
                .get(&"10.0.0.1".to_string())
                .map(|server| server.behind_this_by)
        })
        .await;
    assert_eq!(skew, Some(MicroDuration::from_micros(3_000_000 - 100_000)));

    clock.advance_seconds(1);
    let (_, value) = get_json(&router, "/?json&m=5").await;
    assert_eq!(value["machines"]["10.0.0.1"]["time_skew"], "behind by 2.9s");

    karl.shutdown().await;
}
