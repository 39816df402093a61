//! HTTP gateway tests: axum router in front of a pool of reference workers.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use relayvisor::gateway::{Gateway, GatewayRequest, GatewayResponse, http};
use relayvisor::{EventBus, Payload, Pool, PoolConfig, WorkersConfig};

const MAX_REQUEST: usize = 1024 * 1024;

fn pool(mode: &str, allocate_timeout: Duration) -> Arc<Pool> {
    let config = WorkersConfig {
        command: format!(
            "{} internal-worker --mode {} --delay-ms 800",
            env!("CARGO_BIN_EXE_relayvisor"),
            mode
        ),
        pool: PoolConfig {
            num_workers: 1,
            allocate_timeout: allocate_timeout.as_nanos() as u64,
            destroy_timeout: Duration::from_secs(5).as_nanos() as u64,
            ..PoolConfig::default()
        },
        ..WorkersConfig::default()
    };
    Arc::new(Pool::from_config(&config, EventBus::default()).unwrap())
}

fn gateway(pool: Arc<Pool>) -> Arc<Gateway> {
    Arc::new(Gateway::new(pool, EventBus::default()))
}

async fn read_body(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), MAX_REQUEST)
        .await
        .unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_sets_status_and_headers() {
    let app = http::router(gateway(pool("upper", Duration::from_secs(10))), MAX_REQUEST);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/greet?hello=world")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(read_body(response).await, "WORLD");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_body_reaches_worker() {
    let app = http::router(gateway(pool("upper", Duration::from_secs(10))), MAX_REQUEST);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/")
                .body(Body::from("shout"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(read_body(response).await, "SHOUT");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_middleware_short_circuits() {
    let pool = pool("echo", Duration::from_secs(10));
    let gateway = gateway(Arc::clone(&pool));
    gateway.add_middleware(|request: &GatewayRequest| {
        (request.path == "/halt").then(|| GatewayResponse::text(500, "halted"))
    });
    let app = http::router(gateway, MAX_REQUEST);

    let response = app
        .oneshot(Request::builder().uri("/halt").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(read_body(response).await, "halted");
    assert_eq!(pool.stats().jobs, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_busy_pool_returns_503() {
    let pool = pool("slow", Duration::from_millis(100));
    let app = http::router(gateway(Arc::clone(&pool)), MAX_REQUEST);

    let busy = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.exec(&Payload::body_only("occupy")))
    };
    let deadline = Instant::now() + Duration::from_secs(5);
    while pool.stats().working == 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(read_body(response).await, "Service Unavailable");

    assert!(busy.join().unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_error_returns_500() {
    let app = http::router(gateway(pool("error", Duration::from_secs(10))), MAX_REQUEST);

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(read_body(response).await, "Internal Server Error");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_oversized_body_is_rejected() {
    let app = http::router(gateway(pool("echo", Duration::from_secs(10))), 16);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/")
                .body(Body::from(vec![b'x'; 64]))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
